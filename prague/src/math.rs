// Copyright (C) 2025, the prague authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Fixed-point primitives for the congestion-control growth formulas.
//!
//! The multiplicand ordering in the growth formulas is intentional; these
//! primitives keep the intermediate 128-bit width and saturate instead of
//! wrapping so that high bandwidth-delay products stay well defined.

/// 64x64-bit multiply with an optional right shift, saturating to
/// `u64::MAX` when the shifted product does not fit in 64 bits.
pub fn mul_shift(left: u64, right: u64, shift: u32) -> u64 {
    let wide = (u128::from(left) * u128::from(right)) >> shift;

    if wide > u128::from(u64::MAX) {
        return u64::MAX;
    }

    wide as u64
}

/// Rounded 64-bit divide. A zero divisor saturates to `u64::MAX`.
pub fn div_round(dividend: u64, divisor: u64) -> u64 {
    if divisor == 0 {
        return u64::MAX;
    }

    let wide = (u128::from(dividend) + u128::from(divisor >> 1)) /
        u128::from(divisor);

    wide as u64
}
