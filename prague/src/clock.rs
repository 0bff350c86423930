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

use std::time::Instant;

use crate::TimeUs;

/// A monotonic microsecond clock producing wrapping 32-bit timestamps.
///
/// Timestamps have no meaningful reference and wrap every ~4295 seconds, so
/// they must only be compared through wrapping subtraction and a sign test.
/// The value 0 is reserved as the "unset" sentinel on the wire and is never
/// returned.
#[derive(Debug)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    /// Creates a clock whose timestamps count from now.
    pub fn new() -> Clock {
        Clock {
            start: Instant::now(),
        }
    }

    /// Returns the current timestamp in microseconds, never 0.
    pub fn now(&self) -> TimeUs {
        let now = self.start.elapsed().as_micros() as u32 as TimeUs;

        if now == 0 {
            return 1;
        }

        now
    }
}

impl Default for Clock {
    fn default() -> Clock {
        Clock::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_zero() {
        let clock = Clock::new();
        assert_ne!(clock.now(), 0);
    }

    #[test]
    fn monotonic_within_wrap() {
        let clock = Clock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b.wrapping_sub(a) >= 0);
    }
}
