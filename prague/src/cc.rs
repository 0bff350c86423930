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

//! Prague congestion control.
//!
//! The engine keeps a pacing rate and a fractional congestion window (in
//! micro-bytes, so that `window / srtt_us` is a byte rate without scaling
//! constants) and switches between rate-based and window-based updates
//! depending on whether the smoothed RTT is measurable against the pacing
//! interval. ECN CE marks drive a DCTCP-style `alpha` reduction, losses a
//! classic halving with undo support for reordering.
//!
//! Time is injected by the caller as wrapping 32-bit microsecond
//! timestamps (see [`Clock`]); the engine never reads a clock itself.
//!
//! [`Clock`]: ../clock/struct.Clock.html

use std::cmp;

use crate::math::div_round;
use crate::math::mul_shift;

use crate::Bytes;
use crate::Count;
use crate::Ecn;
use crate::Prob;
use crate::Rate;
use crate::TimeUs;
use crate::Window;

use crate::MIN_MTU;

/// Maximum burst duration the pacer may release at once.
pub const BURST_TIME: TimeUs = 250;

/// Virtual RTT floor, stabilizing control at very low RTTs.
pub const REF_RTT: TimeUs = 25_000;

/// Number of fractional bits of the marking probability.
pub const PROB_SHIFT: u32 = 20;

/// Probability of 1.0 in Q-format.
pub const MAX_PROB: Prob = 1 << PROB_SHIFT;

/// EWMA shift of the alpha update (1/16).
pub const ALPHA_SHIFT: u32 = 4;

// Minimally wait 7 virtual RTTs before trying to grow faster.
const MIN_STEP: Rate = 7;

// Wait one more virtual RTT per 1920 kB/s of pacing rate.
const RATE_STEP: Rate = 1_920_000;

// Queue growth target of 1 ms once the waiting RTTs are spent.
const QUEUE_GROWTH: TimeUs = 1_000;

const MIN_PKT_BURST: Count = 1;
const MIN_PKT_WIN: Count = 2;
const MIN_FRAME_WIN: Count = 2;

// +3%/-3% pacing rate swing over the two halves of each virtual RTT.
const RATE_OFFSET: u64 = 3;

/// Default initial pacing rate (100 kbps).
pub const INIT_RATE: Rate = 12_500;

/// Default initial window in packets.
pub const INIT_WINDOW: Count = 10;

/// Default minimum pacing rate (100 kbps).
pub const MIN_RATE: Rate = 12_500;

/// Default maximum pacing rate (100 Gbps).
pub const MAX_RATE: Rate = 12_500_000_000;

/// Congestion-control state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CcState {
    /// No ACK processed yet.
    Init,

    /// Normal congestion avoidance.
    CongAvoid,

    /// A loss reduction was applied within the last RTT.
    InLoss,

    /// A CE reduction was applied within the last RTT.
    InCwr,
}

/// Whether updates apply to the pacing rate or the fractional window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CcaMode {
    /// Window-based updates.
    FracWin,

    /// Rate-based updates, used when the RTT is too small to measure a
    /// queue.
    Rate,
}

/// Receiver counters echoed through an ACK.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AckFeedback {
    /// Cumulative packets received.
    pub packets_received: Count,

    /// Cumulative CE-marked packets.
    pub packets_ce: Count,

    /// Cumulative lost packets; may decrease on reordering.
    pub packets_lost: Count,

    /// Whether the receiver saw a bleached ECN codepoint.
    pub error_l4s: bool,
}

/// Sending parameters derived by the engine.
#[derive(Clone, Copy, Debug)]
pub struct CcInfo {
    /// Rate to pace packets at, in bytes/second.
    pub pacing_rate: Rate,

    /// Congestion window in packets.
    pub packet_window: Count,

    /// Number of packets that can be paced at once.
    pub packet_burst: Count,

    /// Packet size to transmit.
    pub packet_size: Bytes,
}

/// Sending parameters for one frame in real-time mode.
#[derive(Clone, Copy, Debug)]
pub struct VideoCcInfo {
    /// Rate to pace packets at, in bytes/second.
    pub pacing_rate: Rate,

    /// Size of the next frame in bytes.
    pub frame_size: Bytes,

    /// Congestion window in frames.
    pub frame_window: Count,

    /// Number of packets that can be paced at once.
    pub packet_burst: Count,

    /// Packet size to transmit.
    pub packet_size: Bytes,
}

/// Snapshot of the engine state, for logging and statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PragueState {
    /// Congestion-control state.
    pub cc_state: CcState,

    /// Rate- or window-based update mode.
    pub cca_mode: CcaMode,

    /// Smoothed CE-marking probability in Q20 format.
    pub alpha: Prob,

    /// Current pacing rate in bytes/second.
    pub pacing_rate: Rate,

    /// Current fractional window in micro-bytes.
    pub fractional_window: Window,

    /// Current packet size in bytes.
    pub packet_size: Bytes,

    /// Current burst allowance in packets.
    pub packet_burst: Count,

    /// Current window in packets.
    pub packet_window: Count,

    /// Latest RTT sample in microseconds.
    pub rtt: TimeUs,

    /// Smoothed RTT in microseconds.
    pub srtt: TimeUs,

    /// Virtual RTT (srtt floored at [`REF_RTT`]) in microseconds.
    pub vrtt: TimeUs,

    /// Last known receiver-side counters.
    pub packets_received: Count,

    /// Last known receiver-side CE counter.
    pub packets_ce: Count,

    /// Last known receiver-side loss counter.
    pub packets_lost: Count,

    /// Packets sent, as last reported by the pacing loop.
    pub packets_sent: Count,

    /// Latched L4S bleaching error from the peer.
    pub error_l4s: bool,

    /// Own receive counter (receiver role).
    pub r_packets_received: Count,

    /// Own CE counter (receiver role).
    pub r_packets_ce: Count,

    /// Own loss counter (receiver role).
    pub r_packets_lost: Count,

    /// Own bleaching error flag (receiver role).
    pub r_error_l4s: bool,
}

/// The Prague congestion-control engine.
pub struct PragueCc {
    // Parameters.
    init_rate: Rate,
    min_rate: Rate,
    max_rate: Rate,
    max_packet_size: Bytes,
    frame_interval: TimeUs,
    frame_budget: TimeUs,

    // Both-end variables.
    ts_remote: TimeUs,
    rtt: TimeUs,
    srtt: TimeUs,
    vrtt: TimeUs,

    // Receiver-end variables, echoed back to the sender.
    r_prev_ts: TimeUs,
    r_packets_received: Count,
    r_packets_ce: Count,
    r_packets_lost: Count,
    r_error_l4s: bool,

    // Last known receiver-end counters, as a sender.
    cc_ts: TimeUs,
    packets_received: Count,
    packets_ce: Count,
    packets_lost: Count,
    packets_sent: Count,
    error_l4s: bool,

    // Snapshot state for the once-per-vrtt alpha update.
    alpha_ts: TimeUs,
    alpha_packets_received: Count,
    alpha_packets_ce: Count,
    alpha_packets_sent: Count,

    // Snapshot state for loss reduction and its undo.
    loss_ts: TimeUs,
    loss_cca: CcaMode,
    lost_window: Window,
    lost_rate: Rate,
    loss_packets_lost: Count,
    loss_packets_sent: Count,
    lost_rtts_to_growth: Count,

    // Snapshot state for the CE reduction.
    cwr_ts: TimeUs,
    cwr_packets_sent: Count,

    // The actual congestion-control variables.
    cc_state: CcState,
    cca_mode: CcaMode,
    rtts_to_growth: Count,
    alpha: Prob,
    pacing_rate: Rate,
    fractional_window: Window,
    packet_burst: Count,
    packet_size: Bytes,
    packet_window: Count,
}

impl PragueCc {
    /// Creates an engine.
    ///
    /// `fps` of 0 selects bulk mode; `frame_budget` (µs) is only used with
    /// `fps > 0` and is clamped to the frame interval.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        max_packet_size: Bytes, fps: u8, frame_budget: TimeUs, init_rate: Rate,
        init_window: Count, min_rate: Rate, max_rate: Rate, now: TimeUs,
    ) -> PragueCc {
        let frame_interval = if fps != 0 {
            1_000_000 / TimeUs::from(fps)
        } else {
            0
        };

        let init_fracwin = init_window as Window * max_packet_size * 1_000_000;

        let packet_size = (init_rate * REF_RTT as u64 /
            1_000_000 /
            MIN_PKT_WIN as u64)
            .clamp(MIN_MTU, max_packet_size);

        let packet_burst = cmp::max(
            (init_rate * BURST_TIME as u64 / 1_000_000 / packet_size) as Count,
            MIN_PKT_BURST,
        );

        let packet_window = cmp::max(
            ((init_fracwin / 1_000_000 + packet_size - 1) / packet_size) as Count,
            MIN_PKT_WIN,
        );

        PragueCc {
            init_rate,
            min_rate,
            max_rate,
            max_packet_size,
            frame_interval,
            frame_budget: cmp::min(frame_budget, frame_interval),

            ts_remote: 0,
            rtt: 0,
            srtt: 0,
            vrtt: 0,

            r_prev_ts: 0,
            r_packets_received: 0,
            r_packets_ce: 0,
            r_packets_lost: 0,
            r_error_l4s: false,

            cc_ts: now,
            packets_received: 0,
            packets_ce: 0,
            packets_lost: 0,
            packets_sent: 0,
            error_l4s: false,

            alpha_ts: now,
            alpha_packets_received: 0,
            alpha_packets_ce: 0,
            alpha_packets_sent: 0,

            loss_ts: 0,
            loss_cca: CcaMode::FracWin,
            lost_window: 0,
            lost_rate: 0,
            loss_packets_lost: 0,
            loss_packets_sent: 0,
            lost_rtts_to_growth: 0,

            cwr_ts: 0,
            cwr_packets_sent: 0,

            cc_state: CcState::Init,
            cca_mode: CcaMode::FracWin,
            rtts_to_growth: (init_rate / RATE_STEP + MIN_STEP) as Count,
            alpha: 0,
            pacing_rate: init_rate,
            fractional_window: init_fracwin,
            packet_burst,
            packet_size,
            packet_window,
        }
    }

    /// Processes the timestamps of a packet received from the peer,
    /// updating the RTT estimate. Returns `false` when the packet is older
    /// than the previous one and was ignored.
    pub fn packet_received(
        &mut self, timestamp: TimeUs, echoed_timestamp: TimeUs, now: TimeUs,
    ) -> bool {
        if self.cc_state != CcState::Init &&
            self.r_prev_ts.wrapping_sub(timestamp) > 0
        {
            return false;
        }

        // Freeze the remote timestamp; it is defrosted again on echo.
        self.ts_remote = now.wrapping_sub(timestamp);
        self.rtt = now.wrapping_sub(echoed_timestamp);

        if self.cc_state != CcState::Init {
            self.srtt = self
                .srtt
                .wrapping_add(self.rtt.wrapping_sub(self.srtt) >> 3);
        } else {
            self.srtt = self.rtt;
        }

        self.vrtt = cmp::max(self.srtt, REF_RTT);
        self.r_prev_ts = timestamp;

        true
    }

    /// Feeds the RTT samples reconstructed from a block ACK, in report
    /// order.
    pub fn rtt_samples_received(&mut self, samples: &[TimeUs]) {
        for &rtt in samples {
            self.rtt = rtt;

            if self.cc_state != CcState::Init {
                self.srtt = self
                    .srtt
                    .wrapping_add(self.rtt.wrapping_sub(self.srtt) >> 3);
            } else {
                self.srtt = self.rtt;
            }

            self.vrtt = cmp::max(self.srtt, REF_RTT);
        }
    }

    /// Processes ACK feedback and updates all congestion-control outputs.
    ///
    /// `packets_sent` is the caller's count of packets sent so far.
    /// Returns the packets still in flight, or `None` when the ACK is
    /// stale (its cumulative received or CE counter went backwards) and
    /// was rejected without touching any state.
    pub fn ack_received(
        &mut self, fb: AckFeedback, packets_sent: Count, now: TimeUs,
    ) -> Option<Count> {
        let AckFeedback {
            packets_received,
            packets_ce,
            packets_lost,
            error_l4s,
        } = fb;

        // Ignore older or invalid ACKs; these counters cannot go down.
        if self.packets_received.wrapping_sub(packets_received) > 0 ||
            self.packets_ce.wrapping_sub(packets_ce) > 0
        {
            return None;
        }

        let srtt = cmp::max(self.srtt, 1);
        let srtt_us = srtt as u64;
        let vrtt_us = cmp::max(self.vrtt, 1) as u64;

        // Maximum RTT to expect from pacing alone.
        let pacing_interval =
            (self.packet_size * 1_000_000 / self.pacing_rate) as TimeUs;

        // Seed the window from the initial pacing rate.
        if self.cc_state == CcState::Init {
            self.fractional_window = mul_shift(self.pacing_rate, srtt_us, 0);
            self.cc_state = CcState::CongAvoid;
        }

        // Select the rate- or window-based update, keeping the rate stable
        // on switching. Below the pacing interval or 2 ms the RTT is too
        // unstable to identify a queue.
        if srtt <= 2_000 || srtt <= pacing_interval {
            self.cca_mode = CcaMode::Rate;
        } else {
            if self.cca_mode == CcaMode::Rate {
                self.fractional_window = mul_shift(self.pacing_rate, srtt_us, 0);
            }
            self.cca_mode = CcaMode::FracWin;
        }

        let ts = now;

        // Update alpha once both an ack window and a virtual RTT passed.
        if packets_received
            .wrapping_add(packets_lost)
            .wrapping_sub(self.alpha_packets_sent) >
            0 &&
            ts.wrapping_sub(self.alpha_ts).wrapping_sub(self.vrtt) >= 0
        {
            let d_rx = packets_received.wrapping_sub(self.alpha_packets_received);

            if d_rx > 0 {
                let d_ce = packets_ce.wrapping_sub(self.alpha_packets_ce);
                let prob = (Prob::from(d_ce) << PROB_SHIFT) / Prob::from(d_rx);

                self.alpha += (prob - self.alpha) >> ALPHA_SHIFT;
                self.alpha = cmp::min(self.alpha, MAX_PROB);

                self.alpha_packets_sent = packets_sent;
                self.alpha_packets_ce = packets_ce;
                self.alpha_packets_received = packets_received;
                self.alpha_ts = ts;

                if self.rtts_to_growth > 0 {
                    self.rtts_to_growth -= 1;
                }
            }
        }

        // Undo the reduction if the lost count is back down to the one that
        // caused it (reordering, not loss).
        if (self.lost_window > 0 || self.lost_rate > 0) &&
            self.loss_packets_lost.wrapping_sub(packets_lost) >= 0
        {
            self.cca_mode = self.loss_cca;

            if self.cca_mode == CcaMode::Rate {
                self.pacing_rate += self.lost_rate;
                self.lost_rate = 0;
            } else {
                self.fractional_window += self.lost_window;
                self.lost_window = 0;
            }

            self.rtts_to_growth -= self.lost_rtts_to_growth;
            if self.rtts_to_growth < 0 {
                self.rtts_to_growth = 0;
            }
            self.lost_rtts_to_growth = 0;

            self.cc_state = CcState::CongAvoid;

            debug!("loss reduction undone, rate={}", self.pacing_rate);
        }

        // Leave loss recovery once a real and a virtual RTT have passed,
        // keeping the reduction remembered for a later undo.
        if self.cc_state == CcState::InLoss &&
            packets_received
                .wrapping_add(packets_lost)
                .wrapping_sub(self.loss_packets_sent) >
                0 &&
            ts.wrapping_sub(self.loss_ts).wrapping_sub(self.vrtt) >= 0
        {
            self.cc_state = CcState::CongAvoid;
        }

        // Reduce once per RTT when the loss count increased.
        if self.cc_state != CcState::InLoss &&
            self.packets_lost.wrapping_sub(packets_lost) < 0
        {
            // Virtual RTTs until a REF_RTT flow would hit the same
            // bottleneck again; growth stays at one packet until then.
            let rtts = (self.pacing_rate / 2 / self.max_packet_size *
                REF_RTT as u64 /
                vrtt_us *
                REF_RTT as u64 /
                1_000_000) as Count;

            self.lost_rtts_to_growth += rtts - self.rtts_to_growth;
            if self.lost_rtts_to_growth > rtts {
                self.lost_rtts_to_growth = rtts;
            }
            self.rtts_to_growth = rtts;

            match self.cca_mode {
                CcaMode::FracWin => {
                    self.lost_window = self.fractional_window / 2;
                    self.fractional_window -= self.lost_window;
                },

                CcaMode::Rate => {
                    self.lost_rate = self.pacing_rate / 2;
                    self.pacing_rate -= self.lost_rate;
                },
            }

            self.cc_state = CcState::InLoss;
            self.loss_cca = self.cca_mode;
            self.loss_packets_sent = packets_sent;
            self.loss_ts = ts;
            self.loss_packets_lost = self.packets_lost;

            debug!("loss reduction, rate={}", self.pacing_rate);
        }

        // Grow for every non-CE ACK when not in loss recovery.
        let acks = packets_received
            .wrapping_sub(self.packets_received)
            .wrapping_sub(packets_ce.wrapping_sub(self.packets_ce));

        if self.cc_state != CcState::InLoss && acks > 0 {
            let mut increment =
                mul_shift(self.pacing_rate, QUEUE_GROWTH as u64, 0) / 1_000_000;

            if increment < self.max_packet_size || self.rtts_to_growth != 0 {
                increment = self.max_packet_size;
            }

            // W += acks / W * (srtt/vrtt)^2, in micro-bytes and in exactly
            // this order to not lose precision.
            match self.cca_mode {
                CcaMode::FracWin => {
                    let divisor = mul_shift(vrtt_us, vrtt_us, 0);
                    let scaler = div_round(
                        mul_shift(srtt_us * 1_000_000, srtt_us, 0),
                        divisor,
                    );
                    let increase = div_round(
                        mul_shift(
                            mul_shift(acks as u64 * self.packet_size, scaler, 0),
                            1_000_000,
                            0,
                        ),
                        self.fractional_window,
                    );
                    let scaled = mul_shift(increase, increment, 0);

                    self.fractional_window =
                        self.fractional_window.saturating_add(scaled);
                },

                CcaMode::Rate => {
                    let divisor = mul_shift(self.packet_size, 1_000_000, 0);
                    let invscaler = div_round(
                        mul_shift(self.pacing_rate, vrtt_us, 0),
                        divisor,
                    );
                    let increase = div_round(
                        mul_shift(acks as u64 * increment, 1_000_000, 0),
                        vrtt_us,
                    );
                    let scaled = div_round(increase, invscaler);

                    self.pacing_rate = self.pacing_rate.saturating_add(scaled);
                },
            }
        }

        // Leave CWR once a real and a virtual RTT have passed.
        if self.cc_state == CcState::InCwr &&
            packets_received
                .wrapping_add(packets_lost)
                .wrapping_sub(self.cwr_packets_sent) >
                0 &&
            ts.wrapping_sub(self.cwr_ts).wrapping_sub(self.vrtt) >= 0
        {
            self.cc_state = CcState::CongAvoid;
        }

        // Reduce by alpha/2 once per RTT when the CE count increased.
        if self.cc_state == CcState::CongAvoid &&
            self.packets_ce.wrapping_sub(packets_ce) < 0
        {
            self.rtts_to_growth =
                (self.pacing_rate / RATE_STEP + MIN_STEP) as Count;

            match self.cca_mode {
                CcaMode::FracWin =>
                    self.fractional_window -= mul_shift(
                        self.fractional_window,
                        self.alpha as u64,
                        PROB_SHIFT + 1,
                    ),

                CcaMode::Rate =>
                    self.pacing_rate -= mul_shift(
                        self.pacing_rate,
                        self.alpha as u64,
                        PROB_SHIFT + 1,
                    ),
            }

            self.cc_state = CcState::InCwr;
            self.cwr_packets_sent = packets_sent;
            self.cwr_ts = ts;

            debug!(
                "ce reduction, alpha={} rate={}",
                self.alpha, self.pacing_rate
            );
        }

        // Align and limit pacing rate and fractional window.
        if self.cca_mode != CcaMode::Rate {
            self.pacing_rate = self.fractional_window / srtt_us;
        }
        self.pacing_rate = self.pacing_rate.clamp(self.min_rate, self.max_rate);

        self.fractional_window = mul_shift(self.pacing_rate, srtt_us, 0);
        if self.fractional_window == 0 {
            self.fractional_window = 1;
        }

        self.packet_size = (mul_shift(self.pacing_rate, vrtt_us, 0) /
            1_000_000 /
            MIN_PKT_WIN as u64)
            .clamp(MIN_MTU, self.max_packet_size);

        self.packet_burst = cmp::max(
            (self.pacing_rate * BURST_TIME as u64 /
                1_000_000 /
                self.packet_size) as Count,
            MIN_PKT_BURST,
        );

        // The window should not block pacing; allow the 3% higher rate and
        // round up.
        self.packet_window = cmp::max(
            (mul_shift(self.fractional_window, 100 + RATE_OFFSET, 0) /
                100_000_000 /
                self.packet_size) as Count +
                1,
            MIN_PKT_WIN,
        );

        // Remember this ACK for the next one.
        self.cc_ts = ts;
        self.packets_received = packets_received;
        self.packets_ce = packets_ce;
        self.packets_lost = packets_lost;
        self.packets_sent = packets_sent;
        if error_l4s {
            self.error_l4s = true;
        }

        Some(
            packets_sent
                .wrapping_sub(packets_received)
                .wrapping_sub(packets_lost),
        )
    }

    /// Accounts one received data packet with a sequence number, as a
    /// receiver. Gaps raise the loss counter, a reordered arrival lowers
    /// it again.
    pub fn data_received_sequence(&mut self, ip_ecn: Ecn, packet_seq_nr: Count) {
        self.r_packets_received = self.r_packets_received.wrapping_add(1);

        let skipped = packet_seq_nr
            .wrapping_sub(self.r_packets_received)
            .wrapping_sub(self.r_packets_lost);

        if skipped >= 0 {
            self.r_packets_lost = self.r_packets_lost.wrapping_add(skipped);
        } else if self.r_packets_lost > 0 {
            self.r_packets_lost -= 1;
        }

        if ip_ecn.is_ce() {
            self.r_packets_ce = self.r_packets_ce.wrapping_add(1);
        } else if ip_ecn != Ecn::Ect1 {
            self.r_error_l4s = true;
        }
    }

    /// Accounts one received data packet when the caller does its own loss
    /// detection. `packets_lost` is the newly skipped count and may be -1
    /// to undo a previously assumed loss.
    pub fn data_received(&mut self, ip_ecn: Ecn, packets_lost: Count) {
        self.r_packets_received = self.r_packets_received.wrapping_add(1);
        self.r_packets_lost = self.r_packets_lost.wrapping_add(packets_lost);

        if ip_ecn.is_ce() {
            self.r_packets_ce = self.r_packets_ce.wrapping_add(1);
        } else if ip_ecn != Ecn::Ect1 {
            self.r_error_l4s = true;
        }
    }

    /// Rewinds the engine to its initial state after an RTO.
    pub fn reset(&mut self, now: TimeUs) {
        self.cc_ts = now;
        self.cc_state = CcState::Init;
        self.cca_mode = CcaMode::FracWin;
        self.alpha_ts = now;
        self.alpha = 0;
        self.pacing_rate = self.init_rate;
        self.fractional_window = self.max_packet_size * 1_000_000;
        self.packet_burst = MIN_PKT_BURST;
        self.packet_size = self.max_packet_size;
        self.packet_window = MIN_PKT_WIN;
        self.rtts_to_growth = (self.pacing_rate / RATE_STEP + MIN_STEP) as Count;
        self.lost_rtts_to_growth = 0;
    }

    /// Returns the timestamps and ECN codepoint for an outgoing packet.
    pub fn time_info(&self, now: TimeUs) -> (TimeUs, TimeUs, Ecn) {
        let echoed_timestamp = if self.ts_remote != 0 {
            now.wrapping_sub(self.ts_remote)
        } else {
            0
        };

        let ip_ecn = if self.error_l4s {
            Ecn::NotEct
        } else {
            Ecn::Ect1
        };

        (now, echoed_timestamp, ip_ecn)
    }

    /// Returns the parameters the pacing loop needs for the next packet.
    ///
    /// The reported rate swings +3%/-3% across each virtual RTT to absorb
    /// the rounding in the packet window.
    pub fn cc_info(&self, now: TimeUs) -> CcInfo {
        let pacing_rate = if now
            .wrapping_sub(self.alpha_ts)
            .wrapping_sub(self.vrtt >> 1) >=
            0
        {
            self.pacing_rate * 100 / (100 + RATE_OFFSET)
        } else {
            self.pacing_rate * (100 + RATE_OFFSET) / 100
        };

        CcInfo {
            pacing_rate,
            packet_window: self.packet_window,
            packet_burst: self.packet_burst,
            packet_size: self.packet_size,
        }
    }

    /// Returns the parameters the pacing loop needs for the next frame in
    /// real-time mode.
    pub fn video_cc_info(&self) -> VideoCcInfo {
        let budget =
            self.pacing_rate * self.frame_budget as u64 / 1_000_000;
        let frame_size = cmp::max(self.packet_size, budget);

        let frame_window = cmp::max(
            (self.packet_window as u64 * self.packet_size / frame_size) as Count,
            MIN_FRAME_WIN,
        );

        VideoCcInfo {
            pacing_rate: self.pacing_rate,
            frame_size,
            frame_window,
            packet_burst: self.packet_burst,
            packet_size: self.packet_size,
        }
    }

    /// Returns the receiver counters to echo in an outgoing ACK.
    pub fn ack_info(&self) -> AckFeedback {
        AckFeedback {
            packets_received: self.r_packets_received,
            packets_ce: self.r_packets_ce,
            packets_lost: self.r_packets_lost,
            error_l4s: self.r_error_l4s,
        }
    }

    /// Returns the frame interval in microseconds (0 in bulk mode).
    pub fn frame_interval(&self) -> TimeUs {
        self.frame_interval
    }

    /// Returns a snapshot of the engine state for logging.
    pub fn stats(&self) -> PragueState {
        PragueState {
            cc_state: self.cc_state,
            cca_mode: self.cca_mode,
            alpha: self.alpha,
            pacing_rate: self.pacing_rate,
            fractional_window: self.fractional_window,
            packet_size: self.packet_size,
            packet_burst: self.packet_burst,
            packet_window: self.packet_window,
            rtt: self.rtt,
            srtt: self.srtt,
            vrtt: self.vrtt,
            packets_received: self.packets_received,
            packets_ce: self.packets_ce,
            packets_lost: self.packets_lost,
            packets_sent: self.packets_sent,
            error_l4s: self.error_l4s,
            r_packets_received: self.r_packets_received,
            r_packets_ce: self.r_packets_ce,
            r_packets_lost: self.r_packets_lost,
            r_error_l4s: self.r_error_l4s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_cc(now: TimeUs) -> PragueCc {
        PragueCc::new(1400, 0, 0, INIT_RATE, INIT_WINDOW, MIN_RATE, MAX_RATE, now)
    }

    fn fb(received: Count, ce: Count, lost: Count) -> AckFeedback {
        AckFeedback {
            packets_received: received,
            packets_ce: ce,
            packets_lost: lost,
            error_l4s: false,
        }
    }

    /// Feeds a packet whose echoed timestamp makes the RTT sample exactly
    /// `rtt`.
    fn seed_rtt(cc: &mut PragueCc, rtt: TimeUs, now: TimeUs) {
        assert!(cc.packet_received(now, now.wrapping_sub(rtt), now));
    }

    #[test]
    fn initial_outputs() {
        let cc = new_cc(1);
        let s = cc.stats();

        assert_eq!(s.cc_state, CcState::Init);
        assert_eq!(s.pacing_rate, INIT_RATE);
        assert_eq!(s.fractional_window, 10 * 1400 * 1_000_000);
        assert_eq!(s.packet_size, 156);
        assert_eq!(s.packet_burst, 1);
        assert_eq!(s.packet_window, 90);
    }

    #[test]
    fn cold_start_no_loss() {
        let mut now = 1_000;
        let mut cc = new_cc(1);

        seed_rtt(&mut cc, 5_000, now);
        assert_eq!(cc.ack_received(fb(1, 0, 0), 1, now), Some(0));
        assert_eq!(cc.stats().cc_state, CcState::CongAvoid);

        for i in 2..=101 {
            now = now.wrapping_add(5_000);
            seed_rtt(&mut cc, 5_000, now);
            cc.ack_received(fb(i, 0, 0), i, now).unwrap();

            let s = cc.stats();
            assert!(s.pacing_rate <= MAX_RATE);
            assert!(s.fractional_window > 0);
        }

        assert!(cc.stats().pacing_rate > INIT_RATE);
    }

    #[test]
    fn rtt_smoothing_converges() {
        let mut now = 1_000;
        let mut cc = new_cc(1);

        seed_rtt(&mut cc, 40_000, now);
        cc.ack_received(fb(1, 0, 0), 1, now).unwrap();
        assert_eq!(cc.stats().srtt, 40_000);

        let k = 20;
        for _ in 0..k {
            now = now.wrapping_add(10_000);
            seed_rtt(&mut cc, 10_000, now);
        }

        let err = (cc.stats().srtt - 10_000).abs() as f64;
        let bound = 30_000.0 * (7.0f64 / 8.0).powi(k);
        assert!(err <= bound + 8.0, "err={err} bound={bound}");
    }

    #[test]
    fn block_ack_rtt_samples_update_srtt() {
        let mut cc = new_cc(1);

        cc.rtt_samples_received(&[8_000]);
        assert_eq!(cc.stats().srtt, 8_000);
        assert_eq!(cc.stats().vrtt, REF_RTT);

        seed_rtt(&mut cc, 8_000, 1_000);
        cc.ack_received(fb(1, 0, 0), 1, 1_000).unwrap();

        cc.rtt_samples_received(&[16_000]);
        assert_eq!(cc.stats().srtt, 8_000 + (8_000 >> 3));
    }

    #[test]
    fn single_mark_dctcp_reduction() {
        let mut now = 1_000;
        let mut cc = new_cc(1);

        seed_rtt(&mut cc, 25_000, now);
        cc.ack_received(fb(1, 0, 0), 1, now).unwrap();
        assert_eq!(cc.stats().cca_mode, CcaMode::FracWin);

        let before = cc.stats();

        now = now.wrapping_add(25_001);
        seed_rtt(&mut cc, 25_000, now);
        cc.ack_received(fb(2, 1, 0), 2, now).unwrap();

        let after = cc.stats();
        assert_eq!(after.cc_state, CcState::InCwr);

        // First EWMA step from 0 with a 1-in-2 mark fraction.
        let alpha = ((1 as Prob) << PROB_SHIFT) / 2 >> ALPHA_SHIFT;
        assert_eq!(after.alpha, alpha);

        let fw = before.fractional_window;
        let reduced =
            fw - ((fw as u128 * alpha as u128) >> (PROB_SHIFT + 1)) as u64;
        let rate = (reduced / 25_000).clamp(MIN_RATE, MAX_RATE);
        assert_eq!(after.pacing_rate, rate);
        assert_eq!(after.fractional_window, rate * 25_000);

        // A further CE delta within the same virtual RTT is ignored.
        now = now.wrapping_add(1_000);
        seed_rtt(&mut cc, 25_000, now);
        cc.ack_received(fb(3, 2, 0), 3, now).unwrap();

        let again = cc.stats();
        assert_eq!(again.cc_state, CcState::InCwr);
        assert_eq!(again.pacing_rate, after.pacing_rate);
        assert_eq!(again.fractional_window, after.fractional_window);
    }

    #[test]
    fn single_loss_and_undo_is_exact() {
        let mut now = 1_000;
        let mut cc = new_cc(1);

        seed_rtt(&mut cc, 25_000, now);
        cc.ack_received(fb(1, 0, 0), 1, now).unwrap();

        let pre = cc.stats();
        assert_eq!(pre.fractional_window, 312_500_000);

        // A spurious loss halves the window.
        now = now.wrapping_add(100);
        cc.ack_received(fb(1, 0, 1), 3, now).unwrap();

        let mid = cc.stats();
        assert_eq!(mid.cc_state, CcState::InLoss);
        assert_eq!(mid.fractional_window, pre.fractional_window / 2);

        // The loss count dropping back undoes the reduction bit for bit.
        now = now.wrapping_add(100);
        cc.ack_received(fb(1, 0, 0), 3, now).unwrap();

        let post = cc.stats();
        assert_eq!(post.cc_state, CcState::CongAvoid);
        assert_eq!(post.fractional_window, pre.fractional_window);
        assert_eq!(post.pacing_rate, pre.pacing_rate);
    }

    #[test]
    fn loss_within_same_rtt_reduces_once() {
        let mut now = 1_000;
        let mut cc = new_cc(1);

        seed_rtt(&mut cc, 25_000, now);
        cc.ack_received(fb(1, 0, 0), 1, now).unwrap();

        now = now.wrapping_add(100);
        cc.ack_received(fb(1, 0, 1), 3, now).unwrap();
        let first = cc.stats();

        now = now.wrapping_add(100);
        cc.ack_received(fb(1, 0, 2), 4, now).unwrap();
        let second = cc.stats();

        assert_eq!(second.fractional_window, first.fractional_window);
        assert_eq!(second.cc_state, CcState::InLoss);
    }

    #[test]
    fn stale_ack_rejected_without_side_effects() {
        let mut now = 1_000;
        let mut cc = new_cc(1);

        seed_rtt(&mut cc, 25_000, now);
        cc.ack_received(fb(5, 1, 0), 5, now).unwrap();

        let before = cc.stats();

        now = now.wrapping_add(500);
        assert_eq!(cc.ack_received(fb(4, 1, 0), 6, now), None);
        assert_eq!(cc.ack_received(fb(5, 0, 0), 6, now), None);
        assert_eq!(cc.stats(), before);
    }

    #[test]
    fn counter_wraparound_is_ordered() {
        let mut now = 1_000;
        let mut cc = new_cc(1);

        seed_rtt(&mut cc, 25_000, now);
        cc.ack_received(fb(i32::MAX, 0, 0), i32::MAX, now).unwrap();

        // Two packets later the counter wraps past i32::MAX.
        now = now.wrapping_add(500);
        let wrapped = i32::MAX.wrapping_add(2);
        let inflight = cc.ack_received(fb(wrapped, 0, 0), wrapped, now);
        assert_eq!(inflight, Some(0));

        // Anything below the stored counter is stale.
        now = now.wrapping_add(500);
        assert_eq!(cc.ack_received(fb(i32::MAX - 5, 0, 0), wrapped, now), None);
    }

    #[test]
    fn timestamp_wraparound_is_ordered() {
        let start = i32::MAX - 1_000;
        let mut cc = new_cc(start);

        seed_rtt(&mut cc, 3_000, start);
        assert_eq!(cc.stats().srtt, 3_000);
        cc.ack_received(fb(1, 0, 0), 1, start).unwrap();

        // Crossing the 2^31 boundary keeps samples and ordering intact.
        let now = start.wrapping_add(5_000);
        seed_rtt(&mut cc, 3_000, now);
        assert_eq!(cc.stats().srtt, 3_000);

        // An echo older than the previous one is rejected.
        assert!(!cc.packet_received(start, start, now));
    }

    #[test]
    fn mode_is_stable_at_constant_rtt() {
        let mut now = 1_000;
        let mut cc = new_cc(1);

        seed_rtt(&mut cc, 25_000, now);
        cc.ack_received(fb(1, 0, 0), 1, now).unwrap();
        let mode = cc.stats().cca_mode;

        for i in 2..=50 {
            now = now.wrapping_add(25_000);
            seed_rtt(&mut cc, 25_000, now);
            cc.ack_received(fb(i, 0, 0), i, now).unwrap();
            assert_eq!(cc.stats().cca_mode, mode);
        }
    }

    #[test]
    fn rate_to_window_switch_keeps_rate() {
        let mut now = 1_000;
        let mut cc = new_cc(1);

        // A sub-2ms RTT forces rate mode.
        seed_rtt(&mut cc, 1_000, now);
        cc.ack_received(fb(1, 0, 0), 1, now).unwrap();
        assert_eq!(cc.stats().cca_mode, CcaMode::Rate);

        // Push srtt up until it clears both guards; no new acks, so no
        // growth can mask the reseated window.
        for _ in 0..60 {
            now = now.wrapping_add(1_000);
            seed_rtt(&mut cc, 200_000, now);
        }

        let rate_before = cc.stats().pacing_rate;
        cc.ack_received(fb(1, 0, 0), 1, now).unwrap();

        let s = cc.stats();
        assert_eq!(s.cca_mode, CcaMode::FracWin);
        assert_eq!(s.pacing_rate, rate_before);
    }

    #[test]
    fn alpha_stays_within_bounds() {
        let mut now = 1_000;
        let mut cc = new_cc(1);

        seed_rtt(&mut cc, 25_000, now);
        cc.ack_received(fb(1, 0, 0), 1, now).unwrap();

        // Fully marked traffic drives alpha towards MAX_PROB.
        for i in 2..=100 {
            now = now.wrapping_add(25_001);
            seed_rtt(&mut cc, 25_000, now);
            cc.ack_received(fb(i, i - 1, 0), i, now).unwrap();

            let alpha = cc.stats().alpha;
            assert!(alpha >= 0);
            assert!(alpha <= MAX_PROB);
        }

        assert!(cc.stats().alpha > MAX_PROB / 2);
    }

    #[test]
    fn receiver_reorder_without_loss() {
        let mut cc = new_cc(1);

        cc.data_received_sequence(Ecn::Ect1, 1);
        assert_eq!(cc.ack_info().packets_lost, 0);

        cc.data_received_sequence(Ecn::Ect1, 3);
        assert_eq!(cc.ack_info().packets_lost, 1);

        cc.data_received_sequence(Ecn::Ect1, 2);
        let info = cc.ack_info();
        assert_eq!(info.packets_lost, 0);
        assert_eq!(info.packets_received, 3);
        assert!(!info.error_l4s);
    }

    #[test]
    fn receiver_with_external_loss_detection() {
        let mut cc = new_cc(1);

        cc.data_received(Ecn::Ect1, 0);
        cc.data_received(Ecn::Ce, 2);
        let info = cc.ack_info();
        assert_eq!(info.packets_received, 2);
        assert_eq!(info.packets_ce, 1);
        assert_eq!(info.packets_lost, 2);

        // A late arrival undoes one presumed loss.
        cc.data_received(Ecn::Ect1, -1);
        assert_eq!(cc.ack_info().packets_lost, 1);
    }

    #[test]
    fn receiver_counts_ce_and_detects_bleaching() {
        let mut cc = new_cc(1);

        cc.data_received_sequence(Ecn::Ect1, 1);
        cc.data_received_sequence(Ecn::Ce, 2);
        let info = cc.ack_info();
        assert_eq!(info.packets_ce, 1);
        assert!(!info.error_l4s);

        // A bleached codepoint latches the error.
        cc.data_received_sequence(Ecn::NotEct, 3);
        assert!(cc.ack_info().error_l4s);

        cc.data_received_sequence(Ecn::Ect1, 4);
        assert!(cc.ack_info().error_l4s);
    }

    #[test]
    fn bleach_error_downgrades_outgoing_ecn() {
        let mut now = 1_000;
        let mut cc = new_cc(1);

        let (_, _, ecn) = cc.time_info(now);
        assert_eq!(ecn, Ecn::Ect1);

        seed_rtt(&mut cc, 25_000, now);
        now = now.wrapping_add(100);
        cc.ack_received(
            AckFeedback {
                packets_received: 1,
                packets_ce: 0,
                packets_lost: 0,
                error_l4s: true,
            },
            1,
            now,
        )
        .unwrap();

        let (_, _, ecn) = cc.time_info(now);
        assert_eq!(ecn, Ecn::NotEct);

        // The latch never resets.
        now = now.wrapping_add(100);
        cc.ack_received(fb(2, 0, 0), 2, now).unwrap();
        let (_, _, ecn) = cc.time_info(now);
        assert_eq!(ecn, Ecn::NotEct);
    }

    #[test]
    fn echo_timestamp_defrost() {
        let mut cc = new_cc(1);

        let (_, echoed, _) = cc.time_info(500);
        assert_eq!(echoed, 0);

        // The peer stamped 1_000 and we received the packet at 10_000.
        assert!(cc.packet_received(1_000, 8_000, 10_000));

        // The frozen peer time advances with our own clock.
        let (ts, echoed, _) = cc.time_info(11_000);
        assert_eq!(ts, 11_000);
        assert_eq!(echoed, 2_000);
    }

    #[test]
    fn reported_rate_swings_over_a_vrtt() {
        let mut cc = new_cc(1);
        seed_rtt(&mut cc, 25_000, 1_000);
        cc.ack_received(fb(1, 0, 0), 1, 1_000).unwrap();

        let s = cc.stats();

        // alpha_ts is still the construction time (1); just after it the
        // swing is positive, past vrtt/2 it is negative.
        let hi = cc.cc_info(1 + 100).pacing_rate;
        let lo = cc.cc_info(1 + 20_000).pacing_rate;

        assert_eq!(hi, s.pacing_rate * 103 / 100);
        assert_eq!(lo, s.pacing_rate * 100 / 103);
        assert!(hi > lo);
    }

    #[test]
    fn reset_returns_to_init() {
        let mut now = 1_000;
        let mut cc = new_cc(1);

        seed_rtt(&mut cc, 5_000, now);
        for i in 1..=20 {
            now = now.wrapping_add(5_000);
            seed_rtt(&mut cc, 5_000, now);
            cc.ack_received(fb(i, 0, 0), i, now).unwrap();
        }
        assert!(cc.stats().pacing_rate > INIT_RATE);

        cc.reset(now);

        let s = cc.stats();
        assert_eq!(s.cc_state, CcState::Init);
        assert_eq!(s.pacing_rate, INIT_RATE);
        assert_eq!(s.fractional_window, 1400 * 1_000_000);
        assert_eq!(s.packet_size, 1400);
        assert_eq!(s.packet_burst, 1);
        assert_eq!(s.packet_window, 2);
        assert_eq!(s.alpha, 0);
    }

    #[test]
    fn video_info_scales_frame_from_budget() {
        let mut cc =
            PragueCc::new(1400, 50, 10_000, INIT_RATE, 10, MIN_RATE, MAX_RATE, 1);

        // At the initial rate the budget is worth less than a packet.
        let v = cc.video_cc_info();
        assert_eq!(v.frame_size, v.packet_size);
        assert!(v.frame_window >= 2);

        // Grow the rate; the frame now covers a budget worth of bytes.
        let mut now = 1_000;
        seed_rtt(&mut cc, 25_000, now);
        for i in 1..=200 {
            now = now.wrapping_add(25_001);
            seed_rtt(&mut cc, 25_000, now);
            cc.ack_received(fb(i, 0, 0), i, now).unwrap();
        }

        let s = cc.stats();
        let v = cc.video_cc_info();
        assert_eq!(v.pacing_rate, s.pacing_rate);
        assert_eq!(
            v.frame_size,
            std::cmp::max(s.packet_size, s.pacing_rate * 10_000 / 1_000_000)
        );
    }

    #[test]
    fn frame_budget_clamped_to_interval() {
        let cc =
            PragueCc::new(1400, 100, 50_000, INIT_RATE, 10, MIN_RATE, MAX_RATE, 1);

        // 100 fps caps the budget at 10 ms.
        assert_eq!(cc.frame_interval(), 10_000);

        let v = cc.video_cc_info();
        assert!(v.frame_size <= cmp::max(v.packet_size, INIT_RATE / 100));
    }
}
