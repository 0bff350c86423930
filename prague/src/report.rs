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

//! Once-per-second throughput and feedback summaries, emitted at `info`
//! level.

use crate::cc::AckFeedback;
use crate::TimeUs;

const REPORT_INTERVAL: TimeUs = 1_000_000;

pub(crate) struct Reporter {
    role: &'static str,
    report_ts: TimeUs,
    acc_bytes_sent: u64,
    acc_bytes_rcvd: u64,
    acc_rtts: i64,
    count_rtts: i64,
    prev: AckFeedback,
}

impl Reporter {
    pub fn new(role: &'static str, now: TimeUs) -> Reporter {
        Reporter {
            role,
            report_ts: now.wrapping_add(REPORT_INTERVAL),
            acc_bytes_sent: 0,
            acc_bytes_rcvd: 0,
            acc_rtts: 0,
            count_rtts: 0,
            prev: AckFeedback::default(),
        }
    }

    pub fn on_sent(&mut self, bytes: usize) {
        self.acc_bytes_sent += bytes as u64;
    }

    pub fn on_rcvd(&mut self, bytes: usize) {
        self.acc_bytes_rcvd += bytes as u64;
    }

    pub fn on_rtt(&mut self, rtt: TimeUs) {
        self.acc_rtts += i64::from(rtt);
        self.count_rtts += 1;
    }

    /// Emits the summary line once the report interval elapsed.
    pub fn maybe_report(&mut self, now: TimeUs, fb: AckFeedback) {
        if now.wrapping_sub(self.report_ts) < 0 {
            return;
        }

        let elapsed = now
            .wrapping_sub(self.report_ts)
            .wrapping_add(REPORT_INTERVAL) as f32;
        let rate_sent = 8.0 * self.acc_bytes_sent as f32 / elapsed;
        let rate_rcvd = 8.0 * self.acc_bytes_rcvd as f32 / elapsed;

        let rtt = if self.count_rtts > 0 {
            0.001 * self.acc_rtts as f32 / self.count_rtts as f32
        } else {
            0.0
        };

        let packets = fb
            .packets_received
            .wrapping_sub(self.prev.packets_received);
        let marks = fb.packets_ce.wrapping_sub(self.prev.packets_ce);
        let losts = fb.packets_lost.wrapping_sub(self.prev.packets_lost);

        let mark_prob = if packets > 0 {
            100.0 * marks as f32 / packets as f32
        } else {
            0.0
        };
        let loss_prob = if packets > 0 {
            100.0 * losts as f32 / packets as f32
        } else {
            0.0
        };

        info!(
            "[{}]: {:.2} sec, Sent: {:.3} Mbps, Rcvd: {:.3} Mbps, RTT: {:.3} ms, \
             Mark: {:.2}%({}/{}), Lost: {:.2}%({}/{})",
            self.role,
            now as f32 / 1_000_000.0,
            rate_sent,
            rate_rcvd,
            rtt,
            mark_prob,
            marks,
            packets,
            loss_prob,
            losts,
            packets,
        );

        self.report_ts = now.wrapping_add(REPORT_INTERVAL);
        self.acc_bytes_sent = 0;
        self.acc_bytes_rcvd = 0;
        self.acc_rtts = 0;
        self.count_rtts = 0;
        self.prev = fb;
    }
}
