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

//! Receiver-side per-sequence packet state and block-ACK generation.
//!
//! Arrivals are stamped into a ring of 65536 slots; a contiguous window
//! `[start_seq, end_seq)` tracks what still needs reporting. Each emitted
//! block ACK covers a prefix of the window and moves every covered slot to
//! `Ackd` or `Lost`.

use crate::packet::Packet;
use crate::packet::Report;
use crate::packet::RFC8888_ACK_HDR_LEN;
use crate::recovery::PKT_TABLE_SIZE;

use crate::Bytes;
use crate::Count;
use crate::Ecn;
use crate::TimeUs;

/// How long an already acknowledged slot keeps its arrival time valid for
/// re-reporting. Guards against stale arrival times after a wrap.
pub const RCV_TIMEOUT: TimeUs = 250_000;

/// State of one received sequence number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecvState {
    /// Slot never used.
    #[default]
    Init,

    /// Received, not reported yet.
    Recv,

    /// Reported as received in a block ACK.
    Ackd,

    /// Reported as not received in a block ACK.
    Lost,
}

fn index(seq: Count) -> usize {
    seq as u16 as usize
}

/// Receiver packet-state table.
pub struct RecvTracker {
    arrival: Vec<TimeUs>,
    ecn: Vec<Ecn>,
    status: Vec<RecvState>,
    start_seq: Count,
    end_seq: Count,
}

impl RecvTracker {
    /// Creates an empty table.
    pub fn new() -> RecvTracker {
        RecvTracker {
            arrival: vec![0; PKT_TABLE_SIZE],
            ecn: vec![Ecn::NotEct; PKT_TABLE_SIZE],
            status: vec![RecvState::Init; PKT_TABLE_SIZE],
            start_seq: 0,
            end_seq: 0,
        }
    }

    /// Records one received data packet.
    ///
    /// A duplicate of an unreported arrival only promotes the recorded ECN
    /// codepoint to CE; a duplicate of an already reported one re-arms the
    /// slot with the fresh arrival time.
    pub fn on_data(&mut self, seq: Count, ecn: Ecn, now: TimeUs) {
        let idx = index(seq);
        let table = PKT_TABLE_SIZE as Count;

        if self.start_seq == self.end_seq {
            self.start_seq = seq;
            self.end_seq = seq.wrapping_add(1);
        } else if self.start_seq.wrapping_sub(seq) <= 0 &&
            self.start_seq.wrapping_add(table).wrapping_sub(seq) > 0 &&
            seq.wrapping_add(1).wrapping_sub(self.end_seq) > 0
        {
            self.end_seq = seq.wrapping_add(1);
        } else if self.end_seq.wrapping_sub(seq) > 0 &&
            self.end_seq.wrapping_sub(table).wrapping_sub(seq) <= 0 &&
            seq.wrapping_sub(self.start_seq) < 0
        {
            self.start_seq = seq;
        }

        if self.status[idx] != RecvState::Recv {
            self.arrival[idx] = now;
            self.ecn[idx] = ecn;
            self.status[idx] = RecvState::Recv;
        } else if ecn.is_ce() {
            self.ecn[idx] = Ecn::Ce;
        }
    }

    /// Returns whether sequence numbers are waiting to be reported.
    pub fn has_pending(&self) -> bool {
        self.start_seq != self.end_seq
    }

    /// Builds the next block ACK, covering as much of the pending window
    /// as fits a `max_pkt`-byte datagram, and advances the window past the
    /// covered range.
    ///
    /// Every covered slot transitions to `Ackd` (reported received, if its
    /// arrival is fresher than [`RCV_TIMEOUT`]) or `Lost` (zero report).
    pub fn next_block_ack(&mut self, now: TimeUs, max_pkt: Bytes) -> Packet {
        let cap = ((max_pkt as usize - RFC8888_ACK_HDR_LEN) / Report::LEN)
            as Count;
        let pending = self.end_seq.wrapping_sub(self.start_seq);
        let count = std::cmp::min(pending, cap);

        let begin_seq = self.start_seq;
        let mut reports = Vec::with_capacity(count as usize);

        for i in 0..count {
            let idx = index(begin_seq.wrapping_add(i));

            let fresh = self.status[idx] == RecvState::Recv ||
                (self.status[idx] == RecvState::Ackd &&
                    self.arrival[idx]
                        .wrapping_add(RCV_TIMEOUT)
                        .wrapping_sub(now) >
                        0);

            let report = if fresh {
                self.status[idx] = RecvState::Ackd;
                Report::received(
                    self.ecn[idx],
                    now.wrapping_sub(self.arrival[idx]),
                )
            } else {
                self.status[idx] = RecvState::Lost;
                Report::LOST
            };

            reports.push(report);
        }

        self.start_seq = begin_seq.wrapping_add(count);

        Packet::BlockAck { begin_seq, reports }
    }

    /// Returns the state of one sequence number's slot.
    pub fn status(&self, seq: Count) -> RecvState {
        self.status[index(seq)]
    }
}

impl Default for RecvTracker {
    fn default() -> RecvTracker {
        RecvTracker::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reports_of(pkt: &Packet) -> (Count, Vec<Report>) {
        match pkt {
            Packet::BlockAck { begin_seq, reports } =>
                (*begin_seq, reports.clone()),
            _ => panic!("not a block ack"),
        }
    }

    #[test]
    fn every_pending_seq_reported_exactly_once() {
        let mut tracker = RecvTracker::new();

        for seq in [1, 2, 4, 5] {
            tracker.on_data(seq, Ecn::Ect1, 1_000 + seq);
        }

        let pkt = tracker.next_block_ack(10_000, 1_400);
        let (begin, reports) = reports_of(&pkt);

        assert_eq!(begin, 1);
        assert_eq!(reports.len(), 5);

        assert!(reports[0].is_received());
        assert!(reports[1].is_received());
        assert!(!reports[2].is_received());
        assert!(reports[3].is_received());
        assert!(reports[4].is_received());

        assert_eq!(tracker.status(3), RecvState::Lost);
        assert_eq!(tracker.status(4), RecvState::Ackd);

        // The window is drained; nothing is re-reported.
        assert!(!tracker.has_pending());
    }

    #[test]
    fn reports_carry_ecn_and_arrival_offset() {
        let mut tracker = RecvTracker::new();

        tracker.on_data(1, Ecn::Ce, 1_000);

        let now = 1_000 + 25 * 1_024;
        let pkt = tracker.next_block_ack(now, 1_400);
        let (_, reports) = reports_of(&pkt);

        assert_eq!(reports[0].ecn(), Ecn::Ce);
        assert_eq!(reports[0].delta_us(), 25 * 1_024);
    }

    #[test]
    fn duplicate_arrival_promotes_ecn_to_ce_only() {
        let mut tracker = RecvTracker::new();

        tracker.on_data(1, Ecn::Ect1, 1_000);
        tracker.on_data(1, Ecn::Ce, 2_000);

        let pkt = tracker.next_block_ack(3_000, 1_400);
        let (_, reports) = reports_of(&pkt);

        assert_eq!(reports[0].ecn(), Ecn::Ce);
        // The arrival time of the first copy is kept.
        assert_eq!(reports[0].delta_us(), 2 * 1_024);
    }

    #[test]
    fn drained_window_restarts_at_reordered_seq() {
        let mut tracker = RecvTracker::new();

        tracker.on_data(5, Ecn::Ect1, 1_000);
        let pkt = tracker.next_block_ack(1_500, 1_400);
        let (begin, reports) = reports_of(&pkt);
        assert_eq!((begin, reports.len()), (5, 1));

        // After a drain the window restarts at whatever arrives next.
        tracker.on_data(3, Ecn::Ect1, 2_000);
        let pkt = tracker.next_block_ack(2_500, 1_400);
        let (begin, reports) = reports_of(&pkt);
        assert_eq!((begin, reports.len()), (3, 1));
        assert!(reports[0].is_received());
    }

    #[test]
    fn reopened_window_rereports_fresh_ackd_slot() {
        let mut tracker = RecvTracker::new();

        tracker.on_data(5, Ecn::Ect1, 1_000);
        tracker.next_block_ack(1_500, 1_400);
        assert_eq!(tracker.status(5), RecvState::Ackd);

        // A reorder below the open window drags it back over slot 5.
        tracker.on_data(7, Ecn::Ect1, 2_000);
        tracker.on_data(4, Ecn::Ect1, 2_100);

        let pkt = tracker.next_block_ack(2_500, 1_400);
        let (begin, reports) = reports_of(&pkt);
        assert_eq!((begin, reports.len()), (4, 4));

        assert!(reports[0].is_received()); // seq 4
        assert!(reports[1].is_received()); // seq 5, acked but still fresh
        assert!(!reports[2].is_received()); // seq 6, never seen
        assert!(reports[3].is_received()); // seq 7
        assert_eq!(tracker.status(5), RecvState::Ackd);
        assert_eq!(tracker.status(6), RecvState::Lost);
    }

    #[test]
    fn stale_ackd_slot_not_rereported() {
        let mut tracker = RecvTracker::new();

        tracker.on_data(5, Ecn::Ect1, 1_000);
        tracker.next_block_ack(1_500, 1_400);

        // Much later, a reorder drags the window over slot 5 again; its
        // arrival time is no longer trustworthy.
        let late = 1_000 + RCV_TIMEOUT + 1;
        tracker.on_data(7, Ecn::Ect1, late);
        tracker.on_data(4, Ecn::Ect1, late);

        let pkt = tracker.next_block_ack(late, 1_400);
        let (_, reports) = reports_of(&pkt);

        assert!(reports[0].is_received()); // seq 4
        assert!(!reports[1].is_received()); // seq 5, timed out
        assert!(!reports[2].is_received()); // seq 6, never seen
        assert!(reports[3].is_received()); // seq 7
        assert_eq!(tracker.status(5), RecvState::Lost);
    }

    #[test]
    fn large_window_split_across_datagrams() {
        let mut tracker = RecvTracker::new();

        for seq in 1..=20 {
            tracker.on_data(seq, Ecn::Ect1, 1_000);
        }

        // Room for 10 reports per datagram: (27 - 7) / 2.
        let pkt = tracker.next_block_ack(2_000, 27);
        let (begin, reports) = reports_of(&pkt);
        assert_eq!((begin, reports.len()), (1, 10));
        assert!(tracker.has_pending());

        let pkt = tracker.next_block_ack(2_000, 27);
        let (begin, reports) = reports_of(&pkt);
        assert_eq!((begin, reports.len()), (11, 10));
        assert!(!tracker.has_pending());
    }

    #[test]
    fn window_update_is_wrap_safe() {
        let mut tracker = RecvTracker::new();

        let base: Count = i32::MAX - 1;
        tracker.on_data(base, Ecn::Ect1, 1_000);
        tracker.on_data(base.wrapping_add(2), Ecn::Ect1, 1_100);

        let pkt = tracker.next_block_ack(2_000, 1_400);
        let (begin, reports) = reports_of(&pkt);

        assert_eq!(begin, base);
        assert_eq!(reports.len(), 3);
        assert!(reports[0].is_received());
        assert!(!reports[1].is_received());
        assert!(reports[2].is_received());
        assert!(!tracker.has_pending());
    }
}
