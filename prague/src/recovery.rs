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

//! Sender-side per-sequence packet state and ACK ingest.
//!
//! A ring of 65536 slots tracks every packet in flight. Summary ACKs walk
//! back from the acknowledged sequence number to attribute newly reported
//! losses; block ACKs resolve each covered sequence number individually
//! and can undo a presumed loss when a report arrives late. In real-time
//! mode a second ring attributes packet outcomes to frames.

use smallvec::SmallVec;

use crate::cc::AckFeedback;
use crate::packet::Report;

use crate::Count;
use crate::TimeUs;

/// Number of per-packet slots, per RFC 8888 arithmetic modulo 65536.
pub const PKT_TABLE_SIZE: usize = 65_536;

/// Number of per-frame slots in real-time mode.
pub const FRAME_TABLE_SIZE: usize = 2_048;

/// State of one sent packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SentState {
    /// Slot never used.
    #[default]
    Init,

    /// Sent and not yet resolved.
    Sent,

    /// Reported received.
    Recv,

    /// Presumed lost; may still flip to `Recv` on a late report.
    Lost,
}

/// RTT samples reconstructed from one block ACK, in report order.
pub type RttSamples = SmallVec<[TimeUs; 32]>;

fn index(seq: Count) -> usize {
    seq as u16 as usize
}

fn frame_index(frame_nr: Count) -> usize {
    (frame_nr as u32 as usize) % FRAME_TABLE_SIZE
}

/// Per-frame outcome accounting for real-time mode.
struct FrameTracker {
    outstanding: Vec<Count>,
    lost: Vec<Count>,
    sending: Option<Count>,
    sent_frames: Count,
    recv_frames: Count,
    lost_frames: Count,
}

impl FrameTracker {
    fn new() -> FrameTracker {
        FrameTracker {
            outstanding: vec![0; FRAME_TABLE_SIZE],
            lost: vec![0; FRAME_TABLE_SIZE],
            sending: None,
            sent_frames: 0,
            recv_frames: 0,
            lost_frames: 0,
        }
    }

    fn is_closed(&self, frame_nr: Count) -> bool {
        self.sending != Some(frame_nr)
    }

    fn begin(&mut self, frame_nr: Count) {
        let fi = frame_index(frame_nr);
        self.outstanding[fi] = 0;
        self.lost[fi] = 0;
        self.sending = Some(frame_nr);
    }

    fn close(&mut self, frame_nr: Count) {
        let fi = frame_index(frame_nr);
        self.sending = None;
        self.sent_frames = self.sent_frames.wrapping_add(1);

        // A frame fully resolved while still open settles here; otherwise
        // the remaining packet transitions settle it later.
        if self.lost[fi] > 0 {
            self.lost_frames = self.lost_frames.wrapping_add(1);
        } else if self.outstanding[fi] == 0 {
            self.recv_frames = self.recv_frames.wrapping_add(1);
        }
    }

    fn on_packet_sent(&mut self, frame_nr: Count) {
        self.outstanding[frame_index(frame_nr)] += 1;
    }

    fn on_received(&mut self, frame_nr: Count) {
        let fi = frame_index(frame_nr);
        self.outstanding[fi] -= 1;

        if self.is_closed(frame_nr) &&
            self.outstanding[fi] == 0 &&
            self.lost[fi] == 0
        {
            self.recv_frames = self.recv_frames.wrapping_add(1);
        }
    }

    fn on_lost(&mut self, frame_nr: Count) {
        let fi = frame_index(frame_nr);
        self.outstanding[fi] -= 1;

        if self.is_closed(frame_nr) && self.lost[fi] == 0 {
            self.lost_frames = self.lost_frames.wrapping_add(1);
        }

        self.lost[fi] += 1;
    }

    fn on_loss_undone(&mut self, frame_nr: Count) {
        let fi = frame_index(frame_nr);
        self.lost[fi] -= 1;

        if self.is_closed(frame_nr) && self.lost[fi] == 0 {
            self.lost_frames = self.lost_frames.wrapping_sub(1);

            if self.outstanding[fi] == 0 {
                self.recv_frames = self.recv_frames.wrapping_add(1);
            }
        }
    }

    fn inflight(&self) -> Count {
        Count::from(self.sending.is_some())
            .wrapping_add(self.sent_frames)
            .wrapping_sub(self.recv_frames)
            .wrapping_sub(self.lost_frames)
    }
}

/// Sender packet-state table.
pub struct SentTracker {
    status: Vec<SentState>,
    send_time: Vec<TimeUs>,
    frame_nr: Vec<Count>,

    // High-water mark of block-ACK coverage, strictly monotonic.
    last_ack: Count,

    // Feedback accumulated from block ACKs.
    packets_received: Count,
    packets_ce: Count,
    packets_lost: Count,
    error_l4s: bool,

    // Receiver-echoed cumulative loss count applied so far (summary mode).
    acked_lost: Count,

    frames: Option<FrameTracker>,
}

impl SentTracker {
    /// Creates a tracker; `rt_mode` enables the per-frame accounting.
    pub fn new(rt_mode: bool) -> SentTracker {
        SentTracker {
            status: vec![SentState::Init; PKT_TABLE_SIZE],
            send_time: vec![0; PKT_TABLE_SIZE],
            frame_nr: vec![0; PKT_TABLE_SIZE],
            last_ack: 0,
            packets_received: 0,
            packets_ce: 0,
            packets_lost: 0,
            error_l4s: false,
            acked_lost: 0,
            frames: rt_mode.then(FrameTracker::new),
        }
    }

    fn transition(&mut self, idx: usize, to: SentState) {
        let from = self.status[idx];
        self.status[idx] = to;

        let Some(frames) = self.frames.as_mut() else {
            return;
        };

        let frame_nr = self.frame_nr[idx];
        match (from, to) {
            (SentState::Sent, SentState::Recv) => frames.on_received(frame_nr),
            (SentState::Sent, SentState::Lost) => frames.on_lost(frame_nr),
            (SentState::Lost, SentState::Recv) =>
                frames.on_loss_undone(frame_nr),
            _ => (),
        }
    }

    /// Records a packet transmission. `frame_nr` is 0 in bulk mode.
    pub fn on_packet_sent(&mut self, seq: Count, now: TimeUs, frame_nr: Count) {
        let idx = index(seq);
        self.status[idx] = SentState::Sent;
        self.send_time[idx] = now;
        self.frame_nr[idx] = frame_nr;

        if let Some(frames) = self.frames.as_mut() {
            frames.on_packet_sent(frame_nr);
        }
    }

    /// Starts accounting a new frame.
    pub fn begin_frame(&mut self, frame_nr: Count) {
        if let Some(frames) = self.frames.as_mut() {
            frames.begin(frame_nr);
        }
    }

    /// Closes the frame currently being sent.
    pub fn end_frame(&mut self, frame_nr: Count) {
        if let Some(frames) = self.frames.as_mut() {
            frames.close(frame_nr);
        }
    }

    /// Ingests a summary ACK: the acknowledged packet is received, and
    /// each newly reported loss is attributed walking back from it over
    /// slots still unresolved.
    pub fn on_summary_ack(&mut self, ack_seq: Count, packets_lost: Count) {
        let idx = index(ack_seq);
        if self.status[idx] != SentState::Recv {
            self.transition(idx, SentState::Recv);
        }

        let delta = packets_lost.wrapping_sub(self.acked_lost);
        if delta > 0 {
            let steps = std::cmp::min(delta, PKT_TABLE_SIZE as Count);

            for i in 1..=steps {
                let j = index(ack_seq.wrapping_sub(i));
                if self.status[j] == SentState::Sent {
                    self.transition(j, SentState::Lost);
                }
            }
        }

        self.acked_lost = packets_lost;
    }

    /// Ingests one block ACK, resolving every covered sequence number and
    /// marking the skipped-over ones lost. Returns the RTT samples
    /// reconstructed from the received reports, in report order.
    pub fn on_block_ack(
        &mut self, begin_seq: Count, reports: &[Report], now: TimeUs,
    ) -> RttSamples {
        let mut rtts = RttSamples::new();

        // Everything between the previous coverage and this block that is
        // still unresolved was never reported and counts as lost. A walk
        // of one table span visits every slot, so larger gaps are capped.
        let gap = begin_seq.wrapping_sub(self.last_ack.wrapping_add(1));
        if gap > 0 {
            let steps = std::cmp::min(gap, PKT_TABLE_SIZE as Count);
            let mut next = begin_seq.wrapping_sub(steps);

            for _ in 0..steps {
                let j = index(next);

                if self.status[j] == SentState::Sent {
                    self.packets_lost = self.packets_lost.wrapping_add(1);
                    self.transition(j, SentState::Lost);
                }

                next = next.wrapping_add(1);
            }

            self.last_ack = begin_seq.wrapping_sub(1);
        }

        for (i, report) in reports.iter().enumerate() {
            let seq = begin_seq.wrapping_add(i as Count);
            let j = index(seq);

            if report.is_received() {
                if matches!(self.status[j], SentState::Sent | SentState::Lost) {
                    self.packets_received = self.packets_received.wrapping_add(1);

                    if report.ecn().is_ce() {
                        self.packets_ce = self.packets_ce.wrapping_add(1);
                    }
                    if !report.ecn().is_l4s() {
                        self.error_l4s = true;
                    }

                    rtts.push(
                        now.wrapping_sub(report.delta_us())
                            .wrapping_sub(self.send_time[j]),
                    );

                    if self.status[j] == SentState::Lost {
                        self.packets_lost = self.packets_lost.wrapping_sub(1);
                    }

                    self.transition(j, SentState::Recv);
                }
            } else if self.status[j] == SentState::Sent {
                self.packets_lost = self.packets_lost.wrapping_add(1);
                self.transition(j, SentState::Lost);
            }
        }

        if !reports.is_empty() {
            let end = begin_seq.wrapping_add(reports.len() as Count - 1);
            if end.wrapping_sub(self.last_ack) > 0 {
                self.last_ack = end;
            }
        }

        rtts
    }

    /// Returns the feedback accumulated from block ACKs, in the shape the
    /// congestion controller consumes.
    pub fn feedback(&self) -> AckFeedback {
        AckFeedback {
            packets_received: self.packets_received,
            packets_ce: self.packets_ce,
            packets_lost: self.packets_lost,
            error_l4s: self.error_l4s,
        }
    }

    /// Returns the state of one sequence number's slot.
    pub fn status(&self, seq: Count) -> SentState {
        self.status[index(seq)]
    }

    /// Frames in flight, including the one currently being sent.
    pub fn frame_inflight(&self) -> Count {
        self.frames.as_ref().map_or(0, FrameTracker::inflight)
    }

    /// Returns `(sent, received, lost)` frame totals in real-time mode.
    pub fn frame_counts(&self) -> Option<(Count, Count, Count)> {
        self.frames
            .as_ref()
            .map(|f| (f.sent_frames, f.recv_frames, f.lost_frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::Ecn;

    fn bulk_with_sent(n: Count, t0: TimeUs, spacing: TimeUs) -> SentTracker {
        let mut tracker = SentTracker::new(false);
        for seq in 1..=n {
            tracker.on_packet_sent(
                seq,
                t0.wrapping_add(spacing * (seq - 1)),
                0,
            );
        }
        tracker
    }

    #[test]
    fn summary_ack_walks_back_losses() {
        let mut tracker = bulk_with_sent(10, 1_000, 0);

        tracker.on_summary_ack(10, 2);

        assert_eq!(tracker.status(10), SentState::Recv);
        assert_eq!(tracker.status(9), SentState::Lost);
        assert_eq!(tracker.status(8), SentState::Lost);
        assert_eq!(tracker.status(7), SentState::Sent);

        // No new losses: the walk does not repeat.
        tracker.on_summary_ack(7, 2);
        assert_eq!(tracker.status(7), SentState::Recv);
        assert_eq!(tracker.status(6), SentState::Sent);
    }

    #[test]
    fn summary_ack_walk_skips_resolved_slots() {
        let mut tracker = bulk_with_sent(10, 1_000, 0);

        tracker.on_summary_ack(9, 0);
        tracker.on_summary_ack(10, 1);

        // Slot 9 is already received; only the still-sent slot within the
        // walked distance could have been marked.
        assert_eq!(tracker.status(9), SentState::Recv);
        assert_eq!(tracker.status(8), SentState::Sent);
    }

    #[test]
    fn block_ack_reconstructs_rtts() {
        let t0: TimeUs = 10_000;
        let owd = 5_000;
        let mut tracker = bulk_with_sent(10, t0, 1_000);

        let ack_time = t0.wrapping_add(40_000);
        let reports: Vec<Report> = (1..=10)
            .map(|seq| {
                let arrival = t0 + (seq - 1) * 1_000 + owd;
                Report::received(Ecn::Ect1, ack_time - arrival)
            })
            .collect();

        let rtts = tracker.on_block_ack(1, &reports, ack_time);

        assert_eq!(rtts.len(), 10);
        for rtt in rtts {
            assert!((rtt - owd).abs() <= 1_024, "rtt={rtt}");
        }

        let fb = tracker.feedback();
        assert_eq!(fb.packets_received, 10);
        assert_eq!(fb.packets_lost, 0);
        assert!(!fb.error_l4s);

        for seq in 1..=10 {
            assert_eq!(tracker.status(seq), SentState::Recv);
        }
    }

    #[test]
    fn block_ack_counts_ce_and_bleaching() {
        let mut tracker = bulk_with_sent(3, 1_000, 0);

        let reports = vec![
            Report::received(Ecn::Ect1, 100),
            Report::received(Ecn::Ce, 100),
            Report::received(Ecn::Ect0, 100),
        ];

        tracker.on_block_ack(1, &reports, 2_000);

        let fb = tracker.feedback();
        assert_eq!(fb.packets_received, 3);
        assert_eq!(fb.packets_ce, 1);
        assert!(fb.error_l4s);
    }

    #[test]
    fn gap_before_block_is_lost() {
        let mut tracker = bulk_with_sent(10, 1_000, 0);

        let reports = vec![Report::received(Ecn::Ect1, 100); 5];
        tracker.on_block_ack(6, &reports, 2_000);

        for seq in 1..=5 {
            assert_eq!(tracker.status(seq), SentState::Lost);
        }
        for seq in 6..=10 {
            assert_eq!(tracker.status(seq), SentState::Recv);
        }

        let fb = tracker.feedback();
        assert_eq!(fb.packets_received, 5);
        assert_eq!(fb.packets_lost, 5);
    }

    #[test]
    fn late_report_undoes_loss() {
        let mut tracker = bulk_with_sent(10, 1_000, 0);

        let reports = vec![Report::received(Ecn::Ect1, 100); 5];
        tracker.on_block_ack(6, &reports, 2_000);
        assert_eq!(tracker.feedback().packets_lost, 5);

        // Sequence 3 shows up after all in a later block.
        let late = vec![Report::received(Ecn::Ect1, 100)];
        let rtts = tracker.on_block_ack(3, &late, 3_000);

        assert_eq!(rtts.len(), 1);
        assert_eq!(tracker.status(3), SentState::Recv);

        let fb = tracker.feedback();
        assert_eq!(fb.packets_received, 6);
        assert_eq!(fb.packets_lost, 4);
    }

    #[test]
    fn duplicate_report_not_double_counted() {
        let mut tracker = bulk_with_sent(2, 1_000, 0);

        let reports = vec![Report::received(Ecn::Ect1, 100); 2];
        tracker.on_block_ack(1, &reports, 2_000);
        tracker.on_block_ack(1, &reports, 3_000);

        let fb = tracker.feedback();
        assert_eq!(fb.packets_received, 2);
        assert_eq!(fb.packets_lost, 0);
    }

    #[test]
    fn zero_report_for_unresolved_slot_is_loss() {
        let mut tracker = bulk_with_sent(3, 1_000, 0);

        let reports = vec![
            Report::received(Ecn::Ect1, 100),
            Report::LOST,
            Report::received(Ecn::Ect1, 100),
        ];
        tracker.on_block_ack(1, &reports, 2_000);

        assert_eq!(tracker.status(2), SentState::Lost);
        assert_eq!(tracker.feedback().packets_lost, 1);
    }

    #[test]
    fn frames_complete_on_ack() {
        let mut tracker = SentTracker::new(true);

        tracker.begin_frame(1);
        for seq in 1..=3 {
            tracker.on_packet_sent(seq, 1_000, 1);
        }
        tracker.end_frame(1);

        assert_eq!(tracker.frame_inflight(), 1);

        let reports = vec![Report::received(Ecn::Ect1, 100); 3];
        tracker.on_block_ack(1, &reports, 2_000);

        assert_eq!(tracker.frame_inflight(), 0);
        assert_eq!(tracker.frame_counts(), Some((1, 1, 0)));
    }

    #[test]
    fn frame_with_loss_then_undo() {
        let mut tracker = SentTracker::new(true);

        tracker.begin_frame(1);
        for seq in 1..=3 {
            tracker.on_packet_sent(seq, 1_000, 1);
        }
        tracker.end_frame(1);

        let reports = vec![
            Report::received(Ecn::Ect1, 100),
            Report::LOST,
            Report::received(Ecn::Ect1, 100),
        ];
        tracker.on_block_ack(1, &reports, 2_000);

        assert_eq!(tracker.frame_counts(), Some((1, 0, 1)));
        assert_eq!(tracker.frame_inflight(), 0);

        // The missing packet arrives late: the frame retro-completes.
        let late = vec![Report::received(Ecn::Ect1, 100)];
        tracker.on_block_ack(2, &late, 3_000);

        assert_eq!(tracker.frame_counts(), Some((1, 1, 0)));
        assert_eq!(tracker.frame_inflight(), 0);
    }

    #[test]
    fn frame_loss_while_still_sending() {
        let mut tracker = SentTracker::new(true);

        tracker.begin_frame(1);
        tracker.on_packet_sent(1, 1_000, 1);
        tracker.on_packet_sent(2, 1_000, 1);

        // Feedback beats the end of the frame: the loss is attributed at
        // frame close, not before.
        let reports = vec![Report::received(Ecn::Ect1, 100), Report::LOST];
        tracker.on_block_ack(1, &reports, 2_000);
        assert_eq!(tracker.frame_counts(), Some((0, 0, 0)));
        assert_eq!(tracker.frame_inflight(), 1);

        tracker.end_frame(1);
        assert_eq!(tracker.frame_counts(), Some((1, 0, 1)));
        assert_eq!(tracker.frame_inflight(), 0);
    }

    #[test]
    fn last_ack_is_monotonic_across_wrap() {
        let mut tracker = SentTracker::new(false);

        // Sequence numbers near the 2^31 boundary.
        let base: Count = i32::MAX - 2;
        for i in 0..6 {
            tracker.on_packet_sent(base.wrapping_add(i), 1_000, 0);
        }

        let reports = vec![Report::received(Ecn::Ect1, 100); 6];
        tracker.on_block_ack(base, &reports, 2_000);

        let fb = tracker.feedback();
        assert_eq!(fb.packets_received, 6);
        assert_eq!(fb.packets_lost, 0);

        for i in 0..6 {
            assert_eq!(tracker.status(base.wrapping_add(i)), SentState::Recv);
        }
    }
}
