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

//! Sender pacing loop, in bulk and real-time frame mode.

use std::cmp;
use std::io;
use std::net::SocketAddr;

use crate::cc::AckFeedback;
use crate::cc::PragueCc;
use crate::clock::Clock;
use crate::packet::Packet;
use crate::recovery::SentTracker;
use crate::report::Reporter;
use crate::socket::UdpEcnSocket;

use crate::Config;
use crate::Count;
use crate::Error;
use crate::Result;
use crate::TimeUs;
use crate::BUFFER_SIZE;
use crate::MIN_MTU;

// How long to wait for feedback when window-limited before declaring an
// RTO.
const SND_TIMEOUT: TimeUs = 1_000_000;

/// The congestion-controlled sending endpoint.
///
/// [`run()`] paces dummy data towards the peer forever, driven by the
/// summary or block ACKs it receives. It only returns on a fatal socket
/// error or after too many consecutive retransmission timeouts.
///
/// [`run()`]: struct.Sender.html#method.run
pub struct Sender {
    socket: UdpEcnSocket,
    cc: PragueCc,
    tracker: SentTracker,
    clock: Clock,
    reporter: Reporter,
    connect: bool,
    rt_mode: bool,
    max_timeouts: u32,

    seq: Count,
    inflight: Count,
    consecutive_rtos: u32,
}

impl Sender {
    /// Creates a sender from the given configuration.
    pub fn new(config: &Config) -> Result<Sender> {
        let addr = SocketAddr::new(config.addr, config.port);
        let socket = if config.connect {
            UdpEcnSocket::connect(addr)?
        } else {
            UdpEcnSocket::bind(addr)?
        };

        let clock = Clock::new();
        let now = clock.now();

        let fps = if config.rt_mode { config.fps } else { 0 };
        let cc = PragueCc::new(
            config.max_packet_size,
            fps,
            config.frame_duration,
            crate::cc::INIT_RATE,
            crate::cc::INIT_WINDOW,
            crate::cc::MIN_RATE,
            config.max_rate,
            now,
        );

        Ok(Sender {
            socket,
            cc,
            tracker: SentTracker::new(config.rt_mode),
            clock,
            reporter: Reporter::new("SENDER", now),
            connect: config.connect,
            rt_mode: config.rt_mode,
            max_timeouts: config.max_timeouts,
            seq: 0,
            inflight: 0,
            consecutive_rtos: 0,
        })
    }

    /// Returns a snapshot of the congestion-control state.
    pub fn stats(&self) -> crate::cc::PragueState {
        self.cc.stats()
    }

    /// Runs the pacing loop until a fatal error or RTO escalation.
    pub fn run(&mut self) -> Result<()> {
        if self.rt_mode {
            self.run_rt()
        } else {
            self.run_bulk()
        }
    }

    // A passive sender waits for the peer's trigger datagram to learn
    // where to send.
    fn wait_for_peer(&mut self, buf: &mut [u8]) -> Result<()> {
        while self.socket.peer().is_none() {
            let (len, _) = self.socket.recv(buf, 0)?;
            let now = self.clock.now();
            self.process_feedback(&buf[..len], now);
        }

        info!("peer {:?} connected", self.socket.peer());
        Ok(())
    }

    fn run_bulk(&mut self) -> Result<()> {
        let mut buf = vec![0u8; BUFFER_SIZE];

        if !self.connect {
            self.wait_for_peer(&mut buf)?;
        }

        let mut now = self.clock.now();
        let mut next_send = now;
        let mut info = self.cc.cc_info(now);

        loop {
            let mut in_burst: Count = 0;
            let mut burst_start: TimeUs = 0;
            now = self.clock.now();

            while self.inflight < info.packet_window &&
                in_burst < info.packet_burst &&
                next_send.wrapping_sub(now) <= 0
            {
                let (timestamp, echoed_timestamp, ecn) = self.cc.time_info(now);

                if in_burst == 0 {
                    burst_start = now;
                }

                self.seq = self.seq.wrapping_add(1);
                let pkt = Packet::Data {
                    timestamp,
                    echoed_timestamp,
                    seq_nr: self.seq,
                };

                let hdr_len = {
                    let mut b = octets::OctetsMut::with_slice(&mut buf);
                    pkt.to_bytes(&mut b)?
                };
                let size = cmp::max(info.packet_size as usize, hdr_len);

                let sent = self.socket.send(&buf[..size], ecn)?;
                if sent != size {
                    return Err(Error::Io(io::ErrorKind::WriteZero));
                }

                self.tracker.on_packet_sent(self.seq, now, 0);
                self.reporter.on_sent(size);

                trace!(
                    "tx seq={} ts={} size={} inflight={}/{} burst={}/{}",
                    self.seq,
                    timestamp,
                    size,
                    self.inflight,
                    info.packet_window,
                    in_burst,
                    info.packet_burst
                );

                in_burst += 1;
                self.inflight += 1;
            }

            if in_burst > 0 {
                let interval = (info.packet_size * in_burst as u64 * 1_000_000 /
                    info.pacing_rate) as TimeUs;

                // Schedule from the planned send time rather than the
                // actual burst start, recovering up to one interval of
                // receive-wait overshoot per burst.
                let overshoot =
                    burst_start.wrapping_sub(next_send).clamp(0, interval);
                next_send = burst_start
                    .wrapping_add(interval)
                    .wrapping_sub(overshoot);
            }

            now = self.clock.now();
            let window_limited = self.inflight >= info.packet_window;
            let wait_until = if window_limited {
                now.wrapping_add(SND_TIMEOUT)
            } else {
                next_send
            };

            let received = self.recv_until(&mut buf, wait_until)?;
            now = self.clock.now();

            if received > 0 {
                self.process_feedback(&buf[..received], now);
            } else if window_limited {
                self.on_rto(now)?;
                next_send = now;
            }

            info = self.cc.cc_info(self.clock.now());
            self.reporter.maybe_report(now, self.feedback_for_report());
        }
    }

    fn run_rt(&mut self) -> Result<()> {
        let mut buf = vec![0u8; BUFFER_SIZE];

        if !self.connect {
            self.wait_for_peer(&mut buf)?;
        }

        let frame_interval = self.cc.frame_interval();

        let mut now = self.clock.now();
        let mut next_frame = now;
        let mut next_send = now;
        let mut video = self.cc.video_cc_info();

        let mut frame_nr: Count = 0;
        let mut frame_sent: Count = 0;
        let mut frame_size: Count = 0;
        let mut sending = false;

        loop {
            now = self.clock.now();

            // Admit the next frame on its tick, when enough frames have
            // been resolved.
            if !sending && next_frame.wrapping_sub(now) <= 0 {
                video = self.cc.video_cc_info();

                if self.tracker.frame_inflight() <= video.frame_window {
                    frame_nr = frame_nr.wrapping_add(1);
                    frame_sent = 0;
                    frame_size = video.frame_size as Count;
                    sending = true;
                    self.tracker.begin_frame(frame_nr);

                    trace!(
                        "frame {} start, size={} window={}",
                        frame_nr,
                        frame_size,
                        video.frame_window
                    );
                }

                // Skip over ticks we are too late for.
                while next_frame.wrapping_sub(now) <= 0 {
                    next_frame = next_frame.wrapping_add(frame_interval);
                }
            }

            let mut in_burst: Count = 0;
            let mut burst_start: TimeUs = 0;
            let mut burst_bytes: u64 = 0;

            while sending &&
                in_burst < video.packet_burst &&
                next_send.wrapping_sub(now) <= 0
            {
                let remaining = (frame_size - frame_sent) as u64;

                // The last packet of a frame is trimmed, but never below
                // the minimum MTU.
                let size =
                    cmp::max(cmp::min(video.packet_size, remaining), MIN_MTU);

                let (timestamp, echoed_timestamp, ecn) = self.cc.time_info(now);

                if in_burst == 0 {
                    burst_start = now;
                }

                self.seq = self.seq.wrapping_add(1);
                let pkt = Packet::RtData {
                    timestamp,
                    echoed_timestamp,
                    seq_nr: self.seq,
                    frame_nr,
                    frame_sent,
                    frame_size,
                };

                let hdr_len = {
                    let mut b = octets::OctetsMut::with_slice(&mut buf);
                    pkt.to_bytes(&mut b)?
                };
                let size = cmp::max(size as usize, hdr_len);

                let sent = self.socket.send(&buf[..size], ecn)?;
                if sent != size {
                    return Err(Error::Io(io::ErrorKind::WriteZero));
                }

                self.tracker.on_packet_sent(self.seq, now, frame_nr);
                self.reporter.on_sent(size);

                trace!(
                    "tx seq={} frame={} sent={}/{} size={}",
                    self.seq,
                    frame_nr,
                    frame_sent,
                    frame_size,
                    size
                );

                frame_sent += size as Count;
                burst_bytes += size as u64;
                in_burst += 1;
                self.inflight += 1;

                if frame_sent >= frame_size {
                    sending = false;
                    self.tracker.end_frame(frame_nr);
                }
            }

            if in_burst > 0 {
                let interval =
                    (burst_bytes * 1_000_000 / video.pacing_rate) as TimeUs;
                let overshoot =
                    burst_start.wrapping_sub(next_send).clamp(0, interval);
                next_send = burst_start
                    .wrapping_add(interval)
                    .wrapping_sub(overshoot);
            }

            now = self.clock.now();
            let blocked = !sending &&
                self.tracker.frame_inflight() > video.frame_window;
            let wait_until = if sending {
                next_send
            } else if blocked {
                now.wrapping_add(SND_TIMEOUT)
            } else {
                next_frame
            };

            let received = self.recv_until(&mut buf, wait_until)?;
            now = self.clock.now();

            if received > 0 {
                self.process_feedback(&buf[..received], now);
            } else if blocked {
                self.on_rto(now)?;
                self.tracker = SentTracker::new(true);
                sending = false;
                next_send = now;
            }

            self.reporter.maybe_report(now, self.feedback_for_report());
        }
    }

    // Waits for one datagram until `wait_until`, retrying early wakeups.
    // Returns 0 when the deadline passed without traffic.
    fn recv_until(
        &mut self, buf: &mut [u8], wait_until: TimeUs,
    ) -> Result<usize> {
        loop {
            let now = self.clock.now();
            let remaining = wait_until.wrapping_sub(now);
            let timeout = if remaining > 0 { remaining } else { 1 };

            let (len, _ecn) = self.socket.recv(buf, timeout)?;
            if len != 0 {
                return Ok(len);
            }

            if wait_until.wrapping_sub(self.clock.now()) <= 0 {
                return Ok(0);
            }
        }
    }

    // Ingests one feedback datagram. Returns whether it advanced the
    // congestion controller.
    fn process_feedback(&mut self, data: &[u8], now: TimeUs) -> bool {
        let mut b = octets::Octets::with_slice(data);

        let valid = match Packet::from_bytes(&mut b) {
            Ok(Packet::Ack {
                ack_seq,
                timestamp,
                echoed_timestamp,
                packets_received,
                packets_ce,
                packets_lost,
                error_l4s,
            }) => {
                // A trigger ACK sent before any data carries no echo and
                // cannot form an RTT sample.
                if echoed_timestamp == 0 {
                    return false;
                }

                self.cc.packet_received(timestamp, echoed_timestamp, now);
                self.tracker.on_summary_ack(ack_seq, packets_lost);

                let fb = AckFeedback {
                    packets_received,
                    packets_ce,
                    packets_lost,
                    error_l4s,
                };

                match self.cc.ack_received(fb, self.seq, now) {
                    Some(inflight) => {
                        self.inflight = inflight;
                        self.reporter
                            .on_rtt(now.wrapping_sub(echoed_timestamp));

                        trace!(
                            "rx ack seq={} rcvd={} ce={} lost={} inflight={}",
                            ack_seq,
                            packets_received,
                            packets_ce,
                            packets_lost,
                            inflight
                        );

                        true
                    },

                    None => {
                        trace!("stale ack seq={} ignored", ack_seq);
                        false
                    },
                }
            },

            Ok(Packet::BlockAck { begin_seq, reports }) => {
                let rtts = self.tracker.on_block_ack(begin_seq, &reports, now);

                for &rtt in &rtts {
                    self.reporter.on_rtt(rtt);
                }
                self.cc.rtt_samples_received(&rtts);

                let fb = self.tracker.feedback();
                match self.cc.ack_received(fb, self.seq, now) {
                    Some(inflight) => {
                        self.inflight = inflight;

                        trace!(
                            "rx block-ack begin={} reports={} inflight={}",
                            begin_seq,
                            reports.len(),
                            inflight
                        );

                        true
                    },

                    None => false,
                }
            },

            // Data packets or unknown types are not for us; malformed
            // datagrams are dropped silently.
            Ok(_) | Err(_) => false,
        };

        if valid {
            self.consecutive_rtos = 0;
        }

        valid
    }

    fn on_rto(&mut self, now: TimeUs) -> Result<()> {
        self.consecutive_rtos += 1;

        warn!(
            "rto #{} after {} us of silence, resetting",
            self.consecutive_rtos, SND_TIMEOUT
        );

        if self.consecutive_rtos > self.max_timeouts {
            return Err(Error::TimedOut);
        }

        self.cc.reset(now);
        self.inflight = 0;

        Ok(())
    }

    fn feedback_for_report(&self) -> AckFeedback {
        let s = self.cc.stats();
        AckFeedback {
            packets_received: s.packets_received,
            packets_ce: s.packets_ce,
            packets_lost: s.packets_lost,
            error_l4s: s.error_l4s,
        }
    }
}
