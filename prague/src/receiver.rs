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

//! Receiver loops: per-packet summary ACKs or periodic RFC 8888 style
//! block ACKs.

use std::io;
use std::net::SocketAddr;

use crate::cc::PragueCc;
use crate::clock::Clock;
use crate::feedback::RecvTracker;
use crate::packet::Packet;
use crate::report::Reporter;
use crate::socket::UdpEcnSocket;

use crate::Bytes;
use crate::Config;
use crate::Count;
use crate::Ecn;
use crate::Error;
use crate::Result;
use crate::TimeUs;
use crate::BUFFER_SIZE;

/// The feedback-generating receiving endpoint.
pub struct Receiver {
    socket: UdpEcnSocket,
    cc: PragueCc,
    clock: Clock,
    reporter: Reporter,
    connect: bool,
    block_ack: bool,
    ack_period: TimeUs,
    max_pkt: Bytes,
}

// Timestamps and sequence number of a data packet, either flavour.
fn parse_data(data: &[u8]) -> Option<(TimeUs, TimeUs, Count)> {
    let mut b = octets::Octets::with_slice(data);

    match Packet::from_bytes(&mut b) {
        Ok(Packet::Data {
            timestamp,
            echoed_timestamp,
            seq_nr,
        }) |
        Ok(Packet::RtData {
            timestamp,
            echoed_timestamp,
            seq_nr,
            ..
        }) => Some((timestamp, echoed_timestamp, seq_nr)),

        _ => None,
    }
}

impl Receiver {
    /// Creates a receiver from the given configuration.
    pub fn new(config: &Config) -> Result<Receiver> {
        let addr = SocketAddr::new(config.addr, config.port);
        let socket = if config.connect {
            UdpEcnSocket::connect(addr)?
        } else {
            UdpEcnSocket::bind(addr)?
        };

        let clock = Clock::new();
        let now = clock.now();

        let cc = PragueCc::new(
            config.max_packet_size,
            0,
            0,
            crate::cc::INIT_RATE,
            crate::cc::INIT_WINDOW,
            crate::cc::MIN_RATE,
            config.max_rate,
            now,
        );

        Ok(Receiver {
            socket,
            cc,
            clock,
            reporter: Reporter::new("RECVER", now),
            connect: config.connect,
            block_ack: config.block_ack,
            ack_period: config.block_ack_period,
            max_pkt: config.max_packet_size,
        })
    }

    /// Returns a snapshot of the congestion-control state.
    pub fn stats(&self) -> crate::cc::PragueState {
        self.cc.stats()
    }

    /// Runs the receive/ACK loop; only returns on a fatal socket error.
    pub fn run(&mut self) -> Result<()> {
        if self.connect {
            self.send_trigger()?;
        }

        if self.block_ack {
            self.run_block_ack()
        } else {
            self.run_summary()
        }
    }

    // An actively connecting receiver announces itself so the sender
    // learns our address (and any NAT in between opens a pinhole).
    fn send_trigger(&mut self) -> Result<()> {
        let now = self.clock.now();
        let (timestamp, echoed_timestamp, ecn) = self.cc.time_info(now);
        let fb = self.cc.ack_info();

        let pkt = Packet::Ack {
            ack_seq: 0,
            timestamp,
            echoed_timestamp,
            packets_received: fb.packets_received,
            packets_ce: fb.packets_ce,
            packets_lost: fb.packets_lost,
            error_l4s: fb.error_l4s,
        };

        self.send_packet(&pkt, ecn)?;
        debug!("trigger ack sent");

        Ok(())
    }

    fn send_packet(&mut self, pkt: &Packet, ecn: Ecn) -> Result<usize> {
        let mut out = [0u8; BUFFER_SIZE];
        let len = {
            let mut b = octets::OctetsMut::with_slice(&mut out);
            pkt.to_bytes(&mut b)?
        };

        let sent = self.socket.send(&out[..len], ecn)?;
        if sent != len {
            return Err(Error::Io(io::ErrorKind::WriteZero));
        }

        Ok(len)
    }

    fn run_summary(&mut self) -> Result<()> {
        let mut buf = vec![0u8; BUFFER_SIZE];

        loop {
            let (len, ecn) = self.socket.recv(&mut buf, 0)?;
            if len == 0 {
                continue;
            }

            let now = self.clock.now();

            let Some((timestamp, echoed_timestamp, seq_nr)) =
                parse_data(&buf[..len])
            else {
                continue;
            };

            trace!(
                "rx seq={} ts={} ecn={:?} len={}",
                seq_nr,
                timestamp,
                ecn,
                len
            );

            self.reporter.on_rcvd(len);
            if echoed_timestamp != 0 {
                self.reporter.on_rtt(now.wrapping_sub(echoed_timestamp));
            }

            self.cc.packet_received(timestamp, echoed_timestamp, now);
            self.cc.data_received_sequence(ecn, seq_nr);

            // Reply immediately, echoing the counters.
            let (timestamp, echoed_timestamp, new_ecn) = self.cc.time_info(now);
            let fb = self.cc.ack_info();

            let ack = Packet::Ack {
                ack_seq: seq_nr,
                timestamp,
                echoed_timestamp,
                packets_received: fb.packets_received,
                packets_ce: fb.packets_ce,
                packets_lost: fb.packets_lost,
                error_l4s: fb.error_l4s,
            };

            let sent = self.send_packet(&ack, new_ecn)?;
            self.reporter.on_sent(sent);

            self.reporter.maybe_report(now, fb);
        }
    }

    fn run_block_ack(&mut self) -> Result<()> {
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut tracker = RecvTracker::new();

        let mut ack_time = self.clock.now().wrapping_add(self.ack_period);

        loop {
            let mut now = self.clock.now();

            // Block forever while nothing needs acknowledging; otherwise
            // wake up in time for the next feedback round.
            let wait = if !tracker.has_pending() {
                0
            } else {
                let remaining = ack_time.wrapping_sub(now);
                if remaining > 0 {
                    remaining
                } else {
                    1
                }
            };

            let (len, ecn) = self.socket.recv(&mut buf, wait)?;
            now = self.clock.now();

            if len != 0 {
                if let Some((timestamp, echoed_timestamp, seq_nr)) =
                    parse_data(&buf[..len])
                {
                    trace!(
                        "rx seq={} ts={} ecn={:?} len={}",
                        seq_nr,
                        timestamp,
                        ecn,
                        len
                    );

                    tracker.on_data(seq_nr, ecn, now);

                    self.cc.packet_received(timestamp, echoed_timestamp, now);
                    self.cc.data_received_sequence(ecn, seq_nr);

                    self.reporter.on_rcvd(len);
                    if echoed_timestamp != 0 {
                        self.reporter
                            .on_rtt(now.wrapping_sub(echoed_timestamp));
                    }
                }
            }

            if ack_time.wrapping_sub(now) > 0 {
                continue;
            }

            while tracker.has_pending() {
                let ack = tracker.next_block_ack(now, self.max_pkt);
                let sent = self.send_packet(&ack, Ecn::Ect1)?;
                self.reporter.on_sent(sent);

                if let Packet::BlockAck { begin_seq, reports } = &ack {
                    trace!(
                        "tx block-ack begin={} reports={} len={}",
                        begin_seq,
                        reports.len(),
                        sent
                    );
                }
            }

            ack_time = now.wrapping_add(self.ack_period);
            self.reporter.maybe_report(now, self.cc.ack_info());
        }
    }
}
