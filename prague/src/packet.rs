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

//! Wire format of the four datagram types.
//!
//! All integer fields are network byte order, packed with no padding.
//! Decoding always builds an owned value from the byte slice; the socket
//! buffer is never overlaid.

use crate::Count;
use crate::Ecn;
use crate::Error;
use crate::Result;
use crate::TimeUs;

/// Type byte of a bulk data packet.
pub const BULK_DATA_TYPE: u8 = 1;

/// Type byte of a real-time (frame) data packet.
pub const RT_DATA_TYPE: u8 = 2;

/// Type byte of a per-packet summary ACK.
pub const PKT_ACK_TYPE: u8 = 17;

/// Type byte of an RFC 8888 style block ACK.
pub const RFC8888_ACK_TYPE: u8 = 18;

/// Wire size of a bulk data header.
pub const BULK_DATA_LEN: usize = 13;

/// Wire size of a real-time data header.
pub const RT_DATA_LEN: usize = 25;

/// Wire size of a summary ACK.
pub const PKT_ACK_LEN: usize = 26;

/// Wire size of a block ACK with no reports.
pub const RFC8888_ACK_HDR_LEN: usize = 7;

/// One per-packet report inside a block ACK.
///
/// Bit 15 is the received flag, bits 14..13 carry the observed ECN
/// codepoint and bits 12..0 the arrival-time delta in units of 1024 µs.
/// The all-zero report means "not received".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Report(u16);

impl Report {
    /// Wire size of a single report.
    pub const LEN: usize = 2;

    /// The "not received" report.
    pub const LOST: Report = Report(0);

    /// Builds a received report from the observed ECN codepoint and the
    /// time elapsed since the packet arrived.
    pub fn received(ecn: Ecn, delta_us: TimeUs) -> Report {
        let units = (delta_us.wrapping_add(1 << 9) >> 10) & 0x1fff;

        Report(0x8000 | ((ecn as u16 & 0x3) << 13) | units as u16)
    }

    /// Reassembles a report from its wire representation.
    pub fn from_raw(raw: u16) -> Report {
        Report(raw)
    }

    /// Returns the wire representation.
    pub fn to_raw(self) -> u16 {
        self.0
    }

    /// Returns whether the report's received flag is set.
    pub fn is_received(self) -> bool {
        self.0 & 0x8000 != 0
    }

    /// Returns the ECN codepoint observed by the receiver.
    pub fn ecn(self) -> Ecn {
        Ecn::from_bits((self.0 >> 13) as u8)
    }

    /// Returns the arrival-time delta in microseconds, quantized to
    /// 1024 µs units.
    pub fn delta_us(self) -> TimeUs {
        ((self.0 as u32 & 0x1fff) << 10) as TimeUs
    }
}

/// A parsed datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    /// Bulk data (type 1). The payload after the header is opaque padding.
    Data {
        /// Sender timestamp, to be frozen and echoed by the peer.
        timestamp: TimeUs,

        /// Defrosted echo of the peer's last timestamp.
        echoed_timestamp: TimeUs,

        /// Packet sequence number, starting at 1.
        seq_nr: Count,
    },

    /// Real-time frame data (type 2).
    RtData {
        /// Sender timestamp, to be frozen and echoed by the peer.
        timestamp: TimeUs,

        /// Defrosted echo of the peer's last timestamp.
        echoed_timestamp: TimeUs,

        /// Packet sequence number, starting at 1.
        seq_nr: Count,

        /// Frame sequence number, starting at 1.
        frame_nr: Count,

        /// Bytes of the frame sent before this packet.
        frame_sent: Count,

        /// Total frame size in bytes.
        frame_size: Count,
    },

    /// Per-packet summary ACK (type 17).
    Ack {
        /// Sequence number of the data packet that provoked this ACK.
        ack_seq: Count,

        /// Receiver timestamp, to be frozen and echoed back.
        timestamp: TimeUs,

        /// Defrosted echo of the sender's last timestamp.
        echoed_timestamp: TimeUs,

        /// Cumulative count of received packets.
        packets_received: Count,

        /// Cumulative count of CE-marked packets.
        packets_ce: Count,

        /// Cumulative count of lost packets; may decrease on reordering.
        packets_lost: Count,

        /// Whether the receiver observed a bleached ECN codepoint.
        error_l4s: bool,
    },

    /// RFC 8888 style block ACK (type 18).
    BlockAck {
        /// Sequence number the first report refers to.
        begin_seq: Count,

        /// Per-packet reports for `begin_seq..begin_seq + len`.
        reports: Vec<Report>,
    },
}

impl Packet {
    /// Parses a datagram from the given buffer.
    ///
    /// Datagrams with an unknown type byte yield [`Error::Done`] and are to
    /// be dropped silently; truncated datagrams yield
    /// [`Error::BufferTooShort`].
    pub fn from_bytes(b: &mut octets::Octets) -> Result<Packet> {
        let ty = b.get_u8()?;

        match ty {
            BULK_DATA_TYPE => Ok(Packet::Data {
                timestamp: b.get_u32()? as TimeUs,
                echoed_timestamp: b.get_u32()? as TimeUs,
                seq_nr: b.get_u32()? as Count,
            }),

            RT_DATA_TYPE => Ok(Packet::RtData {
                timestamp: b.get_u32()? as TimeUs,
                echoed_timestamp: b.get_u32()? as TimeUs,
                seq_nr: b.get_u32()? as Count,
                frame_nr: b.get_u32()? as Count,
                frame_sent: b.get_u32()? as Count,
                frame_size: b.get_u32()? as Count,
            }),

            PKT_ACK_TYPE => Ok(Packet::Ack {
                ack_seq: b.get_u32()? as Count,
                timestamp: b.get_u32()? as TimeUs,
                echoed_timestamp: b.get_u32()? as TimeUs,
                packets_received: b.get_u32()? as Count,
                packets_ce: b.get_u32()? as Count,
                packets_lost: b.get_u32()? as Count,
                error_l4s: b.get_u8()? != 0,
            }),

            RFC8888_ACK_TYPE => {
                let begin_seq = b.get_u32()? as Count;
                let num_reports = b.get_u16()? as usize;

                if b.cap() < num_reports * Report::LEN {
                    return Err(Error::BufferTooShort);
                }

                let mut reports = Vec::with_capacity(num_reports);
                for _ in 0..num_reports {
                    reports.push(Report::from_raw(b.get_u16()?));
                }

                Ok(Packet::BlockAck { begin_seq, reports })
            },

            _ => Err(Error::Done),
        }
    }

    /// Encodes the packet into the given buffer, returning the number of
    /// bytes written.
    pub fn to_bytes(&self, b: &mut octets::OctetsMut) -> Result<usize> {
        match self {
            Packet::Data {
                timestamp,
                echoed_timestamp,
                seq_nr,
            } => {
                b.put_u8(BULK_DATA_TYPE)?;
                b.put_u32(*timestamp as u32)?;
                b.put_u32(*echoed_timestamp as u32)?;
                b.put_u32(*seq_nr as u32)?;
            },

            Packet::RtData {
                timestamp,
                echoed_timestamp,
                seq_nr,
                frame_nr,
                frame_sent,
                frame_size,
            } => {
                b.put_u8(RT_DATA_TYPE)?;
                b.put_u32(*timestamp as u32)?;
                b.put_u32(*echoed_timestamp as u32)?;
                b.put_u32(*seq_nr as u32)?;
                b.put_u32(*frame_nr as u32)?;
                b.put_u32(*frame_sent as u32)?;
                b.put_u32(*frame_size as u32)?;
            },

            Packet::Ack {
                ack_seq,
                timestamp,
                echoed_timestamp,
                packets_received,
                packets_ce,
                packets_lost,
                error_l4s,
            } => {
                b.put_u8(PKT_ACK_TYPE)?;
                b.put_u32(*ack_seq as u32)?;
                b.put_u32(*timestamp as u32)?;
                b.put_u32(*echoed_timestamp as u32)?;
                b.put_u32(*packets_received as u32)?;
                b.put_u32(*packets_ce as u32)?;
                b.put_u32(*packets_lost as u32)?;
                b.put_u8(u8::from(*error_l4s))?;
            },

            Packet::BlockAck { begin_seq, reports } => {
                b.put_u8(RFC8888_ACK_TYPE)?;
                b.put_u32(*begin_seq as u32)?;
                b.put_u16(reports.len() as u16)?;

                for r in reports {
                    b.put_u16(r.to_raw())?;
                }
            },
        }

        Ok(b.off())
    }

    /// Returns the packet's size on the wire, excluding any data payload.
    pub fn wire_len(&self) -> usize {
        match self {
            Packet::Data { .. } => BULK_DATA_LEN,

            Packet::RtData { .. } => RT_DATA_LEN,

            Packet::Ack { .. } => PKT_ACK_LEN,

            Packet::BlockAck { reports, .. } =>
                RFC8888_ACK_HDR_LEN + reports.len() * Report::LEN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(pkt: &Packet) -> Packet {
        let mut buf = [0; 1500];

        let len = {
            let mut b = octets::OctetsMut::with_slice(&mut buf);
            pkt.to_bytes(&mut b).unwrap()
        };

        assert_eq!(len, pkt.wire_len());

        let mut b = octets::Octets::with_slice(&buf[..len]);
        Packet::from_bytes(&mut b).unwrap()
    }

    #[test]
    fn data_round_trip() {
        let pkt = Packet::Data {
            timestamp: -123_456,
            echoed_timestamp: 789,
            seq_nr: i32::MIN,
        };

        assert_eq!(round_trip(&pkt), pkt);
    }

    #[test]
    fn rt_data_round_trip() {
        let pkt = Packet::RtData {
            timestamp: 1,
            echoed_timestamp: 0,
            seq_nr: 42,
            frame_nr: 7,
            frame_sent: 2800,
            frame_size: 4200,
        };

        assert_eq!(round_trip(&pkt), pkt);
    }

    #[test]
    fn ack_round_trip() {
        let pkt = Packet::Ack {
            ack_seq: 99,
            timestamp: i32::MAX,
            echoed_timestamp: -1,
            packets_received: 100,
            packets_ce: 3,
            packets_lost: -2,
            error_l4s: true,
        };

        assert_eq!(round_trip(&pkt), pkt);
    }

    #[test]
    fn block_ack_round_trip() {
        let pkt = Packet::BlockAck {
            begin_seq: 1000,
            reports: vec![
                Report::received(Ecn::Ce, 25 * 1024),
                Report::LOST,
                Report::received(Ecn::Ect1, 3000),
            ],
        };

        assert_eq!(round_trip(&pkt), pkt);
    }

    #[test]
    fn report_bit_layout() {
        let r = Report::received(Ecn::Ce, 25 * 1024);
        assert!(r.is_received());
        assert_eq!(r.ecn(), Ecn::Ce);
        assert_eq!(r.to_raw(), 0x8000 | (0x3 << 13) | 25);

        let r = Report::received(Ecn::Ect1, 0);
        assert_eq!(r.to_raw(), 0x8000 | (0x1 << 13));
        assert_eq!(r.delta_us(), 0);

        assert!(!Report::LOST.is_received());
    }

    #[test]
    fn report_delta_rounds_to_nearest_unit() {
        // 1024 µs units with round-half-up.
        assert_eq!(Report::received(Ecn::Ect1, 511).delta_us(), 0);
        assert_eq!(Report::received(Ecn::Ect1, 512).delta_us(), 1024);
        assert_eq!(Report::received(Ecn::Ect1, 1024 + 511).delta_us(), 1024);
    }

    #[test]
    fn short_buffer_rejected() {
        let pkt = Packet::Ack {
            ack_seq: 1,
            timestamp: 2,
            echoed_timestamp: 3,
            packets_received: 4,
            packets_ce: 0,
            packets_lost: 0,
            error_l4s: false,
        };

        let mut buf = [0; 64];
        let len = {
            let mut b = octets::OctetsMut::with_slice(&mut buf);
            pkt.to_bytes(&mut b).unwrap()
        };

        for cut in 1..len {
            let mut b = octets::Octets::with_slice(&buf[..cut]);
            assert_eq!(Packet::from_bytes(&mut b), Err(Error::BufferTooShort));
        }
    }

    #[test]
    fn block_ack_truncated_reports_rejected() {
        let pkt = Packet::BlockAck {
            begin_seq: 5,
            reports: vec![Report::LOST; 4],
        };

        let mut buf = [0; 64];
        let len = {
            let mut b = octets::OctetsMut::with_slice(&mut buf);
            pkt.to_bytes(&mut b).unwrap()
        };

        // Chop one report off the end; the declared count no longer fits.
        let mut b = octets::Octets::with_slice(&buf[..len - 1]);
        assert_eq!(Packet::from_bytes(&mut b), Err(Error::BufferTooShort));
    }

    #[test]
    fn unknown_type_ignored() {
        let buf = [0xab; 32];
        let mut b = octets::Octets::with_slice(&buf);
        assert_eq!(Packet::from_bytes(&mut b), Err(Error::Done));
    }
}
