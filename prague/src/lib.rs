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

//! Userspace L4S congestion-controlled UDP transport implementing the
//! Prague congestion control algorithm.
//!
//! prague pairs a sender and a receiver over plain UDP. Outgoing packets
//! carry the L4S ECT(1) codepoint; L4S-aware queues on the path mark them
//! CE instead of dropping, the receiver echoes the marks back and the
//! sender continuously adjusts its pacing rate and congestion window with
//! a DCTCP-style response. Feedback is either a summary ACK per data
//! packet or periodic RFC 8888 style block ACKs carrying per-packet
//! receive, ECN and timing reports.
//!
//! ## Running an endpoint
//!
//! Endpoints are configured through [`Config`] and embodied by
//! [`Sender`] and [`Receiver`]:
//!
//! ```no_run
//! let mut config = prague::Config::new();
//! config.set_addr("192.0.2.7".parse().unwrap());
//! config.set_port(8080);
//! config.set_connect(true);
//!
//! let mut sender = prague::Sender::new(&config)?;
//! sender.run()?;
//! # Ok::<(), prague::Error>(())
//! ```
//!
//! Both roles run a single-threaded loop alternating between datagram I/O
//! and state updates; there is no shared mutable state and no locking.
//!
//! ## Using the engine directly
//!
//! The congestion-control engine is usable on its own for hosts that do
//! their own I/O; see [`PragueCc`]. All of its time-dependent operations
//! take a caller-supplied timestamp produced by a [`Clock`].
//!
//! [`Config`]: struct.Config.html
//! [`Sender`]: struct.Sender.html
//! [`Receiver`]: struct.Receiver.html
//! [`PragueCc`]: cc/struct.PragueCc.html
//! [`Clock`]: clock/struct.Clock.html

#![allow(clippy::upper_case_acronyms)]
#![warn(missing_docs)]
#![warn(unused_qualifications)]

#[macro_use]
extern crate log;

use std::net::IpAddr;
use std::net::Ipv4Addr;

/// A timestamp or interval in microseconds.
///
/// Wraps every ~4295 seconds; always compare two values through
/// `a.wrapping_sub(b)` and a sign test, never with `<` directly.
pub type TimeUs = i32;

/// A packet or frame count. Wraps like [`TimeUs`] and follows the same
/// comparison discipline.
pub type Count = i32;

/// A size in bytes.
pub type Bytes = u64;

/// A rate in bytes per second.
pub type Rate = u64;

/// A fractional window in micro-bytes (bytes x 10^6), so that
/// `window / srtt_us` yields a byte rate without scaling constants.
pub type Window = u64;

/// A probability in Q-format with [`cc::PROB_SHIFT`] fractional bits.
pub type Prob = i64;

/// Smallest usable packet size in bytes.
pub const MIN_MTU: Bytes = 150;

/// Largest allowed packet size in bytes.
pub const MAX_MTU: Bytes = 1500;

/// Default maximum packet size in bytes.
pub const INIT_MTU: Bytes = 1400;

// Datagram receive/send scratch size; larger than any allowed packet.
pub(crate) const BUFFER_SIZE: usize = 8192;

pub use crate::cc::AckFeedback;
pub use crate::cc::CcInfo;
pub use crate::cc::CcState;
pub use crate::cc::CcaMode;
pub use crate::cc::PragueCc;
pub use crate::cc::PragueState;
pub use crate::cc::VideoCcInfo;

pub use crate::clock::Clock;
pub use crate::ecn::Ecn;
pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::receiver::Receiver;
pub use crate::sender::Sender;

pub mod cc;
pub mod clock;
pub mod ecn;
mod error;
pub mod feedback;
mod math;
pub mod packet;
pub mod recovery;
mod report;
pub mod socket;

mod receiver;
mod sender;

/// The endpoint configuration record.
///
/// Defaults follow the reference transport: bind on `0.0.0.0:8080`, bulk
/// mode, summary ACKs, 1400-byte packets, 100 Gbps rate cap.
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) connect: bool,
    pub(crate) addr: IpAddr,
    pub(crate) port: u16,
    pub(crate) max_packet_size: Bytes,
    pub(crate) max_rate: Rate,
    pub(crate) block_ack: bool,
    pub(crate) block_ack_period: TimeUs,
    pub(crate) rt_mode: bool,
    pub(crate) fps: u8,
    pub(crate) frame_duration: TimeUs,
    pub(crate) max_timeouts: u32,
}

impl Config {
    /// Creates a configuration with the default values.
    pub fn new() -> Config {
        Config {
            connect: false,
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            max_packet_size: INIT_MTU,
            max_rate: cc::MAX_RATE,
            block_ack: false,
            block_ack_period: 25_000,
            rt_mode: false,
            fps: 60,
            frame_duration: 10_000,
            max_timeouts: 2,
        }
    }

    /// Selects active (connecting) or passive (binding) operation.
    pub fn set_connect(&mut self, connect: bool) {
        self.connect = connect;
    }

    /// Sets the address to connect to or bind on.
    pub fn set_addr(&mut self, addr: IpAddr) {
        self.addr = addr;
    }

    /// Sets the UDP port.
    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    /// Sets the maximum packet size in bytes, within
    /// [`MIN_MTU`]..=[`MAX_MTU`].
    pub fn set_max_packet_size(&mut self, size: Bytes) -> Result<()> {
        if !(MIN_MTU..=MAX_MTU).contains(&size) {
            return Err(Error::InvalidConfig);
        }

        self.max_packet_size = size;
        Ok(())
    }

    /// Sets the maximum pacing rate in bytes per second.
    pub fn set_max_rate(&mut self, rate: Rate) -> Result<()> {
        if !(cc::MIN_RATE..=cc::MAX_RATE).contains(&rate) {
            return Err(Error::InvalidConfig);
        }

        self.max_rate = rate;
        Ok(())
    }

    /// Switches the receiver to RFC 8888 style block ACKs.
    pub fn set_block_ack(&mut self, enabled: bool) {
        self.block_ack = enabled;
    }

    /// Sets the block-ACK emission period in microseconds.
    pub fn set_block_ack_period(&mut self, period: TimeUs) -> Result<()> {
        if period <= 0 {
            return Err(Error::InvalidConfig);
        }

        self.block_ack_period = period;
        Ok(())
    }

    /// Switches the sender to real-time (frame) mode.
    pub fn set_rt_mode(&mut self, enabled: bool) {
        self.rt_mode = enabled;
    }

    /// Sets the frame rate for real-time mode.
    pub fn set_fps(&mut self, fps: u8) -> Result<()> {
        if fps == 0 {
            return Err(Error::InvalidConfig);
        }

        self.fps = fps;
        Ok(())
    }

    /// Sets the pacing budget of one frame in microseconds. Values above
    /// the frame interval are clamped when the sender is created.
    pub fn set_frame_duration(&mut self, duration: TimeUs) -> Result<()> {
        if duration <= 0 {
            return Err(Error::InvalidConfig);
        }

        self.frame_duration = duration;
        Ok(())
    }

    /// Sets how many consecutive retransmission timeouts are tolerated
    /// before the sender gives up.
    pub fn set_max_timeouts(&mut self, timeouts: u32) {
        self.max_timeouts = timeouts;
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}
