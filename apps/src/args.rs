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

//! Command-line argument handling for the prague binaries.

use std::net::IpAddr;
use std::str::FromStr;

use prague::Config;

/// Creates arguments from a [`Docopt`] usage string.
///
/// [`Docopt`]: https://docs.rs/docopt/1.1.0/docopt/
pub trait Args {
    /// Parses the process arguments against the given usage.
    fn with_docopt(docopt: &docopt::Docopt) -> Self;
}

pub const SENDER_USAGE: &str = "Usage:
  prague-sender [options]
  prague-sender -h | --help

Options:
  -a --address ADDR        Address to connect to or bind on [default: 0.0.0.0].
  -p --port PORT           UDP port [default: 8080].
  -c --connect             Connect out instead of binding and waiting.
  -m --max-packet BYTES    Maximum packet size [default: 1400].
  -b --max-rate BITS       Maximum rate in bits/s; k/M/G suffixes [default: 100g].
  --rt                     Send frame-paced real-time traffic.
  --fps FPS                Frames per second in real-time mode [default: 60].
  --frame-duration MICROS  Pacing budget of one frame in us [default: 10000].
  -v --verbose             Per-packet trace output.
  -q --quiet               Only warnings and errors.
  -h --help                Show this screen.
";

pub const RECEIVER_USAGE: &str = "Usage:
  prague-receiver [options]
  prague-receiver -h | --help

Options:
  -a --address ADDR        Address to connect to or bind on [default: 0.0.0.0].
  -p --port PORT           UDP port [default: 8080].
  -c --connect             Connect out instead of binding and waiting.
  -m --max-packet BYTES    Maximum feedback packet size [default: 1400].
  --block-ack              Send RFC 8888 style block ACKs instead of per-packet ACKs.
  --ack-period MICROS      Block-ACK emission period in us [default: 25000].
  -v --verbose             Per-packet trace output.
  -q --quiet               Only warnings and errors.
  -h --help                Show this screen.
";

/// Arguments common to both binaries.
pub struct CommonArgs {
    pub connect: bool,
    pub addr: IpAddr,
    pub port: u16,
    pub max_packet_size: u64,
    pub max_rate: u64,
    pub block_ack: bool,
    pub ack_period: i32,
    pub rt_mode: bool,
    pub fps: u8,
    pub frame_duration: i32,
    pub verbose: bool,
    pub quiet: bool,
}

fn parse_or<T: FromStr>(args: &docopt::ArgvMap, key: &str, default: T) -> T {
    let value = args.get_str(key);

    if value.is_empty() {
        return default;
    }

    value.parse().unwrap_or_else(|_| {
        eprintln!("invalid value for {key}: {value}");
        std::process::exit(1);
    })
}

/// Converts a bits-per-second figure with an optional k/M/G suffix to
/// bytes per second. Upper-case suffixes are binary, lower-case decimal.
pub fn bits_to_bytes(value: &str) -> u64 {
    let (digits, suffix) =
        match value.find(|c: char| !c.is_ascii_digit() && c != '.') {
            Some(pos) => value.split_at(pos),
            None => (value, ""),
        };

    let num: f64 = digits.parse().unwrap_or_else(|_| {
        eprintln!("invalid rate: {value}");
        std::process::exit(1);
    });

    let scale: f64 = match suffix {
        "G" => (1024u64 * 1024 * 1024) as f64,
        "g" => 1_000_000_000.0,
        "M" => (1024 * 1024) as f64,
        "m" => 1_000_000.0,
        "K" => 1024.0,
        "k" => 1_000.0,
        "" => 1.0,

        _ => {
            eprintln!("invalid rate suffix: {value}");
            std::process::exit(1);
        },
    };

    (num * scale / 8.0) as u64
}

impl Args for CommonArgs {
    fn with_docopt(docopt: &docopt::Docopt) -> Self {
        let args = docopt.parse().unwrap_or_else(|e| e.exit());

        let connect = args.get_bool("--connect");

        let mut addr = args.get_str("--address");
        if connect && addr == "0.0.0.0" {
            addr = "127.0.0.1";
        }
        let addr: IpAddr = addr.parse().unwrap_or_else(|_| {
            eprintln!("invalid address: {addr}");
            std::process::exit(1);
        });

        let rate = args.get_str("--max-rate");
        let rate = if rate.is_empty() { "100g" } else { rate };

        CommonArgs {
            connect,
            addr,
            port: parse_or(&args, "--port", 8080),
            max_packet_size: parse_or(&args, "--max-packet", 1400),
            max_rate: bits_to_bytes(rate),
            block_ack: args.get_bool("--block-ack"),
            ack_period: parse_or(&args, "--ack-period", 25_000),
            rt_mode: args.get_bool("--rt"),
            fps: parse_or(&args, "--fps", 60),
            frame_duration: parse_or(&args, "--frame-duration", 10_000),
            verbose: args.get_bool("--verbose"),
            quiet: args.get_bool("--quiet"),
        }
    }
}

impl CommonArgs {
    /// Builds the transport configuration, validating ranges.
    pub fn to_config(&self) -> prague::Result<Config> {
        let mut config = Config::new();

        config.set_connect(self.connect);
        config.set_addr(self.addr);
        config.set_port(self.port);
        config.set_max_packet_size(self.max_packet_size)?;
        config.set_max_rate(self.max_rate)?;
        config.set_block_ack(self.block_ack);
        config.set_block_ack_period(self.ack_period)?;
        config.set_rt_mode(self.rt_mode);

        if self.rt_mode {
            config.set_fps(self.fps)?;
            config.set_frame_duration(self.frame_duration)?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_suffixes() {
        assert_eq!(bits_to_bytes("8000"), 1_000);
        assert_eq!(bits_to_bytes("8k"), 1_000);
        assert_eq!(bits_to_bytes("8K"), 1_024);
        assert_eq!(bits_to_bytes("8m"), 1_000_000);
        assert_eq!(bits_to_bytes("100g"), 12_500_000_000);
        assert_eq!(bits_to_bytes("1.6k"), 200);
    }
}
