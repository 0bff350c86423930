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

//! Shared plumbing for the UDP Prague binaries.

pub mod args;

/// Initialises logging. Verbose selects per-packet traces, quiet drops
/// the periodic reports.
pub fn init_logging(verbose: bool, quiet: bool) {
    let level = if verbose {
        log::LevelFilter::Trace
    } else if quiet {
        log::LevelFilter::Warn
    } else {
        log::LevelFilter::Info
    };

    env_logger::builder()
        .format_timestamp_nanos()
        .filter_level(level)
        .init();
}

/// Requests round-robin realtime scheduling when running as root. Purely
/// advisory; the transport works without it.
#[cfg(target_os = "linux")]
pub fn raise_rt_priority() {
    unsafe {
        if libc::geteuid() != 0 {
            return;
        }

        let param = libc::sched_param {
            sched_priority: libc::sched_get_priority_max(libc::SCHED_RR),
        };

        if libc::sched_setscheduler(0, libc::SCHED_RR, &param) < 0 {
            eprintln!("could not set realtime scheduling priority");
        }
    }
}

/// No-op outside Linux.
#[cfg(not(target_os = "linux"))]
pub fn raise_rt_priority() {}
