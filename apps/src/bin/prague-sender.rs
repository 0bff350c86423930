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

#[macro_use]
extern crate log;

use prague_apps::args::Args;
use prague_apps::args::CommonArgs;
use prague_apps::args::SENDER_USAGE;

fn main() {
    let docopt = docopt::Docopt::new(SENDER_USAGE).unwrap();
    let args = CommonArgs::with_docopt(&docopt);

    prague_apps::init_logging(args.verbose, args.quiet);
    prague_apps::raise_rt_priority();

    let config = args.to_config().unwrap_or_else(|e| {
        eprintln!("invalid arguments: {e}");
        std::process::exit(1);
    });

    info!(
        "UDP Prague sender {} {}:{} with max packet size {} bytes",
        if args.connect {
            "connecting to"
        } else {
            "listening at"
        },
        args.addr,
        args.port,
        args.max_packet_size
    );

    let mut sender = prague::Sender::new(&config).unwrap_or_else(|e| {
        error!("socket setup failed: {e}");
        std::process::exit(1);
    });

    if let Err(e) = sender.run() {
        error!("sender terminated: {e}");
        std::process::exit(1);
    }
}
