// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Thin binary: parses the CLI, wires up logging, ignores `SIGPIPE` (§6),
//! and hands off to the library's event loop. All broker logic lives in
//! `busd::event_loop` and the modules it depends on.

use anyhow::Context;
use clap::Parser;

use busd::cli::Cli;
use busd::wire::MAX_BODY_LEN;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.log_filter())
        .parse_default_env()
        .init();

    // §6: ignored so a write to a half-closed peer surfaces as EPIPE
    // instead of terminating the process.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let socket_path = cli.socket_path();
    busd::event_loop::run(&socket_path, MAX_BODY_LEN)
        .with_context(|| format!("broker failed on {}", socket_path.display()))
}
