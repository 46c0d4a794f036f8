// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Command-line surface (§6 "CLI (out of core)"): the one documented flag,
//! `-s <path>`, plus an ambient `-v` repeat flag for log verbosity.

use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;

/// Default listening socket path when `-s`/`--socket` is not given. The
/// original hardcodes a build-time constant not present in the retrieved
/// source; this mirrors the common `/run/<name>/<name>.sock` convention.
pub const DEFAULT_SOCKET_PATH: &str = "/run/busd/bus.sock";

#[derive(Parser, Debug)]
#[command(name = "busd", about = "Local IPC message bus daemon")]
pub struct Cli {
    /// Unix domain socket to listen on.
    #[arg(short = 's', long = "socket", value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Raise log verbosity; repeatable (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn socket_path(&self) -> PathBuf {
        self.socket.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
    }

    pub fn log_filter(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_socket_path_is_used_when_flag_absent() {
        let cli = Cli::parse_from(["busd"]);
        assert_eq!(PathBuf::from(DEFAULT_SOCKET_PATH), cli.socket_path());
    }

    #[test]
    fn explicit_socket_path_overrides_default() {
        let cli = Cli::parse_from(["busd", "-s", "/tmp/other.sock"]);
        assert_eq!(PathBuf::from("/tmp/other.sock"), cli.socket_path());
    }

    #[test]
    fn verbosity_raises_log_filter() {
        assert_eq!(LevelFilter::Info, Cli::parse_from(["busd"]).log_filter());
        assert_eq!(LevelFilter::Debug, Cli::parse_from(["busd", "-v"]).log_filter());
        assert_eq!(LevelFilter::Trace, Cli::parse_from(["busd", "-vv"]).log_filter());
        assert_eq!(LevelFilter::Trace, Cli::parse_from(["busd", "-vvv"]).log_filter());
    }
}
