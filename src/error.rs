// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::io;

use thiserror::Error;

/// Errors that abort broker startup. Per-connection failures never reach
/// this type; they stay `io::Result` and are handled locally (§7).
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to bind listening socket at {path}: {source}")]
    Bind { path: String, #[source] source: io::Error },

    #[error("failed to register listener with the event loop: {0}")]
    Poll(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
