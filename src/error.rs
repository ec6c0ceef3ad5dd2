//! Error types shared across the forwarder.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yml::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid subnet entry `{entry}` on line {line}: {reason}")]
    InvalidSubnet {
        line: usize,
        entry: String,
        reason: &'static str,
    },

    #[error("transport error with proxy {proxy}: {source}")]
    Transport {
        proxy: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("malformed DNS message: {0}")]
    Protocol(&'static str),
}
