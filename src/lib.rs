//! gdns - A DNS forwarder that resists poisoning.
//!
//! Each client query is raced across trusted and untrusted upstreams and the
//! most trustworthy answer is returned, judged by transport, answer shape,
//! internal address ranges and calibrated response latency.

pub mod calibration;
pub mod config;
pub mod dns;
pub mod error;
pub mod proxy;
pub mod server;
pub mod session;
pub mod stats;
pub mod subnet;
pub mod task;
pub mod transport;

pub use error::{Error, Result};
