//! Upstream transports.
//!
//! Each transport performs the I/O half of a [`Task`](crate::task::Task):
//! one UDP datagram exchange or one length-prefixed TCP exchange.

pub mod tcp;
pub mod udp;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;
