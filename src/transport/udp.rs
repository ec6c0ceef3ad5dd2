//! UDP exchange with an upstream.
//!
//! The query goes out as a single datagram on a socket connected to the
//! proxy, so only datagrams from that address are received. The socket keeps
//! listening after the first answer: duplicate or forged answers racing the
//! genuine one are all handed to the owner.

use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::task::{Task, TaskState};

use super::MAX_DNS_PACKET_SIZE;

pub(crate) async fn exchange(task: &mut Task) {
    let addr = task.proxy().addr;

    let socket = match connect(addr).await {
        Ok(s) => s,
        Err(e) => {
            task.fail(e);
            return;
        }
    };

    if let Err(e) = socket.send(task.message()).await {
        task.fail(e);
        return;
    }
    task.mark_sent();

    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    loop {
        match socket.recv(&mut buf).await {
            Ok(0) => continue,
            Ok(len) if len == buf.len() => {
                warn!(proxy = %addr, "dropping answer of {} bytes or more, possibly truncated", len);
            }
            Ok(len) => task.deliver(buf[..len].to_vec()),
            Err(e) if task.state() == TaskState::Running => {
                task.fail(e);
                return;
            }
            Err(e) => {
                debug!(proxy = %addr, "UDP recv error after answer: {}", e);
                return;
            }
        }
    }
}

/// Bind an ephemeral socket of the right family and connect it to `addr`.
async fn connect(addr: SocketAddr) -> io::Result<UdpSocket> {
    let local = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(addr).await?;

    Ok(socket)
}
