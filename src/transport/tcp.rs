//! TCP exchange with an upstream.
//!
//! TCP DNS messages are prefixed with a 2-byte big-endian length. One query
//! is written per connection and exactly one response is read back.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::task::Task;

pub(crate) async fn exchange(task: &mut Task) {
    let mut stream = match TcpStream::connect(task.proxy().addr).await {
        Ok(s) => s,
        Err(e) => {
            task.fail(e);
            return;
        }
    };
    task.mark_sent();

    if let Err(e) = stream.write_all(task.message()).await {
        task.fail(e);
        return;
    }

    match read_dns_message(&mut stream).await {
        Ok(response) => task.deliver(response),
        Err(e) => task.fail(e),
    }
}

/// Prepend the 2-byte length header to a DNS message.
pub fn frame(message: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(2 + message.len());
    framed.extend_from_slice(&(message.len() as u16).to_be_bytes());
    framed.extend_from_slice(message);
    framed
}

/// Read one length-prefixed DNS message, returning it without the prefix.
pub async fn read_dns_message<R>(stream: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let msg_len = stream.read_u16().await? as usize;
    if msg_len == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "empty DNS message",
        ));
    }

    let mut buf = vec![0u8; msg_len];
    stream.read_exact(&mut buf).await?;

    Ok(buf)
}
