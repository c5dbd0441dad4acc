//! Bidirectional byte relay.
//!
//! Copies bytes client -> upstream and upstream -> client concurrently. The
//! first direction to finish (end-of-stream or error) ends the whole relay,
//! as does the cancellation token. Bytes are never inspected.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Copy buffer size per direction.
const RELAY_BUFFER_SIZE: usize = 8192;

/// Why a relay stopped.
#[derive(Debug)]
pub enum RelayEnd {
    /// The client -> upstream direction finished first. Carries the bytes it copied.
    ClientFinished(io::Result<u64>),
    /// The upstream -> client direction finished first. Carries the bytes it copied.
    UpstreamFinished(io::Result<u64>),
    /// The cancellation token fired.
    Cancelled,
}

impl RelayEnd {
    /// The I/O error that ended the relay, if any.
    pub fn error(&self) -> Option<&io::Error> {
        match self {
            RelayEnd::ClientFinished(Err(e)) | RelayEnd::UpstreamFinished(Err(e)) => Some(e),
            _ => None,
        }
    }

    /// Short label for logs.
    pub fn reason(&self) -> &'static str {
        match self {
            RelayEnd::ClientFinished(Ok(_)) => "client closed",
            RelayEnd::UpstreamFinished(Ok(_)) => "upstream closed",
            RelayEnd::ClientFinished(Err(_)) => "client error",
            RelayEnd::UpstreamFinished(Err(_)) => "upstream error",
            RelayEnd::Cancelled => "cancelled",
        }
    }
}

/// Relay bytes between `client` and `upstream` until one direction finishes
/// or `cancel` fires.
pub async fn relay<A, B>(client: &mut A, upstream: &mut B, cancel: &CancellationToken) -> RelayEnd
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    tokio::select! {
        result = pump(&mut client_read, &mut upstream_write) => RelayEnd::ClientFinished(result),
        result = pump(&mut upstream_read, &mut client_write) => RelayEnd::UpstreamFinished(result),
        _ = cancel.cancelled() => RelayEnd::Cancelled,
    }
}

/// Copy `reader` into `writer` until end-of-stream, then shut `writer` down.
async fn pump<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await? {
            0 => break,
            n => {
                writer.write_all(&buf[..n]).await?;
                total += n as u64;
            }
        }
    }
    writer.shutdown().await?;
    Ok(total)
}
