//! Byte-counting stream wrapper.
//!
//! `InstrumentedStream` forwards reads and writes to the wrapped stream
//! untouched and adds each successful transfer to a shared
//! [`ConnectionMetrics`]. Errors and short reads/writes pass through as-is.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Per-connection counters.
///
/// Only the task driving the connection increments them; the stats
/// aggregator reads them once the connection ends.
#[derive(Debug)]
pub struct ConnectionMetrics {
    started_at: Instant,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl ConnectionMetrics {
    /// Create counters stamped with the current time.
    pub fn new() -> Self {
        Self::started_at(Instant::now())
    }

    /// Create counters with an explicit start time.
    pub fn started_at(started_at: Instant) -> Self {
        Self {
            started_at,
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    /// Wall time since the connection was accepted.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Bytes read from the wrapped stream so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Bytes written to the wrapped stream so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Read plus written.
    pub fn total_bytes(&self) -> u64 {
        self.bytes_read().saturating_add(self.bytes_written())
    }

    fn record_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn record_written(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    }
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A stream that counts the bytes flowing through it.
#[derive(Debug)]
pub struct InstrumentedStream<S> {
    inner: S,
    metrics: Arc<ConnectionMetrics>,
}

impl<S> InstrumentedStream<S> {
    /// Wrap `inner` with fresh counters.
    pub fn new(inner: S) -> Self {
        Self::with_metrics(inner, Arc::new(ConnectionMetrics::new()))
    }

    /// Wrap `inner`, reporting into existing counters.
    pub fn with_metrics(inner: S, metrics: Arc<ConnectionMetrics>) -> Self {
        Self { inner, metrics }
    }

    /// Shared handle to the counters.
    pub fn metrics(&self) -> &Arc<ConnectionMetrics> {
        &self.metrics
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for InstrumentedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            self.metrics.record_read(buf.filled().len() - before);
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for InstrumentedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            self.metrics.record_written(*n);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
