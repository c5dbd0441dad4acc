//! TCP acceptor loop.
//!
//! Accepts connections forever and spawns one handler task per connection.
//! Transient accept failures (fd exhaustion, aborted handshakes) are retried
//! with exponential backoff; anything else stops the loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info, warn, Instrument};

use super::handler::ConnectionHandler;

/// Default first retry delay after a transient accept failure.
pub const DEFAULT_ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);

/// Default cap on the accept retry delay.
pub const DEFAULT_ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Exponential backoff for accept retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptBackoff {
    /// Delay after the first consecutive failure.
    pub min: Duration,
    /// Upper bound on the delay.
    pub max: Duration,
}

impl Default for AcceptBackoff {
    fn default() -> Self {
        Self {
            min: DEFAULT_ACCEPT_BACKOFF_MIN,
            max: DEFAULT_ACCEPT_BACKOFF_MAX,
        }
    }
}

impl AcceptBackoff {
    /// Delay to use after another consecutive failure, given the previous
    /// delay (`Duration::ZERO` after a successful accept).
    pub fn next_delay(&self, previous: Duration) -> Duration {
        let next = if previous.is_zero() {
            self.min
        } else {
            previous.saturating_mul(2)
        };
        next.min(self.max)
    }
}

/// Retry state across consecutive accept failures.
#[derive(Debug, Clone, Copy)]
pub struct AcceptRetry {
    backoff: AcceptBackoff,
    delay: Duration,
}

impl AcceptRetry {
    pub fn new(backoff: AcceptBackoff) -> Self {
        Self {
            backoff,
            delay: Duration::ZERO,
        }
    }

    /// Record a transient failure and return how long to wait before the
    /// next accept.
    pub fn on_transient(&mut self) -> Duration {
        self.delay = self.backoff.next_delay(self.delay);
        self.delay
    }

    /// Record a successful accept.
    pub fn on_success(&mut self) {
        self.delay = Duration::ZERO;
    }

    /// Delay used after the most recent failure, zero after a success.
    pub fn current_delay(&self) -> Duration {
        self.delay
    }
}

/// Whether an accept error is worth retrying.
pub fn is_transient_accept_error(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => true,
        _ => is_resource_exhaustion(e),
    }
}

#[cfg(unix)]
fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_e: &io::Error) -> bool {
    false
}

/// The listening socket plus the handler every accepted connection goes to.
pub struct Listener {
    listener: TcpListener,
    handler: Arc<ConnectionHandler>,
    backoff: AcceptBackoff,
}

impl Listener {
    /// Bind to `bind_addr` (`host:port`).
    pub async fn bind(
        bind_addr: &str,
        handler: Arc<ConnectionHandler>,
        backoff: AcceptBackoff,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            handler,
            backoff,
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until a non-transient accept error occurs.
    pub async fn run(self) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(
            bind_addr = %local_addr,
            resolver = self.handler.resolver_name(),
            "Proxy listening"
        );

        let mut retry = AcceptRetry::new(self.backoff);
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    retry.on_success();
                    info!(peer_addr = %peer_addr, "Accepted connection");
                    let _ = stream.set_nodelay(true);

                    let handler = Arc::clone(&self.handler);
                    tokio::spawn(
                        async move {
                            // Outcome is logged by the handler.
                            let _ = handler.handle(stream).await;
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) if is_transient_accept_error(&e) => {
                    let delay = retry.on_transient();
                    warn!(error = %e, retry_in = ?delay, "Accept error; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    return Err(e);
                }
            }
        }
    }
}
