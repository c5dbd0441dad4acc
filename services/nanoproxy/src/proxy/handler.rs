//! Per-connection orchestration.
//!
//! `Resolving -> Relaying -> Closed`. A connection that fails to resolve goes
//! straight to `Closed` and is never reported to the stats aggregator; one
//! that resolves is announced before the relay and retired after it,
//! whatever the relay outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::instrumented::{ConnectionMetrics, InstrumentedStream};
use super::relay::{relay, RelayEnd};
use super::resolver::{Resolved, UpstreamResolver};
use super::stats::{StatsHandle, TrackedConnection};
use crate::error::Result;

/// Lifecycle of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Resolving,
    Relaying,
    Closed,
}

/// Drives accepted connections through resolve and relay.
pub struct ConnectionHandler {
    resolver: Arc<dyn UpstreamResolver>,
    stats: StatsHandle,
    /// Upper bound on a connection's relay time.
    connection_timeout: Option<Duration>,
    next_id: AtomicU64,
}

impl ConnectionHandler {
    pub fn new(
        resolver: Arc<dyn UpstreamResolver>,
        stats: StatsHandle,
        connection_timeout: Option<Duration>,
    ) -> Self {
        Self {
            resolver,
            stats,
            connection_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    /// Name of the configured resolution strategy.
    pub fn resolver_name(&self) -> &'static str {
        self.resolver.name()
    }

    /// Handle one accepted client stream to completion.
    ///
    /// Returns why the relay ended, or the resolution error. Both streams are
    /// closed by the time this returns.
    pub async fn handle<S>(&self, stream: S) -> Result<RelayEnd>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let metrics = Arc::new(ConnectionMetrics::new());
        let mut client = BufReader::new(InstrumentedStream::with_metrics(
            stream,
            Arc::clone(&metrics),
        ));

        debug!(connection_id = id, state = ?ConnectionState::Resolving, "Connection state");
        let Resolved {
            mut upstream,
            destination,
        } = match self.resolver.resolve(&mut client).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(
                    connection_id = id,
                    resolver = self.resolver.name(),
                    malformed = e.is_malformed(),
                    error = %e,
                    "Failed to resolve upstream"
                );
                debug!(connection_id = id, state = ?ConnectionState::Closed, "Connection state");
                return Err(e);
            }
        };

        // Anything still buffered was either forwarded or deliberately dropped.
        let mut client = client.into_inner();

        let conn = Arc::new(TrackedConnection::new(id, destination, metrics));
        if let Err(e) = self.stats.added(Arc::clone(&conn)).await {
            debug!(connection_id = id, error = %e, "Connection not tracked");
        }

        debug!(
            connection_id = id,
            state = ?ConnectionState::Relaying,
            host = %conn.destination.host,
            "Connection state"
        );

        let cancel = CancellationToken::new();
        // Cancels on every exit path, which also retires the deadline task.
        let _cancel_guard = cancel.clone().drop_guard();
        if let Some(limit) = self.connection_timeout {
            arm_deadline(&cancel, limit);
        }

        let end = relay(&mut client, &mut upstream, &cancel).await;
        match end.error() {
            Some(e) => debug!(connection_id = id, reason = end.reason(), error = %e, "Relay ended"),
            None => debug!(connection_id = id, reason = end.reason(), "Relay ended"),
        }

        if let Err(e) = self.stats.removed(conn).await {
            debug!(connection_id = id, error = %e, "Connection not tracked");
        }

        drop(upstream);
        drop(client);
        debug!(connection_id = id, state = ?ConnectionState::Closed, "Connection state");
        Ok(end)
    }
}

/// Fire `cancel` once `limit` has elapsed, unless it fires first.
fn arm_deadline(cancel: &CancellationToken, limit: Duration) {
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(limit) => token.cancel(),
            _ = token.cancelled() => {}
        }
    });
}
