//! Connection accounting.
//!
//! A single aggregator task owns the set of live connections. Handlers talk to
//! it only through a bounded queue ([`StatsHandle`]), so the set needs no lock
//! and events are applied strictly in the order they were sent. A full queue
//! makes senders wait.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace};

use super::instrumented::ConnectionMetrics;
use super::resolver::Destination;
use crate::format::{human_bytes, human_duration};

/// Identity of a connection across its lifecycle events.
pub type ConnectionId = u64;

/// A resolved connection as known to the aggregator.
#[derive(Debug)]
pub struct TrackedConnection {
    pub id: ConnectionId,
    pub destination: Destination,
    /// Client-side counters.
    pub metrics: Arc<ConnectionMetrics>,
}

impl TrackedConnection {
    pub fn new(id: ConnectionId, destination: Destination, metrics: Arc<ConnectionMetrics>) -> Self {
        Self {
            id,
            destination,
            metrics,
        }
    }

    /// `<method> <host><path> (<elapsed> <bytes>)`
    pub fn accounting_line(&self) -> String {
        format!(
            "{} {}{} ({} {})",
            self.destination.method,
            self.destination.host,
            self.destination.path,
            human_duration(self.metrics.elapsed()),
            human_bytes(self.metrics.total_bytes()),
        )
    }
}

/// Messages accepted by the aggregator.
#[derive(Debug)]
pub enum StatsEvent {
    /// A connection resolved and is about to relay.
    Added(Arc<TrackedConnection>),
    /// A connection finished relaying.
    Removed(Arc<TrackedConnection>),
    /// Report the current state.
    Snapshot(oneshot::Sender<StatsSnapshot>),
}

/// Point-in-time view of the aggregator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Ids of live connections, in the order they were added.
    pub live: Vec<ConnectionId>,
    /// Connections that have been removed.
    pub completed: u64,
    /// Bytes accounted for removed connections.
    pub total_bytes: u64,
}

/// The aggregator is no longer running.
#[derive(Debug, Error)]
#[error("stats aggregator stopped")]
pub struct AggregatorStopped;

/// Sender side of the aggregator's queue.
#[derive(Debug, Clone)]
pub struct StatsHandle {
    tx: mpsc::Sender<StatsEvent>,
}

impl StatsHandle {
    /// Announce a connection. Waits while the queue is full.
    pub async fn added(&self, conn: Arc<TrackedConnection>) -> Result<(), AggregatorStopped> {
        self.send(StatsEvent::Added(conn)).await
    }

    /// Retire a connection. Waits while the queue is full.
    pub async fn removed(&self, conn: Arc<TrackedConnection>) -> Result<(), AggregatorStopped> {
        self.send(StatsEvent::Removed(conn)).await
    }

    /// Ask for a snapshot. It reflects every event sent before this call.
    pub async fn snapshot(&self) -> Result<StatsSnapshot, AggregatorStopped> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(StatsEvent::Snapshot(reply_tx)).await?;
        reply_rx.await.map_err(|_| AggregatorStopped)
    }

    async fn send(&self, event: StatsEvent) -> Result<(), AggregatorStopped> {
        self.tx.send(event).await.map_err(|_| AggregatorStopped)
    }
}

/// Owner of the live-connection set.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    live: Vec<Arc<TrackedConnection>>,
    completed: u64,
    total_bytes: u64,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the aggregator task.
    ///
    /// The task exits once every [`StatsHandle`] is dropped and the queue has
    /// drained.
    pub fn spawn(capacity: usize, tick: Duration) -> (StatsHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(Self::new().run(rx, tick));
        (StatsHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<StatsEvent>, tick: Duration) {
        let mut ticker = tokio::time::interval(tick.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        if let Some(line) = self.apply(event) {
                            info!("{line}");
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => self.on_tick(),
            }
        }

        debug!(live = self.live.len(), completed = self.completed, "Stats aggregator stopped");
    }

    /// Apply one event. Returns the accounting line when a connection is retired.
    pub fn apply(&mut self, event: StatsEvent) -> Option<String> {
        match event {
            StatsEvent::Added(conn) => {
                if self.live.iter().any(|c| c.id == conn.id) {
                    error!(connection_id = conn.id, "Connection added twice");
                    return None;
                }
                self.live.push(conn);
                None
            }
            StatsEvent::Removed(conn) => {
                let Some(pos) = self.live.iter().position(|c| c.id == conn.id) else {
                    error!(connection_id = conn.id, "Removed connection was never added");
                    return None;
                };
                let conn = self.live.remove(pos);
                self.completed += 1;
                self.total_bytes = self.total_bytes.saturating_add(conn.metrics.total_bytes());
                Some(conn.accounting_line())
            }
            StatsEvent::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
                None
            }
        }
    }

    /// Current state.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            live: self.live.iter().map(|c| c.id).collect(),
            completed: self.completed,
            total_bytes: self.total_bytes,
        }
    }

    // Reserved for periodic summaries.
    fn on_tick(&self) {
        trace!(live = self.live.len(), "Stats tick");
    }
}
