//! Connection-handling engine.
//!
//! This module provides:
//! - The TCP acceptor loop with transient-error backoff
//! - Upstream resolution (chained upstream proxy, or direct dispatch with
//!   CONNECT and absolute-URI support)
//! - The bidirectional byte relay
//! - Byte-counting stream instrumentation
//! - The stats aggregator that turns connection lifecycles into accounting lines
//!
//! ## Architecture
//!
//! ```text
//! Listener -> ConnectionHandler -> UpstreamResolver -> relay
//!                    |
//!                    +--(added / removed)--> StatsAggregator
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use nanoproxy::{ProxyConfig, ProxyServer};
//!
//! let config = ProxyConfig::new("127.0.0.1:8888");
//! let server = ProxyServer::bind(&config).await?;
//! server.run().await?;
//! ```

mod dial;
mod handler;
mod instrumented;
mod listener;
mod relay;
mod resolver;
mod server;
mod stats;

pub use dial::Dialer;
pub use handler::{ConnectionHandler, ConnectionState};
pub use instrumented::{ConnectionMetrics, InstrumentedStream};
pub use listener::{is_transient_accept_error, AcceptBackoff, AcceptRetry, Listener};
pub use relay::{relay, RelayEnd};
pub use resolver::{
    ChainedResolver, ClientStream, Destination, DirectResolver, OriginTarget, RequestLine,
    Resolved, UpstreamResolver, CONNECT_ESTABLISHED,
};
pub use server::{resolver_for, ProxyServer};
pub use stats::{
    AggregatorStopped, ConnectionId, StatsAggregator, StatsEvent, StatsHandle, StatsSnapshot,
    TrackedConnection,
};
