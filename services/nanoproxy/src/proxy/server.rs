//! Wiring: configuration in, running acceptor out.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use super::dial::Dialer;
use super::handler::ConnectionHandler;
use super::listener::Listener;
use super::resolver::{ChainedResolver, DirectResolver, UpstreamResolver};
use super::stats::{StatsAggregator, StatsHandle};
use crate::config::ProxyConfig;

/// Pick the resolution strategy for this process.
pub fn resolver_for(config: &ProxyConfig) -> Arc<dyn UpstreamResolver> {
    let dialer = Dialer::new(config.connect_timeout);
    match &config.upstream {
        Some(upstream) => Arc::new(ChainedResolver::new(upstream.clone(), dialer)),
        None => Arc::new(DirectResolver::new(dialer)),
    }
}

/// A bound proxy with its stats aggregator running.
pub struct ProxyServer {
    listener: Listener,
    stats: StatsHandle,
    stats_task: JoinHandle<()>,
}

impl ProxyServer {
    /// Start the stats aggregator and bind the listening socket.
    pub async fn bind(config: &ProxyConfig) -> io::Result<Self> {
        let (stats, stats_task) =
            StatsAggregator::spawn(config.stats_queue_capacity, config.stats_tick);

        let resolver = resolver_for(config);
        info!(
            resolver = resolver.name(),
            upstream = ?config.upstream,
            "Resolver selected"
        );

        let handler = Arc::new(ConnectionHandler::new(
            resolver,
            stats.clone(),
            config.connection_timeout,
        ));

        let listener = match Listener::bind(&config.bind_addr, handler, config.accept_backoff).await
        {
            Ok(listener) => listener,
            Err(e) => {
                stats_task.abort();
                return Err(e);
            }
        };

        Ok(Self {
            listener,
            stats,
            stats_task,
        })
    }

    /// Get the local address the proxy is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for querying the stats aggregator.
    pub fn stats(&self) -> StatsHandle {
        self.stats.clone()
    }

    /// Accept connections until a fatal accept error.
    pub async fn run(self) -> io::Result<()> {
        let Self {
            listener,
            stats,
            stats_task,
        } = self;
        let result = listener.run().await;
        drop(stats);
        stats_task.abort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolver_selection() {
        let direct = ProxyConfig::new("127.0.0.1:0");
        assert_eq!(resolver_for(&direct).name(), "direct");

        let chained = ProxyConfig::new("127.0.0.1:0")
            .with_upstream("http://proxy.local:3128")
            .unwrap();
        assert_eq!(resolver_for(&chained).name(), "chained");
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let server = ProxyServer::bind(&ProxyConfig::new("127.0.0.1:0"))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        assert!(ProxyServer::bind(&ProxyConfig::new(addr)).await.is_err());
    }
}
