//! Outbound TCP dialing.

use std::io;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{ProxyError, Result};

/// Opens outbound connections with a bounded connect time.
#[derive(Debug, Clone)]
pub struct Dialer {
    connect_timeout: Duration,
}

impl Dialer {
    /// Create a dialer with the given connect timeout.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Dial `addr` (`host:port`, resolved through the system resolver).
    pub async fn dial(&self, addr: &str) -> Result<TcpStream> {
        debug!(addr = %addr, "Dialing");

        let result = match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        };

        let stream = result.map_err(|source| ProxyError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}
