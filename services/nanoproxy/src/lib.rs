pub mod config;
pub mod error;
pub mod format;
pub mod proxy;

pub use config::{ProxyConfig, UpstreamProxy};
pub use error::ProxyError;
pub use proxy::{
    AcceptBackoff, ConnectionHandler, Destination, ProxyServer, RelayEnd, StatsHandle,
    StatsSnapshot, UpstreamResolver,
};
