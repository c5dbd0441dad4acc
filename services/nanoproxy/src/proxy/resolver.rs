//! Upstream resolution.
//!
//! A resolver reads just enough of the client's opening request to decide
//! where the connection goes, dials that destination and hands back the open
//! upstream stream. Everything after that point is raw relay.
//!
//! Two strategies exist, selected once at startup:
//! - [`ChainedResolver`] forwards the request header block to a fixed
//!   upstream proxy, injecting `Proxy-Authorization` when configured.
//! - [`DirectResolver`] handles `CONNECT` tunnels and absolute-URI requests
//!   itself.
//!
//! Any upstream stream opened before a failure is dropped (and therefore
//! closed) before the error is returned.

use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use super::dial::Dialer;
use crate::config::UpstreamProxy;
use crate::error::{ProxyError, Result};

/// Longest accepted request or header line, terminator included.
pub const MAX_LINE_LENGTH: usize = 8192;

/// Port used for absolute-URI requests that don't name one.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Reply sent to the client once a `CONNECT` target has been dialed.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.0 200 Connection established\r\n\r\n";

/// The client side of a connection as seen by a resolver: buffered for line
/// reads and writable for replies.
pub trait ClientStream: AsyncBufRead + AsyncWrite + Unpin + Send {
    /// Bytes read from the socket but not yet consumed.
    fn buffered(&self) -> &[u8];

    /// Drop any buffered but unconsumed bytes. Returns how many were dropped.
    fn discard_buffered(&mut self) -> usize;
}

impl<S> ClientStream for BufReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn buffered(&self) -> &[u8] {
        self.buffer()
    }

    fn discard_buffered(&mut self) -> usize {
        let n = self.buffer().len();
        AsyncBufRead::consume(Pin::new(self), n);
        n
    }
}

/// Where a connection was routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Destination host, with port when relevant.
    pub host: String,
    /// Request method as reported in the accounting line.
    pub method: String,
    /// Request path; empty when the strategy doesn't know it.
    pub path: String,
}

/// Output of a successful resolution.
#[derive(Debug)]
pub struct Resolved {
    /// Open connection to the destination (or the upstream proxy).
    pub upstream: TcpStream,
    pub destination: Destination,
}

/// Strategy for turning a freshly accepted client stream into an upstream
/// connection.
#[async_trait]
pub trait UpstreamResolver: Send + Sync {
    /// Short strategy name for logs.
    fn name(&self) -> &'static str;

    /// Read the opening request from `client`, dial the destination and
    /// return it.
    async fn resolve(&self, client: &mut dyn ClientStream) -> Result<Resolved>;
}

/// A parsed HTTP request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: String,
}

impl RequestLine {
    /// Split a request line into exactly three whitespace-separated tokens.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut tokens = line.split_whitespace();
        match (tokens.next(), tokens.next(), tokens.next(), tokens.next()) {
            (Some(method), Some(target), Some(version), None) => Ok(Self {
                method: method.to_string(),
                target: target.to_string(),
                version: version.to_string(),
            }),
            _ => Err(ProxyError::MalformedRequest(format!(
                "bad request line {line:?}"
            ))),
        }
    }

    fn from_bytes(line: &[u8]) -> Result<Self> {
        let line = std::str::from_utf8(line).map_err(|_| {
            ProxyError::MalformedRequest("request line is not valid UTF-8".to_string())
        })?;
        Self::parse(line)
    }
}

/// Read one line, terminator included.
async fn read_line(client: &mut dyn ClientStream) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    let n = (&mut *client)
        .take(MAX_LINE_LENGTH as u64)
        .read_until(b'\n', &mut line)
        .await?;

    if line.ends_with(b"\n") {
        return Ok(line);
    }
    if n >= MAX_LINE_LENGTH {
        return Err(ProxyError::MalformedRequest(format!(
            "line exceeds {MAX_LINE_LENGTH} bytes"
        )));
    }
    Err(ProxyError::ClientClosed)
}

fn is_blank_line(line: &[u8]) -> bool {
    line == b"\r\n" || line == b"\n"
}

// ============================================================================
// Chained upstream proxy
// ============================================================================

/// Forwards every request to a fixed upstream proxy.
#[derive(Debug, Clone)]
pub struct ChainedResolver {
    upstream: UpstreamProxy,
    dialer: Dialer,
}

impl ChainedResolver {
    pub fn new(upstream: UpstreamProxy, dialer: Dialer) -> Self {
        Self { upstream, dialer }
    }

    /// Copy the header block to `upstream` line by line, ending with the
    /// optional credentials and the terminating blank line.
    async fn forward_header_block(
        &self,
        client: &mut dyn ClientStream,
        upstream: &mut TcpStream,
        request_line: &[u8],
    ) -> Result<()> {
        upstream.write_all(request_line).await?;

        let terminator = loop {
            let line = read_line(client).await?;
            if is_blank_line(&line) {
                break line;
            }
            upstream.write_all(&line).await?;
        };

        if let Some(authorization) = self.upstream.authorization() {
            upstream
                .write_all(format!("Proxy-Authorization: {authorization}\r\n").as_bytes())
                .await?;
        }
        upstream.write_all(&terminator).await?;
        upstream.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl UpstreamResolver for ChainedResolver {
    fn name(&self) -> &'static str {
        "chained"
    }

    async fn resolve(&self, client: &mut dyn ClientStream) -> Result<Resolved> {
        let first = read_line(client).await?;
        let request = RequestLine::from_bytes(&first)?;

        let mut upstream = self.dialer.dial(self.upstream.addr()).await?;
        self.forward_header_block(client, &mut upstream, &first)
            .await?;

        let discarded = client.discard_buffered();
        if discarded > 0 {
            debug!(discarded, "Dropped bytes buffered past the header block");
        }

        Ok(Resolved {
            upstream,
            destination: Destination {
                host: request.target,
                method: request.method,
                path: String::new(),
            },
        })
    }
}

// ============================================================================
// Direct dispatch
// ============================================================================

/// Origin derived from an absolute-URI request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginTarget {
    /// Address to dial (`host:port`).
    pub dial_addr: String,
    /// Host as written in the URL, with the port only when explicit.
    pub host: String,
    /// URL path.
    pub path: String,
    /// Origin-form target for the re-framed request line (path and query).
    pub request_target: String,
}

impl OriginTarget {
    /// Parse an absolute-URI request target such as `http://example.com/path`.
    pub fn parse(target: &str) -> Result<Self> {
        let url = Url::parse(target).map_err(|e| {
            ProxyError::MalformedRequest(format!("invalid request target {target:?}: {e}"))
        })?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                ProxyError::MalformedRequest(format!("request target {target:?} has no host"))
            })?;

        let (dial_addr, display_host) = match url.port() {
            Some(port) => (format!("{host}:{port}"), format!("{host}:{port}")),
            None => (format!("{host}:{DEFAULT_HTTP_PORT}"), host.to_string()),
        };

        let path = url.path().to_string();
        // The query string is forwarded to the origin; only `path` feeds
        // the accounting line.
        let request_target = match url.query() {
            Some(query) => format!("{path}?{query}"),
            None => path.clone(),
        };

        Ok(Self {
            dial_addr,
            host: display_host,
            path,
            request_target,
        })
    }
}

/// Dispatches requests straight to their destination.
#[derive(Debug, Clone)]
pub struct DirectResolver {
    dialer: Dialer,
}

impl DirectResolver {
    pub fn new(dialer: Dialer) -> Self {
        Self { dialer }
    }

    async fn tunnel(
        &self,
        client: &mut dyn ClientStream,
        request: RequestLine,
    ) -> Result<Resolved> {
        let upstream = self.dialer.dial(&request.target).await?;

        client.discard_buffered();
        client.write_all(CONNECT_ESTABLISHED).await?;
        client.flush().await?;

        Ok(Resolved {
            upstream,
            destination: Destination {
                host: request.target.clone(),
                method: request.target,
                path: String::new(),
            },
        })
    }

    async fn forward(
        &self,
        client: &mut dyn ClientStream,
        request: RequestLine,
    ) -> Result<Resolved> {
        let origin = OriginTarget::parse(&request.target)?;
        let mut upstream = self.dialer.dial(&origin.dial_addr).await?;

        let reframed = format!(
            "{} {} {}\r\n",
            request.method, origin.request_target, request.version
        );
        upstream.write_all(reframed.as_bytes()).await?;

        // Only what already arrived; the relay carries the rest.
        let pending = client.buffered().to_vec();
        if !pending.is_empty() {
            upstream.write_all(&pending).await?;
        }
        client.discard_buffered();

        Ok(Resolved {
            upstream,
            destination: Destination {
                host: origin.host,
                method: request.target,
                path: origin.path,
            },
        })
    }
}

#[async_trait]
impl UpstreamResolver for DirectResolver {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn resolve(&self, client: &mut dyn ClientStream) -> Result<Resolved> {
        let first = read_line(client).await?;
        let request = RequestLine::from_bytes(&first)?;

        if request.method == "CONNECT" {
            self.tunnel(client, request).await
        } else {
            self.forward(client, request).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn dialer() -> Dialer {
        Dialer::new(Duration::from_secs(2))
    }

    /// Client side pre-loaded with `request`; the peer half stays open.
    async fn client_with(request: &[u8]) -> (BufReader<DuplexStream>, DuplexStream) {
        let (ours, mut theirs) = duplex(16 * 1024);
        theirs.write_all(request).await.unwrap();
        (BufReader::new(ours), theirs)
    }

    async fn read_available(stream: &mut TcpStream) -> Vec<u8> {
        let mut out = Vec::new();
        timeout(Duration::from_secs(2), stream.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap();
        out
    }

    #[rstest]
    #[case("GET http://example.com/ HTTP/1.1\r\n", "GET", "http://example.com/", "HTTP/1.1")]
    #[case("CONNECT example.com:443 HTTP/1.1\n", "CONNECT", "example.com:443", "HTTP/1.1")]
    #[case("POST  /x   HTTP/1.0", "POST", "/x", "HTTP/1.0")]
    fn test_request_line_parse(
        #[case] line: &str,
        #[case] method: &str,
        #[case] target: &str,
        #[case] version: &str,
    ) {
        let parsed = RequestLine::parse(line).unwrap();
        assert_eq!(parsed.method, method);
        assert_eq!(parsed.target, target);
        assert_eq!(parsed.version, version);
    }

    #[rstest]
    #[case("GET\r\n")]
    #[case("GET /\r\n")]
    #[case("GET / HTTP/1.1 extra\r\n")]
    #[case("\r\n")]
    fn test_request_line_malformed(#[case] line: &str) {
        assert!(RequestLine::parse(line).unwrap_err().is_malformed());
    }

    #[test]
    fn test_origin_target_defaults_port_80() {
        let origin = OriginTarget::parse("http://example.com/path").unwrap();
        assert_eq!(origin.dial_addr, "example.com:80");
        assert_eq!(origin.host, "example.com");
        assert_eq!(origin.path, "/path");
        assert_eq!(origin.request_target, "/path");
    }

    #[test]
    fn test_origin_target_explicit_port_and_query() {
        let origin = OriginTarget::parse("http://example.com:8080/a/b?q=1").unwrap();
        assert_eq!(origin.dial_addr, "example.com:8080");
        assert_eq!(origin.host, "example.com:8080");
        assert_eq!(origin.path, "/a/b");
        assert_eq!(origin.request_target, "/a/b?q=1");
    }

    #[test]
    fn test_origin_target_rejects_relative() {
        assert!(OriginTarget::parse("/just/a/path").unwrap_err().is_malformed());
    }

    #[tokio::test]
    async fn test_direct_plain_request_is_reframed() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = origin.local_addr().unwrap().port();
        let request = format!(
            "GET http://127.0.0.1:{port}/path?x=1 HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n"
        );
        let (mut client, _peer) = client_with(request.as_bytes()).await;

        let resolved = DirectResolver::new(dialer())
            .resolve(&mut client)
            .await
            .unwrap();
        assert_eq!(resolved.destination.host, format!("127.0.0.1:{port}"));
        assert_eq!(
            resolved.destination.method,
            format!("http://127.0.0.1:{port}/path?x=1")
        );
        assert_eq!(resolved.destination.path, "/path");
        assert!(client.buffered().is_empty());

        let (mut accepted, _) = origin.accept().await.unwrap();
        drop(resolved);
        let received = read_available(&mut accepted).await;
        assert_eq!(
            String::from_utf8(received).unwrap(),
            format!("GET /path?x=1 HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n")
        );
    }

    #[tokio::test]
    async fn test_direct_connect_replies_established() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = target.local_addr().unwrap().to_string();
        let request = format!("CONNECT {addr} HTTP/1.1\r\nHost: {addr}\r\n\r\n");
        let (mut client, mut peer) = client_with(request.as_bytes()).await;

        let resolved = DirectResolver::new(dialer())
            .resolve(&mut client)
            .await
            .unwrap();
        assert_eq!(
            resolved.destination,
            Destination {
                host: addr.clone(),
                method: addr.clone(),
                path: String::new(),
            }
        );

        let mut reply = vec![0u8; CONNECT_ESTABLISHED.len()];
        peer.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, CONNECT_ESTABLISHED);

        // The header lines after the request line are not sent to the target.
        let (mut accepted, _) = target.accept().await.unwrap();
        drop(resolved);
        assert!(read_available(&mut accepted).await.is_empty());
    }

    #[tokio::test]
    async fn test_direct_connect_dial_failure_writes_nothing() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = closed.local_addr().unwrap().to_string();
        drop(closed);

        let request = format!("CONNECT {addr} HTTP/1.1\r\n\r\n");
        let (mut client, mut peer) = client_with(request.as_bytes()).await;

        let err = DirectResolver::new(dialer())
            .resolve(&mut client)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Connect { .. }));

        drop(client);
        let mut reply = Vec::new();
        peer.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn test_direct_malformed_request() {
        let (mut client, _peer) = client_with(b"GET\r\n\r\n").await;
        let err = DirectResolver::new(dialer())
            .resolve(&mut client)
            .await
            .unwrap_err();
        assert!(err.is_malformed());
    }

    #[tokio::test]
    async fn test_direct_invalid_url_is_malformed() {
        let (mut client, _peer) = client_with(b"GET not-a-url HTTP/1.1\r\n\r\n").await;
        let err = DirectResolver::new(dialer())
            .resolve(&mut client)
            .await
            .unwrap_err();
        assert!(err.is_malformed());
    }

    #[tokio::test]
    async fn test_client_closed_before_request_line() {
        let (ours, theirs) = duplex(64);
        drop(theirs);
        let mut client = BufReader::new(ours);
        let err = DirectResolver::new(dialer())
            .resolve(&mut client)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ClientClosed));
    }

    #[tokio::test]
    async fn test_overlong_line_is_malformed() {
        let mut request = vec![b'A'; MAX_LINE_LENGTH + 10];
        request.extend_from_slice(b"\r\n");
        let (mut client, _peer) = client_with(&request).await;
        let err = DirectResolver::new(dialer())
            .resolve(&mut client)
            .await
            .unwrap_err();
        assert!(err.is_malformed());
    }

    #[tokio::test]
    async fn test_chained_forwards_headers_and_injects_credentials() {
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        let upstream =
            UpstreamProxy::parse(&format!("http://user:pass@{proxy_addr}")).unwrap();

        let request = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nEARLY";
        let (mut client, _peer) = client_with(request).await;

        let resolved = ChainedResolver::new(upstream, dialer())
            .resolve(&mut client)
            .await
            .unwrap();
        assert_eq!(
            resolved.destination,
            Destination {
                host: "example.com:443".to_string(),
                method: "CONNECT".to_string(),
                path: String::new(),
            }
        );
        assert!(client.buffered().is_empty());

        let (mut accepted, _) = proxy.accept().await.unwrap();
        drop(resolved);
        let received = String::from_utf8(read_available(&mut accepted).await).unwrap();
        assert_eq!(
            received,
            "CONNECT example.com:443 HTTP/1.1\r\n\
             Host: example.com:443\r\n\
             Proxy-Authorization: Basic dXNlcjpwYXNz\r\n\
             \r\n"
        );
    }

    #[tokio::test]
    async fn test_chained_without_credentials_is_verbatim() {
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = UpstreamProxy::parse(&proxy.local_addr().unwrap().to_string()).unwrap();

        let request = b"GET http://example.com/ HTTP/1.1\nHost: example.com\nAccept: */*\n\n";
        let (mut client, _peer) = client_with(request).await;

        let resolved = ChainedResolver::new(upstream, dialer())
            .resolve(&mut client)
            .await
            .unwrap();
        assert_eq!(resolved.destination.host, "http://example.com/");
        assert_eq!(resolved.destination.method, "GET");

        let (mut accepted, _) = proxy.accept().await.unwrap();
        drop(resolved);
        assert_eq!(read_available(&mut accepted).await, request.to_vec());
    }

    #[tokio::test]
    async fn test_chained_malformed_does_not_dial() {
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = UpstreamProxy::parse(&proxy.local_addr().unwrap().to_string()).unwrap();

        let (mut client, _peer) = client_with(b"GET\r\n\r\n").await;
        let err = ChainedResolver::new(upstream, dialer())
            .resolve(&mut client)
            .await
            .unwrap_err();
        assert!(err.is_malformed());

        let accepted = timeout(Duration::from_millis(100), proxy.accept()).await;
        assert!(accepted.is_err(), "upstream must not be dialed");
    }

    #[tokio::test]
    async fn test_chained_client_closes_mid_headers() {
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = UpstreamProxy::parse(&proxy.local_addr().unwrap().to_string()).unwrap();

        let (ours, mut theirs) = duplex(1024);
        theirs
            .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n")
            .await
            .unwrap();
        drop(theirs);
        let mut client = BufReader::new(ours);

        let err = ChainedResolver::new(upstream, dialer())
            .resolve(&mut client)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ClientClosed));
    }
}
