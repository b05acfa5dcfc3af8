//! WebSocket signal server implementation

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

use beacon_core::Config;

use crate::error::SignalError;
use crate::lifecycle::Lifecycle;
use crate::registry::Registry;
use crate::router::Router;

/// Query parameter carrying the peer identity
pub const IDENTITY_PARAM: &str = "id";

/// Pause after a failed accept so descriptor exhaustion does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bytes inspected when sniffing for monitoring requests
const PEEK_LEN: usize = 64;
const PEEK_ATTEMPTS: usize = 20;
const PEEK_RETRY: Duration = Duration::from_millis(10);

/// Signal server state
pub struct SignalServer {
    lifecycle: Arc<Lifecycle>,
    ws_path: Arc<str>,
    ws_config: WebSocketConfig,
}

impl SignalServer {
    pub fn new(config: &Config) -> Self {
        Self::with_registry(config, Arc::new(Registry::new()))
    }

    /// Build a server around an existing registry
    pub fn with_registry(config: &Config, registry: Arc<Registry>) -> Self {
        let router = Router::new(registry).with_error_replies(config.relay.notify_errors);
        let lifecycle = Lifecycle::new(Arc::new(router))
            .with_idle_timeout(config.server.idle_timeout())
            .with_close_displaced(config.relay.close_displaced);

        let ws_config = WebSocketConfig {
            max_message_size: Some(config.server.max_message_bytes),
            max_frame_size: Some(config.server.max_message_bytes),
            ..Default::default()
        };

        Self {
            lifecycle: Arc::new(lifecycle),
            ws_path: Arc::from(config.server.ws_path.as_str()),
            ws_config,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.lifecycle.registry()
    }

    /// Number of registered peers (for monitoring)
    pub fn peer_count(&self) -> usize {
        self.registry().len()
    }

    /// Bind `addr` and serve until the process exits
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), SignalError> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener, std::future::pending()).await
    }

    /// Accept connections on `listener` until `shutdown` resolves
    pub async fn serve_listener<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), SignalError>
    where
        F: Future<Output = ()>,
    {
        info!("Signal server listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            let (stream, peer_addr) = tokio::select! {
                accepted = accept_with_backoff(|| listener.accept()) => accepted,
                _ = &mut shutdown => {
                    info!("Signal server shutting down");
                    return Ok(());
                }
            };

            let lifecycle = self.lifecycle.clone();
            let ws_path = self.ws_path.clone();
            let ws_config = self.ws_config;

            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(stream, peer_addr, lifecycle, ws_path, ws_config).await
                {
                    debug!("Connection error from {}: {}", peer_addr, e);
                }
            });
        }
    }
}

/// Retry `accept` until it succeeds, pausing after each failure
async fn accept_with_backoff<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Handle a single connection (HTTP or WebSocket)
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    lifecycle: Arc<Lifecycle>,
    ws_path: Arc<str>,
    ws_config: WebSocketConfig,
) -> Result<(), SignalError> {
    // Peek at the request line to pick out plain HTTP monitoring requests
    let mut peek_buf = [0u8; PEEK_LEN];
    let n = peek_request_line(&stream, &mut peek_buf).await?;
    if let Some(path) = monitoring_path(&peek_buf[..n]) {
        return handle_http_request(&mut stream, path, lifecycle.registry()).await;
    }

    let mut identity = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() != &*ws_path {
            return Err(reject(StatusCode::NOT_FOUND, "not found"));
        }
        match identity_from_query(req.uri().query()) {
            Some(id) => {
                identity = Some(id);
                Ok(resp)
            }
            None => Err(reject(StatusCode::BAD_REQUEST, "peer id not provided")),
        }
    };

    let ws_stream = accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
    let Some(identity) = identity else {
        return Err(SignalError::Handshake("peer id not provided".into()));
    };

    let (sink, source) = ws_stream.split();
    lifecycle.run(identity, Some(peer_addr), sink, source).await;
    Ok(())
}

/// Peek until the first line is complete, the buffer is full or the peer
/// stops sending. Returns the number of bytes available in `buf`.
async fn peek_request_line(stream: &TcpStream, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut n = 0;
    for _ in 0..PEEK_ATTEMPTS {
        n = stream.peek(buf).await?;
        if n == 0 || n == buf.len() || buf[..n].contains(&b'\n') {
            break;
        }
        tokio::time::sleep(PEEK_RETRY).await;
    }
    Ok(n)
}

/// Path of a plain HTTP monitoring request, if the request line is one
fn monitoring_path(head: &[u8]) -> Option<&'static str> {
    let line = head.split(|b| *b == b'\r' || *b == b'\n').next()?;
    let mut parts = line.split(|b| *b == b' ');
    if parts.next()? != b"GET" {
        return None;
    }
    match parts.next()? {
        b"/health" => Some("/health"),
        b"/stats" => Some("/stats"),
        _ => None,
    }
}

/// Peer identity from the upgrade request's query string
fn identity_from_query(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == IDENTITY_PARAM)
        .map(|(_, value)| value.into_owned())
        .filter(|id| !id.is_empty())
}

fn reject(status: StatusCode, body: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(body.to_string()));
    *resp.status_mut() = status;
    resp
}

/// Handle an HTTP request (for health checks)
async fn handle_http_request(
    stream: &mut TcpStream,
    path: &str,
    registry: &Registry,
) -> Result<(), SignalError> {
    // Drain the request head; the path was already read from the peek
    let mut buf = vec![0u8; 1024];
    let _ = stream.read(&mut buf).await?;

    let peer_count = registry.len();
    let body = match path {
        "/health" => format!(r#"{{"status":"healthy","peers":{}}}"#, peer_count),
        _ => format!(r#"{{"peers":{}}}"#, peer_count),
    };

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_creation() {
        let server = SignalServer::new(&Config::default());
        assert_eq!(server.peer_count(), 0);
    }

    #[test]
    fn test_identity_from_query() {
        assert_eq!(identity_from_query(Some("id=alice")), Some("alice".into()));
        assert_eq!(
            identity_from_query(Some("x=1&id=bob%20smith&id=other")),
            Some("bob smith".into())
        );
        assert_eq!(identity_from_query(Some("id=")), None);
        assert_eq!(identity_from_query(Some("name=alice")), None);
        assert_eq!(identity_from_query(None), None);
    }

    #[test]
    fn test_monitoring_path() {
        assert_eq!(monitoring_path(b"GET /health HTTP/1.1\r\nHost: x"), Some("/health"));
        assert_eq!(monitoring_path(b"GET /stats HTTP/1.1\r\n"), Some("/stats"));
        assert_eq!(monitoring_path(b"GET /ws?id=alice HTTP/1.1\r\n"), None);
        assert_eq!(monitoring_path(b"POST /health HTTP/1.1\r\n"), None);
        assert_eq!(monitoring_path(b"GE"), None);
    }

    #[tokio::test]
    async fn test_accept_failures_back_off() {
        let mut attempts = 0;
        let started = std::time::Instant::now();

        let accepted = accept_with_backoff(|| {
            attempts += 1;
            let result = if attempts < 3 {
                Err(std::io::Error::from_raw_os_error(24))
            } else {
                Ok(attempts)
            };
            async move { result }
        })
        .await;

        assert_eq!(accepted, 3);
        assert!(started.elapsed() >= ACCEPT_BACKOFF * 2);
    }

    #[tokio::test]
    async fn test_peek_waits_for_full_request_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"GET /hea").await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            client.write_all(b"lth HTTP/1.1\r\n").await.unwrap();
            client
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; PEEK_LEN];
        let n = peek_request_line(&stream, &mut buf).await.unwrap();

        assert!(buf[..n].contains(&b'\n'));
        assert_eq!(monitoring_path(&buf[..n]), Some("/health"));
        drop(client.await.unwrap());
    }

    #[tokio::test]
    async fn test_peek_stops_when_buffer_full() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[b'x'; PEEK_LEN * 2]).await.unwrap();

        let (stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; PEEK_LEN];
        let n = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let n = peek_request_line(&stream, &mut buf).await.unwrap();
                if n == PEEK_LEN {
                    return n;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(n, PEEK_LEN);
    }
}
