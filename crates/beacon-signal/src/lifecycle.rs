//! Connection lifecycle
//!
//! Drives one session through `Identified -> Receiving -> Closed`: register,
//! pump inbound frames into the router until the stream ends, then tear down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info};

use crate::registry::Registry;
use crate::router::Router;
use crate::session::{Session, SessionState, Transport};

/// Why a receive loop ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent a close frame or the stream ended
    PeerClosed,
    /// Read failed
    ReadError,
    /// No frame arrived within the idle timeout
    IdleTimeout,
    /// Session was closed from outside the loop, e.g. after being displaced
    Displaced,
}

/// Owns session setup, the receive loop and teardown
pub struct Lifecycle {
    registry: Arc<Registry>,
    router: Arc<Router>,
    idle_timeout: Option<Duration>,
    close_displaced: bool,
}

impl Lifecycle {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            registry: router.registry().clone(),
            router,
            idle_timeout: None,
            close_displaced: false,
        }
    }

    /// End sessions that stay silent for `timeout`
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Close a session when a newer connection registers the same identity
    pub fn with_close_displaced(mut self, enabled: bool) -> Self {
        self.close_displaced = enabled;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Create and register a session for an identified peer
    pub async fn open(
        &self,
        identity: String,
        remote_addr: Option<SocketAddr>,
        transport: impl Transport + 'static,
    ) -> Arc<Session> {
        let session = Arc::new(Session::new(
            self.registry.next_session_id(),
            identity,
            remote_addr,
            transport,
        ));

        if let Some(displaced) = self.registry.register(session.clone()) {
            if self.close_displaced {
                info!(
                    "Closing displaced session {}#{}",
                    displaced.identity(),
                    displaced.id()
                );
                if let Err(e) = displaced.close().await {
                    debug!("Error closing displaced session: {}", e);
                }
            } else {
                debug!(
                    "Session {}#{} displaced by #{}",
                    displaced.identity(),
                    displaced.id(),
                    session.id()
                );
            }
        }

        session.set_state(SessionState::Receiving);
        info!(
            "Peer connected: {} (#{}, {:?})",
            session.identity(),
            session.id(),
            remote_addr
        );
        session
    }

    /// Route inbound frames until the stream fails or closes
    pub async fn receive<S>(&self, session: &Session, mut stream: S) -> CloseReason
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        loop {
            let read = async {
                match self.idle_timeout {
                    Some(limit) => tokio::time::timeout(limit, stream.next()).await.ok(),
                    None => Some(stream.next().await),
                }
            };
            let next = tokio::select! {
                biased;
                _ = session.closed() => return CloseReason::Displaced,
                next = read => match next {
                    Some(next) => next,
                    None => return CloseReason::IdleTimeout,
                },
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    debug!("Error reading message from {}: {}", session.identity(), e);
                    return CloseReason::ReadError;
                }
                None => return CloseReason::PeerClosed,
            };

            match frame {
                Message::Text(text) => {
                    self.router.route_text(session, &text).await;
                }
                Message::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => {
                        self.router.route_text(session, &text).await;
                    }
                    Err(_) => {
                        self.router
                            .reject_malformed(session, "binary frame is not UTF-8")
                            .await;
                    }
                },
                Message::Ping(data) => {
                    if let Err(e) = session.send_frame(Message::Pong(data)).await {
                        debug!("Failed to answer ping from {}: {}", session.identity(), e);
                    }
                }
                Message::Close(_) => return CloseReason::PeerClosed,
                Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    /// Remove the session from the registry and release its transport
    pub async fn close(&self, session: &Session, reason: CloseReason) {
        self.registry.unregister_session(session);
        if let Err(e) = session.close().await {
            debug!("Error closing session {}: {}", session.identity(), e);
        }
        info!(
            "Peer disconnected: {} (#{}, {:?})",
            session.identity(),
            session.id(),
            reason
        );
    }

    /// Full lifecycle for one identified connection
    pub async fn run<S>(
        &self,
        identity: String,
        remote_addr: Option<SocketAddr>,
        transport: impl Transport + 'static,
        stream: S,
    ) -> CloseReason
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let session = self.open(identity, remote_addr, transport).await;
        let reason = self.receive(&session, stream).await;
        self.close(&session, reason).await;
        reason
    }
}
