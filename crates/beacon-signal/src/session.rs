//! Per-connection session state
//!
//! A [`Session`] is the relay's handle to one connected peer. The receive half
//! of the WebSocket stays with the lifecycle loop; the send half lives here
//! behind a lock so forwards from many origin sessions never interleave.

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::SignalError;
use crate::messages::SignalMessage;

/// Send half of a message-framed transport
#[async_trait]
pub trait Transport: Send {
    /// Write one complete frame
    async fn send(&mut self, frame: Message) -> Result<(), SignalError>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), SignalError>;
}

#[async_trait]
impl<S> Transport for SplitSink<WebSocketStream<S>, Message>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Message) -> Result<(), SignalError> {
        SinkExt::send(self, frame).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SignalError> {
        SinkExt::close(self).await?;
        Ok(())
    }
}

/// Lifecycle state of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Identity read, not yet registered
    Identified,
    /// Registered and running its receive loop
    Receiving,
    /// Torn down; sends fail
    Closed,
}

/// One live peer connection
pub struct Session {
    id: u64,
    identity: String,
    remote_addr: Option<SocketAddr>,
    state: Mutex<SessionState>,
    closed: Notify,
    transport: tokio::sync::Mutex<Box<dyn Transport>>,
}

impl Session {
    pub fn new(
        id: u64,
        identity: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        transport: impl Transport + 'static,
    ) -> Self {
        Self {
            id,
            identity: identity.into(),
            remote_addr,
            state: Mutex::new(SessionState::Identified),
            closed: Notify::new(),
            transport: tokio::sync::Mutex::new(Box::new(transport)),
        }
    }

    /// Connection id, unique within a registry
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Identity claimed by the peer at connect time
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Resolves once the session has been closed
    pub async fn closed(&self) {
        loop {
            let notified = self.closed.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Serialize and send a message as one text frame
    pub async fn send(&self, msg: &SignalMessage) -> Result<(), SignalError> {
        let json = msg.to_json()?;
        self.send_frame(Message::Text(json)).await
    }

    /// Send a raw frame, holding the send lock for the whole write
    pub async fn send_frame(&self, frame: Message) -> Result<(), SignalError> {
        let mut transport = self.transport.lock().await;
        if self.is_closed() {
            return Err(SignalError::SessionClosed(self.identity.clone()));
        }
        transport.send(frame).await
    }

    /// Mark the session closed and release the transport
    ///
    /// Safe to call more than once; only the first call touches the transport.
    pub async fn close(&self) -> Result<(), SignalError> {
        let mut transport = self.transport.lock().await;
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return Ok(());
            }
            *state = SessionState::Closed;
        }
        self.closed.notify_waiters();
        transport.close().await
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}
