//! Message routing
//!
//! Each inbound frame is decoded and dispatched on its `type`:
//! - `offer`, `answer`, `ice-candidate`: forwarded verbatim to `to`
//! - `get-peers`: answered with a `peer-list` for the sender only
//! - anything else: logged and dropped
//!
//! Failures never reach past the origin session. By default the sender gets
//! no notice; with `notify_errors` it receives an `error` message instead.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::messages::{ErrorCode, MessageKind, SignalMessage};
use crate::registry::Registry;
use crate::session::Session;

/// What the router did with one message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered to the named peer
    Forwarded { to: String },
    /// `peer-list` sent back to the origin
    PeerList { count: usize },
    /// No session registered under the target identity
    TargetNotFound { to: String },
    /// Negotiation message had no `to`
    MissingTarget,
    /// Target was found but its transport failed
    ForwardFailed { to: String },
    /// Reply to the origin could not be sent
    ReplyFailed,
    /// Type is not one the relay routes
    Unrecognized { kind: String },
    /// Frame could not be decoded
    Malformed,
}

/// Dispatches decoded messages using a shared registry
pub struct Router {
    registry: Arc<Registry>,
    notify_errors: bool,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            notify_errors: false,
        }
    }

    /// Reply to the sender with an `error` message on routing failures
    pub fn with_error_replies(mut self, enabled: bool) -> Self {
        self.notify_errors = enabled;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Decode a text frame and route it
    pub async fn route_text(&self, origin: &Session, text: &str) -> RouteOutcome {
        match SignalMessage::from_json(text) {
            Ok(msg) => self.route(origin, msg).await,
            Err(e) => self.reject_malformed(origin, &e.to_string()).await,
        }
    }

    /// Report a frame that could not be decoded
    pub async fn reject_malformed(&self, origin: &Session, reason: &str) -> RouteOutcome {
        warn!("Malformed message from {}: {}", origin.identity(), reason);
        self.notify(origin, ErrorCode::MalformedMessage, &format!("malformed message: {}", reason))
            .await;
        RouteOutcome::Malformed
    }

    /// Route one decoded message from `origin`
    pub async fn route(&self, origin: &Session, mut msg: SignalMessage) -> RouteOutcome {
        msg.from = Some(origin.identity().to_string());

        match msg.kind() {
            kind if kind.is_negotiation() => self.forward(origin, msg).await,
            MessageKind::GetPeers => self.reply_peer_list(origin).await,
            _ => {
                warn!("Unknown message type from {}: {}", origin.identity(), msg.kind);
                self.notify(
                    origin,
                    ErrorCode::UnknownType,
                    &format!("unknown message type: {}", msg.kind),
                )
                .await;
                RouteOutcome::Unrecognized { kind: msg.kind }
            }
        }
    }

    async fn forward(&self, origin: &Session, msg: SignalMessage) -> RouteOutcome {
        let Some(to) = msg.to.clone() else {
            warn!("{} from {} has no target", msg.kind, origin.identity());
            self.notify(origin, ErrorCode::MissingTarget, "message has no target")
                .await;
            return RouteOutcome::MissingTarget;
        };

        let Some(target) = self.registry.lookup(&to) else {
            warn!("Target peer not found: {} (from {})", to, origin.identity());
            self.notify(
                origin,
                ErrorCode::TargetNotFound,
                &format!("peer {} is not connected", to),
            )
            .await;
            return RouteOutcome::TargetNotFound { to };
        };

        match target.send(&msg).await {
            Ok(()) => {
                debug!("Forwarded {} {} -> {}", msg.kind, origin.identity(), to);
                RouteOutcome::Forwarded { to }
            }
            Err(e) => {
                warn!("Error forwarding {} to {}: {}", msg.kind, to, e);
                RouteOutcome::ForwardFailed { to }
            }
        }
    }

    async fn reply_peer_list(&self, origin: &Session) -> RouteOutcome {
        let peers = self.registry.list(origin.identity());
        let count = peers.len();

        let sent = match SignalMessage::peer_list(origin.identity(), &peers) {
            Ok(reply) => origin.send(&reply).await,
            Err(e) => Err(e.into()),
        };

        match sent {
            Ok(()) => {
                debug!("Sent peer list to {} ({} peers)", origin.identity(), count);
                RouteOutcome::PeerList { count }
            }
            Err(e) => {
                warn!("Error sending peer list to {}: {}", origin.identity(), e);
                RouteOutcome::ReplyFailed
            }
        }
    }

    async fn notify(&self, origin: &Session, code: ErrorCode, message: &str) {
        if !self.notify_errors {
            return;
        }

        let sent = match SignalMessage::error(origin.identity(), code, message) {
            Ok(reply) => origin.send(&reply).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            debug!("Error sending error reply to {}: {}", origin.identity(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::SERVER_ID;
    use crate::session::testing::{channel_session, drain_text, BrokenTransport};

    fn registered(
        registry: &Arc<Registry>,
        identity: &str,
    ) -> (
        Arc<Session>,
        tokio::sync::mpsc::UnboundedReceiver<tokio_tungstenite::tungstenite::Message>,
    ) {
        let (session, rx) = channel_session(registry.next_session_id(), identity);
        registry.register(session.clone());
        (session, rx)
    }

    #[tokio::test]
    async fn test_forward_overwrites_from() {
        let registry = Arc::new(Registry::new());
        let router = Router::new(registry.clone());
        let (alice, mut alice_rx) = registered(&registry, "alice");
        let (_bob, mut bob_rx) = registered(&registry, "bob");

        let text = r#"{"type":"offer","to":"bob","from":"mallory","payload":"{\"sdp\":\"v=0\"}"}"#;
        let outcome = router.route_text(&alice, text).await;
        assert_eq!(outcome, RouteOutcome::Forwarded { to: "bob".into() });

        let frames = drain_text(&mut bob_rx);
        assert_eq!(frames.len(), 1);
        let msg = SignalMessage::from_json(&frames[0]).unwrap();
        assert_eq!(msg.kind(), MessageKind::Offer);
        assert_eq!(msg.from.as_deref(), Some("alice"));
        assert_eq!(msg.to.as_deref(), Some("bob"));
        assert_eq!(msg.payload_json(), Some(r#""{\"sdp\":\"v=0\"}""#));

        assert!(drain_text(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn test_negotiation_types_forward_alike() {
        let registry = Arc::new(Registry::new());
        let router = Router::new(registry.clone());
        let (alice, _alice_rx) = registered(&registry, "alice");
        let (_bob, mut bob_rx) = registered(&registry, "bob");

        for kind in ["offer", "answer", "ice-candidate"] {
            let text = format!(r#"{{"type":"{}","to":"bob","payload":{{"n":1}}}}"#, kind);
            assert_eq!(
                router.route_text(&alice, &text).await,
                RouteOutcome::Forwarded { to: "bob".into() }
            );
        }

        let kinds: Vec<_> = drain_text(&mut bob_rx)
            .iter()
            .map(|f| SignalMessage::from_json(f).unwrap().kind)
            .collect();
        assert_eq!(kinds, vec!["offer", "answer", "ice-candidate"]);
    }

    #[tokio::test]
    async fn test_unknown_target_is_dropped() {
        let registry = Arc::new(Registry::new());
        let router = Router::new(registry.clone());
        let (alice, mut alice_rx) = registered(&registry, "alice");
        let (_bob, mut bob_rx) = registered(&registry, "bob");

        let outcome = router
            .route_text(&alice, r#"{"type":"offer","to":"nobody","payload":{}}"#)
            .await;
        assert_eq!(outcome, RouteOutcome::TargetNotFound { to: "nobody".into() });

        let outcome = router.route_text(&alice, r#"{"type":"answer"}"#).await;
        assert_eq!(outcome, RouteOutcome::MissingTarget);

        assert!(drain_text(&mut alice_rx).is_empty());
        assert!(drain_text(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_get_peers_replies_to_origin_only() {
        let registry = Arc::new(Registry::new());
        let router = Router::new(registry.clone());
        let (alice, mut alice_rx) = registered(&registry, "alice");
        let (_bob, mut bob_rx) = registered(&registry, "bob");
        let (_carol, mut carol_rx) = registered(&registry, "carol");

        let outcome = router.route_text(&alice, r#"{"type":"get-peers"}"#).await;
        assert_eq!(outcome, RouteOutcome::PeerList { count: 2 });

        let frames = drain_text(&mut alice_rx);
        assert_eq!(frames.len(), 1);
        let reply = SignalMessage::from_json(&frames[0]).unwrap();
        assert_eq!(reply.kind(), MessageKind::PeerList);
        assert_eq!(reply.from.as_deref(), Some(SERVER_ID));
        assert_eq!(reply.to.as_deref(), Some("alice"));

        let mut peers: Vec<String> = serde_json::from_str(reply.payload_json().unwrap()).unwrap();
        peers.sort();
        assert_eq!(peers, vec!["bob".to_string(), "carol".to_string()]);

        assert!(drain_text(&mut bob_rx).is_empty());
        assert!(drain_text(&mut carol_rx).is_empty());
    }

    #[tokio::test]
    async fn test_get_peers_when_alone() {
        let registry = Arc::new(Registry::new());
        let router = Router::new(registry.clone());
        let (alice, mut alice_rx) = registered(&registry, "alice");

        assert_eq!(
            router.route_text(&alice, r#"{"type":"get-peers"}"#).await,
            RouteOutcome::PeerList { count: 0 }
        );
        let reply = SignalMessage::from_json(&drain_text(&mut alice_rx)[0]).unwrap();
        assert_eq!(reply.payload_json(), Some("[]"));
    }

    #[tokio::test]
    async fn test_unrecognized_and_malformed() {
        let registry = Arc::new(Registry::new());
        let router = Router::new(registry.clone());
        let (alice, mut alice_rx) = registered(&registry, "alice");

        assert_eq!(
            router.route_text(&alice, r#"{"type":"hello"}"#).await,
            RouteOutcome::Unrecognized { kind: "hello".into() }
        );
        assert_eq!(
            router.route_text(&alice, r#"{"type":"peer-list","to":"alice"}"#).await,
            RouteOutcome::Unrecognized { kind: "peer-list".into() }
        );
        assert_eq!(router.route_text(&alice, "{oops").await, RouteOutcome::Malformed);

        assert!(drain_text(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn test_error_replies_when_enabled() {
        let registry = Arc::new(Registry::new());
        let router = Router::new(registry.clone()).with_error_replies(true);
        let (alice, mut alice_rx) = registered(&registry, "alice");

        router
            .route_text(&alice, r#"{"type":"offer","to":"ghost"}"#)
            .await;
        router.route_text(&alice, r#"{"type":"hello"}"#).await;
        router.route_text(&alice, "][").await;

        let codes: Vec<String> = drain_text(&mut alice_rx)
            .iter()
            .map(|f| {
                let msg = SignalMessage::from_json(f).unwrap();
                assert_eq!(msg.kind(), MessageKind::Error);
                assert_eq!(msg.from.as_deref(), Some(SERVER_ID));
                let payload: serde_json::Value =
                    serde_json::from_str(msg.payload_json().unwrap()).unwrap();
                payload["code"].as_str().unwrap().to_string()
            })
            .collect();

        assert_eq!(
            codes,
            vec!["target_not_found", "unknown_type", "malformed_message"]
        );
    }

    #[tokio::test]
    async fn test_forward_failure_does_not_affect_origin() {
        let registry = Arc::new(Registry::new());
        let router = Router::new(registry.clone());
        let (alice, mut alice_rx) = registered(&registry, "alice");

        let broken = Arc::new(Session::new(registry.next_session_id(), "bob", None, BrokenTransport));
        registry.register(broken);

        let outcome = router
            .route_text(&alice, r#"{"type":"ice-candidate","to":"bob","payload":{}}"#)
            .await;
        assert_eq!(outcome, RouteOutcome::ForwardFailed { to: "bob".into() });
        assert!(drain_text(&mut alice_rx).is_empty());
        assert!(!alice.is_closed());
    }

    #[tokio::test]
    async fn test_forward_to_closed_session_fails() {
        let registry = Arc::new(Registry::new());
        let router = Router::new(registry.clone());
        let (alice, _alice_rx) = registered(&registry, "alice");
        let (bob, mut bob_rx) = registered(&registry, "bob");

        bob.close().await.unwrap();
        let outcome = router
            .route_text(&alice, r#"{"type":"offer","to":"bob"}"#)
            .await;
        assert_eq!(outcome, RouteOutcome::ForwardFailed { to: "bob".into() });
        assert!(drain_text(&mut bob_rx).is_empty());
    }
}
