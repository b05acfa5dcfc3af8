//! Signal protocol messages
//!
//! Every frame on the signaling WebSocket is a JSON object with four fields:
//! `type`, `to`, `from` and `payload`. The relay only reads `type` and `to`;
//! `payload` is carried as raw JSON text and never re-encoded.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;

/// Sender name used on messages produced by the relay itself
pub const SERVER_ID: &str = "server";

/// Known message types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Session description offer
    Offer,
    /// Session description answer
    Answer,
    /// Network reachability candidate
    IceCandidate,
    /// Request for the list of connected peers
    GetPeers,
    /// Reply to `get-peers`
    PeerList,
    /// Relay-generated error notice
    Error,
    /// Anything else
    Unknown,
}

impl MessageKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "offer" => Self::Offer,
            "answer" => Self::Answer,
            "ice-candidate" => Self::IceCandidate,
            "get-peers" => Self::GetPeers,
            "peer-list" => Self::PeerList,
            "error" => Self::Error,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::GetPeers => "get-peers",
            Self::PeerList => "peer-list",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }

    /// Negotiation messages are forwarded verbatim to their target
    pub fn is_negotiation(self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::IceCandidate)
    }
}

/// A message sent over the signaling WebSocket
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalMessage {
    /// Message type discriminator
    #[serde(rename = "type")]
    pub kind: String,

    /// Target peer identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    /// Sender identity, always set by the relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Opaque payload, kept as the exact JSON text the sender produced
    #[serde(
        default,
        deserialize_with = "raw_payload",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload: Option<Box<RawValue>>,
}

/// Keeps an explicit `null` payload instead of collapsing it to `None`
fn raw_payload<'de, D>(deserializer: D) -> Result<Option<Box<RawValue>>, D::Error>
where
    D: Deserializer<'de>,
{
    Box::<RawValue>::deserialize(deserializer).map(Some)
}

/// Error codes carried in `error` replies
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No peer is registered under the target identity
    TargetNotFound,

    /// A negotiation message arrived without `to`
    MissingTarget,

    /// The frame was not a valid message
    MalformedMessage,

    /// The message type is not one the relay routes
    UnknownType,
}

#[derive(Serialize)]
struct ErrorPayload<'a> {
    code: ErrorCode,
    message: &'a str,
}

impl SignalMessage {
    /// Build a message with no payload
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            to: None,
            from: None,
            payload: None,
        }
    }

    /// Build a `peer-list` reply addressed to `to`
    pub fn peer_list(to: &str, peers: &[String]) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: MessageKind::PeerList.as_str().to_string(),
            to: Some(to.to_string()),
            from: Some(SERVER_ID.to_string()),
            payload: Some(serde_json::value::to_raw_value(peers)?),
        })
    }

    /// Build an `error` reply addressed to `to`
    pub fn error(to: &str, code: ErrorCode, message: &str) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: MessageKind::Error.as_str().to_string(),
            to: Some(to.to_string()),
            from: Some(SERVER_ID.to_string()),
            payload: Some(serde_json::value::to_raw_value(&ErrorPayload { code, message })?),
        })
    }

    /// Classified message type
    pub fn kind(&self) -> MessageKind {
        MessageKind::parse(&self.kind)
    }

    /// Payload as raw JSON text
    pub fn payload_json(&self) -> Option<&str> {
        self.payload.as_deref().map(RawValue::get)
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
