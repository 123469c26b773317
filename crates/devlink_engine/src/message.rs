//! Message protocol: flat JSON envelopes tagged by a `type` field.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::identity::DeviceIdentity;

/// Kind-specific fields of an [`Envelope`].
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// The kind of message carried in an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    // ── Handshake & liveness ────────────────────────────────────────
    /// Device identity announcement (`device_info`).
    Identity,
    /// Keep-alive, answered unless it is itself a reply.
    Heartbeat,
    /// Sent by a listener right after accepting a connection.
    ConnectionEstablished,
    /// Reply to an identity frame, carrying the responder's identity.
    AuthenticationSuccess,

    // ── Application payloads ────────────────────────────────────────
    FileTransfer,
    ScreenFrame,
    ControlCommand,
    ControlEvent,
    Notification,
    Clipboard,

    // ── Protocol control ────────────────────────────────────────────
    Ack,
    Error,

    /// Any `type` this engine does not know, preserved verbatim.
    Unknown(String),
}

impl MessageKind {
    /// The `type` string used on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Identity => "device_info",
            Self::Heartbeat => "heartbeat",
            Self::ConnectionEstablished => "connection_established",
            Self::AuthenticationSuccess => "authentication_success",
            Self::FileTransfer => "file_transfer",
            Self::ScreenFrame => "screen_frame",
            Self::ControlCommand => "control_command",
            Self::ControlEvent => "control_event",
            Self::Notification => "notification",
            Self::Clipboard => "clipboard",
            Self::Ack => "ack",
            Self::Error => "error",
            Self::Unknown(name) => name,
        }
    }
}

impl From<String> for MessageKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "device_info" => Self::Identity,
            "heartbeat" => Self::Heartbeat,
            "connection_established" => Self::ConnectionEstablished,
            "authentication_success" => Self::AuthenticationSuccess,
            "file_transfer" => Self::FileTransfer,
            "screen_frame" => Self::ScreenFrame,
            "control_command" => Self::ControlCommand,
            "control_event" => Self::ControlEvent,
            "notification" => Self::Notification,
            "clipboard" => Self::Clipboard,
            "ack" => Self::Ack,
            "error" => Self::Error,
            _ => Self::Unknown(s),
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message on the wire.
///
/// Serialized as a single flat object:
/// `{"type": "...", "messageId": "...", "timestamp": 1700000000000, ...payload}`.
/// `message_id` and `timestamp` are stamped when the envelope is sent; peers
/// that omit them on inbound frames get empty/zero defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(rename = "messageId", default)]
    pub message_id: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    /// Create an unstamped envelope of the given kind.
    pub fn new(kind: MessageKind, payload: Payload) -> Self {
        Self {
            kind,
            message_id: String::new(),
            timestamp: 0,
            payload,
        }
    }

    /// Create an envelope from a JSON object literal. Non-object values
    /// yield an empty payload.
    pub fn with_json(kind: MessageKind, payload: serde_json::Value) -> Self {
        match payload {
            serde_json::Value::Object(map) => Self::new(kind, map),
            _ => Self::new(kind, Payload::new()),
        }
    }

    /// `device_info` carrying our identity.
    pub fn identity(identity: &DeviceIdentity) -> Self {
        Self::with_json(
            MessageKind::Identity,
            serde_json::json!({ "deviceInfo": identity }),
        )
    }

    /// An unsolicited keep-alive.
    pub fn heartbeat() -> Self {
        Self::new(MessageKind::Heartbeat, Payload::new())
    }

    /// A keep-alive sent in answer to a peer's heartbeat. Never answered.
    pub fn heartbeat_reply() -> Self {
        Self::with_json(MessageKind::Heartbeat, serde_json::json!({ "reply": true }))
    }

    /// Listener greeting naming the connection id assigned by the listener.
    pub fn connection_established(connection_id: &str) -> Self {
        Self::with_json(
            MessageKind::ConnectionEstablished,
            serde_json::json!({
                "connectionId": connection_id,
                "serverTime": Utc::now().timestamp_millis(),
            }),
        )
    }

    /// Reply to an identity frame carrying our own identity.
    pub fn authentication_success(identity: &DeviceIdentity) -> Self {
        Self::with_json(
            MessageKind::AuthenticationSuccess,
            serde_json::json!({ "serverDeviceInfo": identity }),
        )
    }

    /// Acknowledge the message with the given id.
    pub fn ack(message_id: &str) -> Self {
        Self::with_json(MessageKind::Ack, serde_json::json!({ "ackMessageId": message_id }))
    }

    /// An error report for the peer.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::with_json(
            MessageKind::Error,
            serde_json::json!({ "errorCode": code, "errorMessage": message.into() }),
        )
    }

    /// Assign a fresh message id and the current time.
    pub fn stamp(&mut self) {
        self.message_id = uuid::Uuid::new_v4().to_string();
        self.timestamp = Utc::now().timestamp_millis();
    }

    /// Read a string field from the payload.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    /// Whether this is a heartbeat sent in reply to another heartbeat.
    pub fn is_heartbeat_reply(&self) -> bool {
        self.kind == MessageKind::Heartbeat
            && self
                .payload
                .get("reply")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
    }

    /// Parse the identity carried under `key` (`deviceInfo` or
    /// `serverDeviceInfo`).
    pub fn device_identity(&self, key: &str) -> Result<DeviceIdentity, serde_json::Error> {
        let value = self
            .payload
            .get(key)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value)
    }

    /// Serialize the envelope to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize an envelope from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
