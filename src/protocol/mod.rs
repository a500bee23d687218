//! DDP wire protocol: message types, frame parsing, and helpers shared by
//! the connection engine.
//!
//! Every frame is a JSON object whose `msg` field is the discriminator.
//! Outbound frames are [`ClientMessage`]; inbound frames are classified by
//! [`parse_server_frame`] into an [`Inbound`] so the dispatcher can tell a
//! well-formed message from one it must log and discard.

pub mod diff;
pub mod random;

pub use diff::apply_changes;
pub use random::{random_id, rpc_seed};

use crate::error::MethodError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A document as held by a store: field name -> value, including `_id`.
pub type Document = serde_json::Map<String, Value>;

/// DDP versions this client can speak, most preferred first.
pub const SUPPORTED_DDP_VERSIONS: [&str; 3] = ["1", "pre2", "pre1"];

/// Version that predates heartbeats.
pub const LEGACY_VERSION: &str = "pre1";

/// Message kinds the dispatcher routes. Anything else is discarded.
const KNOWN_SERVER_KINDS: [&str; 12] = [
    "connected", "failed", "ping", "pong", "added", "changed", "removed", "ready", "updated",
    "nosub", "result", "error",
];

// ── Client → Server ─────────────────────────────────────────────

/// Frames the client sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Opens a session. Sent only in response to a stream reset.
    Connect {
        version: String,
        support: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
    /// Remote procedure call.
    Method {
        id: String,
        method: String,
        params: Vec<Value>,
        #[serde(
            rename = "randomSeed",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        random_seed: Option<String>,
    },
    Sub {
        id: String,
        name: String,
        params: Vec<Value>,
    },
    Unsub {
        id: String,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

impl ClientMessage {
    /// Serialize to the JSON text frame sent over the stream.
    pub fn to_frame(&self) -> String {
        // Serializing these variants cannot fail: every field is a string,
        // a JSON value, or a vector of either.
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!("failed to serialize DDP frame: {e}");
            String::new()
        })
    }
}

// ── Server → Client ─────────────────────────────────────────────

/// Frames the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ServerMessage {
    Connected {
        #[serde(default)]
        session: Option<String>,
    },
    /// The server refuses the proposed version and suggests another.
    Failed {
        #[serde(default)]
        version: Option<String>,
    },
    Ping {
        #[serde(default)]
        id: Option<String>,
    },
    Pong {
        #[serde(default)]
        id: Option<String>,
    },
    Added {
        collection: String,
        id: String,
        #[serde(default)]
        fields: Option<Document>,
    },
    Changed {
        collection: String,
        id: String,
        #[serde(default)]
        fields: Option<Document>,
        #[serde(default)]
        cleared: Option<Vec<String>>,
    },
    Removed {
        collection: String,
        id: String,
    },
    /// Subscriptions whose initial data set is complete.
    Ready {
        subs: Vec<String>,
    },
    /// Methods whose writes have all been sent ("method data done").
    Updated {
        methods: Vec<String>,
    },
    Nosub {
        id: String,
        #[serde(default)]
        error: Option<MethodError>,
    },
    Result {
        id: String,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<MethodError>,
    },
    Error {
        #[serde(default)]
        reason: Option<String>,
        #[serde(rename = "offendingMessage", default)]
        offending_message: Option<Value>,
    },
}

/// A server message that feeds the data path (store writes, readiness,
/// method data-done).
#[derive(Debug, Clone, PartialEq)]
pub enum DataMessage {
    Added {
        collection: String,
        id: String,
        fields: Option<Document>,
    },
    Changed {
        collection: String,
        id: String,
        fields: Option<Document>,
        cleared: Option<Vec<String>>,
    },
    Removed {
        collection: String,
        id: String,
    },
    Ready {
        subs: Vec<String>,
    },
    Updated {
        methods: Vec<String>,
    },
    Nosub {
        id: String,
    },
}

impl DataMessage {
    /// `added`, `changed` and `removed` may be coalesced by the write buffer;
    /// every other kind forces a flush.
    pub fn is_standard_write(&self) -> bool {
        matches!(
            self,
            Self::Added { .. } | Self::Changed { .. } | Self::Removed { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added { .. } => "added",
            Self::Changed { .. } => "changed",
            Self::Removed { .. } => "removed",
            Self::Ready { .. } => "ready",
            Self::Updated { .. } => "updated",
            Self::Nosub { .. } => "nosub",
        }
    }
}

// ── Frame parsing ───────────────────────────────────────────────

/// Classification of one inbound frame that was valid JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A message the dispatcher understands.
    Message(ServerMessage),
    /// A frame carrying only `server_id`, sent by some servers on connect.
    ServerId,
    /// JSON without a string `msg` field.
    Invalid(Value),
    /// A `msg` kind this client does not handle.
    Unknown { kind: String, raw: Value },
    /// A known `msg` kind whose fields do not match the protocol.
    Malformed { kind: String, error: String },
}

/// Parse one text frame.
///
/// Returns `Err` only when the frame is not JSON at all; every JSON frame,
/// well-formed or not, counts as proof of life for the heartbeat.
pub fn parse_server_frame(raw: &str) -> Result<Inbound, serde_json::Error> {
    let value: Value = serde_json::from_str(raw)?;

    let kind = match value.get("msg").and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => {
            let only_server_id = value
                .as_object()
                .is_some_and(|obj| obj.len() == 1 && obj.contains_key("server_id"));
            return Ok(if only_server_id {
                Inbound::ServerId
            } else {
                Inbound::Invalid(value)
            });
        }
    };

    if !KNOWN_SERVER_KINDS.contains(&kind.as_str()) {
        return Ok(Inbound::Unknown { kind, raw: value });
    }

    match serde_json::from_value::<ServerMessage>(value) {
        Ok(msg) => Ok(Inbound::Message(msg)),
        Err(e) => Ok(Inbound::Malformed {
            kind,
            error: e.to_string(),
        }),
    }
}

// ── Tests ───────────────────────────────────────────────────────
