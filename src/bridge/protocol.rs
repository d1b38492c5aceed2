//! Bridge wire format.
//!
//! Every frame is one JSON object tagged by `kind`. Over a byte stream
//! (process stdio) frames are newline-delimited; over a WebSocket each
//! text message is one frame.
//!
//! ```json
//! {"kind":"ready","sessionId":"4c1e..."}
//! {"kind":"request","correlationId":7,"name":"renders","payload":{"selector":"#root"}}
//! {"kind":"result","correlationId":7,"outcome":{"status":"pass"},"timestampOrdering":3}
//! {"kind":"lifecycle","signal":"close"}
//! ```
//!
//! Payloads are opaque and never inspected on the local side.

use crate::errors::{BridgeError, FailureKind};
use crate::room::Room;
use crate::task::Outcome;
use serde::{Deserialize, Serialize};

/// Unique, monotonically assigned id of a request within one channel.
pub type CorrelationId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeMessage {
    /// Handshake from the room once it can accept requests.
    #[serde(rename_all = "camelCase")]
    Ready {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<Room>,
    },
    #[serde(rename_all = "camelCase")]
    Request {
        correlation_id: CorrelationId,
        name: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    Result {
        correlation_id: CorrelationId,
        outcome: RemoteOutcome,
        /// Order in which the room produced its results
        #[serde(default)]
        timestamp_ordering: u64,
    },
    Lifecycle {
        signal: LifecycleSignal,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleSignal {
    /// Sent by the controller on teardown.
    Close,
    /// Sent by the room when it is going away.
    Exit,
}

/// Result of an assertion as reported by the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RemoteOutcome {
    Pass {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<serde_json::Value>,
    },
    /// The assertion ran and did not hold.
    Fail { message: String },
    /// The assertion could not run.
    Error { message: String },
}

impl RemoteOutcome {
    pub fn pass() -> Self {
        Self::Pass { value: None }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Map to a task outcome.
    pub fn into_outcome(self) -> Outcome {
        match self {
            Self::Pass { value: None } => Outcome::success(),
            Self::Pass { value: Some(value) } => Outcome::Success {
                artifact: Some(value),
            },
            Self::Fail { message } => Outcome::failure(FailureKind::AssertionFailed, message),
            Self::Error { message } => Outcome::failure(FailureKind::AssertionError, message),
        }
    }
}

/// A result matched to its request.
#[derive(Debug, Clone, PartialEq)]
pub struct AssertionResult {
    pub correlation_id: CorrelationId,
    pub outcome: Outcome,
    pub timestamp_ordering: u64,
}

pub fn encode(message: &BridgeMessage) -> Result<Vec<u8>, BridgeError> {
    serde_json::to_vec(message).map_err(|e| BridgeError::Codec(e.to_string()))
}

pub fn decode(frame: &[u8]) -> Result<BridgeMessage, BridgeError> {
    serde_json::from_slice(frame).map_err(|e| BridgeError::Codec(e.to_string()))
}
