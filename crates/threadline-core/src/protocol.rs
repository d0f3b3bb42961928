//! Threadline client wire protocol.
//!
//! Streaming invocations are delivered as server-sent events, one JSON
//! [`StreamFrame`] per event. Non-streaming invocations and stop requests
//! use plain JSON bodies.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::types::{Role, ThreadId};

/// A client-facing lifecycle event of one streamed invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A new assistant message began.
    MessageStart { message_id: String },

    /// A text delta produced by `node`.
    Content { text: String, node: String },

    /// The model started a tool call.
    ToolCallStart { id: String, name: String },

    /// The tool call's arguments are complete.
    ToolCallInput {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// A tool call finished, as recorded in the final transcript.
    ToolCallEnd {
        id: String,
        name: String,
        output: String,
    },

    /// The current assistant message is closed.
    MessageEnd { message_id: String },

    /// The invocation completed.
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        messages: Option<Vec<SerializedMessage>>,
    },

    /// The invocation was stopped or cancelled before completion.
    Stopped,

    /// The invocation failed.
    Error { message: String, code: ErrorCode },
}

impl StreamEvent {
    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Stopped | Self::Error { .. })
    }
}

/// SSE envelope: the event plus the thread it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    pub thread_id: ThreadId,
    #[serde(flatten)]
    pub event: StreamEvent,
}

/// A transcript message as returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedMessage {
    pub role: Role,
    pub content: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Body of `POST /chat` and `POST /chat/stream`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Result of a non-streaming invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResult {
    pub thread_id: ThreadId,
    pub response: String,
    pub duration_ms: u64,
    pub messages: Vec<SerializedMessage>,
}

/// Body of `POST /chat/stop`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRequest {
    pub thread_id: ThreadId,
    /// Follow the cooperative stop with a forced cancellation (default: true).
    #[serde(default = "default_force")]
    pub force: bool,
}

fn default_force() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopStatus {
    Stopped,
    NotRunning,
}

/// Response of `POST /chat/stop`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopResponse {
    pub status: StopStatus,
    pub thread_id: ThreadId,
    pub cancelled: bool,
}
