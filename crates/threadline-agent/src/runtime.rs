//! The agent runtime seam and its raw event feed.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use threadline_core::types::{ChatMessage, RunConfig, RunState};

/// Boxed raw event feed of one streamed invocation.
pub type RawEventStream = Pin<Box<dyn Stream<Item = anyhow::Result<RawEvent>> + Send>>;

/// One item of the runtime's dual-channel feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum RawEvent {
    /// Incremental tokens from a node.
    Token(TokenDelta),
    /// A node finished a step.
    StepCompleted(StepCompletion),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenDelta {
    pub node: String,
    /// Checkpoint segment of the message being produced.
    pub segment: String,
    #[serde(default)]
    pub blocks: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletion {
    pub node: String,
    #[serde(default)]
    pub values: serde_json::Value,
}

/// A content block inside a token delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolCallChunk(ToolCallChunk),
}

/// A fragment of a streamed tool call.
///
/// The runtime opens a call with a chunk carrying both id and name, then
/// streams the remaining argument text as bare fragments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ToolCallChunkWire", into = "ToolCallChunkWire")]
pub enum ToolCallChunk {
    NewCall {
        id: String,
        name: String,
        args_fragment: String,
    },
    ContinuationFragment { args_fragment: String },
}

impl ToolCallChunk {
    /// Classify a chunk by which fields the runtime populated.
    pub fn from_parts(id: Option<String>, name: Option<String>, args: Option<String>) -> Self {
        let args_fragment = args.unwrap_or_default();
        match (id, name) {
            (Some(id), Some(name)) if !id.is_empty() && !name.is_empty() => Self::NewCall {
                id,
                name,
                args_fragment,
            },
            _ => Self::ContinuationFragment { args_fragment },
        }
    }

    pub fn args_fragment(&self) -> &str {
        match self {
            Self::NewCall { args_fragment, .. } | Self::ContinuationFragment { args_fragment } => {
                args_fragment
            }
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct ToolCallChunkWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<String>,
}

impl From<ToolCallChunkWire> for ToolCallChunk {
    fn from(wire: ToolCallChunkWire) -> Self {
        Self::from_parts(wire.id, wire.name, wire.args)
    }
}

impl From<ToolCallChunk> for ToolCallChunkWire {
    fn from(chunk: ToolCallChunk) -> Self {
        match chunk {
            ToolCallChunk::NewCall {
                id,
                name,
                args_fragment,
            } => Self {
                id: Some(id),
                name: Some(name),
                args: Some(args_fragment),
            },
            ToolCallChunk::ContinuationFragment { args_fragment } => Self {
                id: None,
                name: None,
                args: Some(args_fragment),
            },
        }
    }
}

impl RawEvent {
    /// Token delta carrying a single text block.
    pub fn text(node: &str, segment: &str, text: &str) -> Self {
        Self::Token(TokenDelta {
            node: node.to_string(),
            segment: segment.to_string(),
            blocks: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
        })
    }

    /// Token delta carrying a single tool-call chunk.
    pub fn tool_chunk(node: &str, segment: &str, chunk: ToolCallChunk) -> Self {
        Self::Token(TokenDelta {
            node: node.to_string(),
            segment: segment.to_string(),
            blocks: vec![ContentBlock::ToolCallChunk(chunk)],
        })
    }

    pub fn step(node: &str) -> Self {
        Self::StepCompleted(StepCompletion {
            node: node.to_string(),
            values: serde_json::Value::Null,
        })
    }
}

/// An external agent runtime.
///
/// Both run operations receive the invocation's cancellation token and
/// should stop work promptly once it fires.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Run one turn to completion and return the final state.
    async fn run_once(
        &self,
        input: ChatMessage,
        config: &RunConfig,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunState>;

    /// Run one turn, yielding the raw event feed as it is produced.
    async fn run_streaming(
        &self,
        input: ChatMessage,
        config: &RunConfig,
        cancel: CancellationToken,
    ) -> anyhow::Result<RawEventStream>;

    /// Read the durable state of a thread.
    async fn state(&self, config: &RunConfig) -> anyhow::Result<RunState>;
}
