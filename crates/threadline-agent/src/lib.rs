//! Agent runtime seam and stream event assembly.
//!
//! The agent runtime itself is an external collaborator reached through the
//! [`AgentRuntime`] trait. It produces a raw, dual-channel feed of token
//! deltas and step completions; [`StreamEventAssembler`] turns that feed into
//! the ordered client-facing [`threadline_core::protocol::StreamEvent`]s.

pub mod assembler;
pub mod echo;
pub mod runtime;
pub mod scripted;
pub mod transcript;

pub use assembler::StreamEventAssembler;
pub use echo::EchoRuntime;
pub use runtime::{
    AgentRuntime, ContentBlock, RawEvent, RawEventStream, StepCompletion, TokenDelta,
    ToolCallChunk,
};
pub use scripted::ScriptedRuntime;
pub use transcript::serialize_messages;
