//! Stream event assembly.
//!
//! Converts the runtime's interleaved feed of token deltas and step
//! completions into well-formed client events. A new assistant message is
//! detected when the checkpoint segment changes on the model node with
//! substantive content. Tool-call arguments stream in as fragments and are
//! accumulated until the model step completes or the message boundary moves,
//! whichever comes first.

use serde_json::json;
use tracing::{debug, trace};

use threadline_core::protocol::StreamEvent;
use threadline_core::types::{Role, RunState};

use crate::runtime::{ContentBlock, RawEvent, StepCompletion, TokenDelta, ToolCallChunk};
use crate::transcript::serialize_messages;

/// Tool-call arguments accumulated for one call of the current invocation.
#[derive(Debug)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    args: String,
}

impl ToolCallAccumulator {
    fn into_event(self) -> StreamEvent {
        StreamEvent::ToolCallInput {
            input: parse_tool_input(&self.args),
            id: self.id,
            name: self.name,
        }
    }
}

/// Parse accumulated argument text, falling back to `{"raw": text}`.
fn parse_tool_input(args: &str) -> serde_json::Value {
    if args.is_empty() {
        return json!({});
    }
    serde_json::from_str(args).unwrap_or_else(|_| json!({ "raw": args }))
}

/// Per-invocation state machine translating raw events into client events.
#[derive(Debug)]
pub struct StreamEventAssembler {
    model_node: String,
    /// Segment of the message currently open, if any.
    boundary: Option<String>,
    /// Open tool calls in insertion order.
    accumulators: Vec<ToolCallAccumulator>,
}

impl StreamEventAssembler {
    pub fn new(model_node: impl Into<String>) -> Self {
        Self {
            model_node: model_node.into(),
            boundary: None,
            accumulators: Vec::new(),
        }
    }

    /// Segment id of the open message.
    pub fn current_message(&self) -> Option<&str> {
        self.boundary.as_deref()
    }

    /// Number of tool calls whose input has not been flushed yet.
    pub fn open_tool_calls(&self) -> usize {
        self.accumulators.len()
    }

    /// Translate one raw event.
    pub fn push(&mut self, event: RawEvent) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        match event {
            RawEvent::Token(delta) => self.on_token(delta, &mut out),
            RawEvent::StepCompleted(step) => self.on_step(step, &mut out),
        }
        out
    }

    /// Close the stream: flush pending tool inputs and the open message.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        self.close_message(&mut out);
        out
    }

    /// Reconciliation pass over the runtime's authoritative final state.
    ///
    /// Emits `tool_call_end` for every tool result after the triggering user
    /// message, then `done` with the serialized current turn.
    pub fn reconcile(state: &RunState) -> Vec<StreamEvent> {
        let turn = state.current_turn();
        let after_user = match turn.first() {
            Some(first) if first.role == Role::User => &turn[1..],
            _ => turn,
        };

        let mut out: Vec<StreamEvent> = after_user
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| {
                m.tool_call_id.as_ref().map(|id| StreamEvent::ToolCallEnd {
                    id: id.clone(),
                    name: m.name.clone().unwrap_or_default(),
                    output: m.content.clone(),
                })
            })
            .collect();

        out.push(StreamEvent::Done {
            messages: Some(serialize_messages(turn)),
        });
        out
    }

    fn is_model_node(&self, node: &str) -> bool {
        node == self.model_node
            || node
                .strip_suffix(self.model_node.as_str())
                .is_some_and(|prefix| prefix.ends_with(':'))
    }

    fn on_token(&mut self, delta: TokenDelta, out: &mut Vec<StreamEvent>) {
        let starts_message = !delta.segment.is_empty()
            && self.boundary.as_deref() != Some(delta.segment.as_str())
            && self.is_model_node(&delta.node)
            && has_content(&delta.blocks);

        if starts_message {
            self.close_message(out);
            debug!(segment = %delta.segment, "Message boundary");
            out.push(StreamEvent::MessageStart {
                message_id: delta.segment.clone(),
            });
            self.boundary = Some(delta.segment);
        }

        for block in delta.blocks {
            match block {
                ContentBlock::Text { text } => {
                    if !text.is_empty() {
                        out.push(StreamEvent::Content {
                            text,
                            node: delta.node.clone(),
                        });
                    }
                }
                ContentBlock::ToolCallChunk(chunk) => self.on_tool_chunk(chunk, out),
            }
        }
    }

    fn on_tool_chunk(&mut self, chunk: ToolCallChunk, out: &mut Vec<StreamEvent>) {
        match chunk {
            ToolCallChunk::NewCall {
                id,
                name,
                args_fragment,
            } => {
                if let Some(acc) = self.accumulators.iter_mut().find(|a| a.id == id) {
                    acc.args.push_str(&args_fragment);
                    return;
                }
                out.push(StreamEvent::ToolCallStart {
                    id: id.clone(),
                    name: name.clone(),
                });
                self.accumulators.push(ToolCallAccumulator {
                    id,
                    name,
                    args: args_fragment,
                });
            }
            ToolCallChunk::ContinuationFragment { args_fragment } => {
                if args_fragment.is_empty() {
                    return;
                }
                match self.accumulators.last_mut() {
                    Some(last) => last.args.push_str(&args_fragment),
                    None => trace!("Dropping argument fragment with no open tool call"),
                }
            }
        }
    }

    fn on_step(&mut self, step: StepCompletion, out: &mut Vec<StreamEvent>) {
        if self.is_model_node(&step.node) && self.boundary.is_some() {
            self.flush_tool_inputs(out);
        }
    }

    fn flush_tool_inputs(&mut self, out: &mut Vec<StreamEvent>) {
        out.extend(self.accumulators.drain(..).map(ToolCallAccumulator::into_event));
    }

    fn close_message(&mut self, out: &mut Vec<StreamEvent>) {
        self.flush_tool_inputs(out);
        if let Some(message_id) = self.boundary.take() {
            out.push(StreamEvent::MessageEnd { message_id });
        }
    }
}

/// Whether a delta carries anything worth opening a message for.
fn has_content(blocks: &[ContentBlock]) -> bool {
    blocks.iter().any(|b| match b {
        ContentBlock::Text { text } => !text.is_empty(),
        ContentBlock::ToolCallChunk(_) => true,
    })
}
