//! Built-in runtime that echoes the user's message back.
//!
//! Keeps a per-thread transcript in memory so that state reads and the
//! reconciliation pass behave like a real runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use threadline_core::types::{ChatMessage, RunConfig, RunState, ThreadId};

use crate::runtime::{AgentRuntime, RawEvent, RawEventStream};

const MODEL_NODE: &str = "model";

type Transcripts = Arc<RwLock<HashMap<ThreadId, Vec<ChatMessage>>>>;

pub struct EchoRuntime {
    transcripts: Transcripts,
    delay: Duration,
}

impl EchoRuntime {
    /// `delay` paces each streamed word.
    pub fn new(delay: Duration) -> Self {
        Self {
            transcripts: Arc::new(RwLock::new(HashMap::new())),
            delay,
        }
    }

    fn reply_for(input: &ChatMessage) -> String {
        input.content.clone()
    }

    async fn append(transcripts: &Transcripts, thread_id: &ThreadId, message: ChatMessage) {
        transcripts
            .write()
            .await
            .entry(thread_id.clone())
            .or_default()
            .push(message);
    }
}

impl Default for EchoRuntime {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

#[async_trait]
impl AgentRuntime for EchoRuntime {
    async fn run_once(
        &self,
        input: ChatMessage,
        config: &RunConfig,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunState> {
        let reply = Self::reply_for(&input);
        Self::append(&self.transcripts, &config.thread_id, input).await;

        let words = u32::try_from(reply.split_whitespace().count()).unwrap_or(u32::MAX);
        if !self.delay.is_zero() {
            let total = self.delay.checked_mul(words).unwrap_or(Duration::MAX);
            tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("echo run cancelled"),
                _ = tokio::time::sleep(total) => {}
            }
        }

        Self::append(&self.transcripts, &config.thread_id, ChatMessage::assistant(reply)).await;
        self.state(config).await
    }

    async fn run_streaming(
        &self,
        input: ChatMessage,
        config: &RunConfig,
        cancel: CancellationToken,
    ) -> anyhow::Result<RawEventStream> {
        let reply = Self::reply_for(&input);
        Self::append(&self.transcripts, &config.thread_id, input).await;

        let transcripts = self.transcripts.clone();
        let thread_id = config.thread_id.clone();
        let delay = self.delay;
        let segment = format!("{MODEL_NODE}:{}", uuid::Uuid::new_v4());

        let stream = async_stream::stream! {
            let words: Vec<String> = reply.split_whitespace().map(|w| format!("{w} ")).collect();
            for word in words {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(%thread_id, "Echo stream cancelled");
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                } else if cancel.is_cancelled() {
                    return;
                }
                yield Ok(RawEvent::text(MODEL_NODE, &segment, &word));
            }
            EchoRuntime::append(&transcripts, &thread_id, ChatMessage::assistant(reply)).await;
            yield Ok(RawEvent::step(MODEL_NODE));
        };
        Ok(Box::pin(stream))
    }

    async fn state(&self, config: &RunConfig) -> anyhow::Result<RunState> {
        let messages = self
            .transcripts
            .read()
            .await
            .get(&config.thread_id)
            .cloned()
            .unwrap_or_default();
        Ok(RunState { messages })
    }
}
