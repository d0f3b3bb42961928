//! A runtime that replays a fixed script.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use threadline_core::types::{ChatMessage, RunConfig, RunState};

use crate::runtime::{AgentRuntime, RawEvent, RawEventStream};

/// Replays a raw event script and reports a fixed final state.
///
/// Counts how many raw events the consumer actually pulled, which makes it
/// possible to observe where a stream stopped.
#[derive(Clone, Default)]
pub struct ScriptedRuntime {
    events: Vec<RawEvent>,
    final_state: RunState,
    fail_after: Option<(usize, String)>,
    start_error: Option<String>,
    state_error: Option<String>,
    run_delay: Option<Duration>,
    event_delay: Option<Duration>,
    consumed: Arc<AtomicUsize>,
}

impl ScriptedRuntime {
    pub fn new(events: Vec<RawEvent>, final_state: RunState) -> Self {
        Self {
            events,
            final_state,
            ..Self::default()
        }
    }

    /// Yield an error instead of the event at index `n`.
    pub fn fail_after(mut self, n: usize, message: impl Into<String>) -> Self {
        self.fail_after = Some((n, message.into()));
        self
    }

    /// Fail both run operations before producing anything.
    pub fn fail_on_start(mut self, message: impl Into<String>) -> Self {
        self.start_error = Some(message.into());
        self
    }

    /// Fail reads of the final state.
    pub fn fail_state(mut self, message: impl Into<String>) -> Self {
        self.state_error = Some(message.into());
        self
    }

    /// Delay `run_once` completion.
    pub fn run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = Some(delay);
        self
    }

    /// Delay every streamed event.
    pub fn event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = Some(delay);
        self
    }

    /// Number of raw events pulled by the consumer so far.
    pub fn consumed(&self) -> usize {
        self.consumed.load(Ordering::SeqCst)
    }

    fn check_start(&self) -> anyhow::Result<()> {
        match &self.start_error {
            Some(message) => Err(anyhow::anyhow!(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn run_once(
        &self,
        _input: ChatMessage,
        _config: &RunConfig,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunState> {
        self.check_start()?;
        if let Some(delay) = self.run_delay {
            tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("run cancelled"),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if let Some((_, message)) = &self.fail_after {
            anyhow::bail!(message.clone());
        }
        Ok(self.final_state.clone())
    }

    async fn run_streaming(
        &self,
        _input: ChatMessage,
        _config: &RunConfig,
        cancel: CancellationToken,
    ) -> anyhow::Result<RawEventStream> {
        self.check_start()?;

        let events = self.events.clone();
        let fail_after = self.fail_after.clone();
        let event_delay = self.event_delay;
        let consumed = self.consumed.clone();

        let stream = async_stream::stream! {
            for (index, event) in events.into_iter().enumerate() {
                if let Some(delay) = event_delay {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if let Some((n, message)) = &fail_after {
                    if index == *n {
                        yield Err(anyhow::anyhow!(message.clone()));
                        break;
                    }
                }
                consumed.fetch_add(1, Ordering::SeqCst);
                yield Ok(event);
            }
        };
        Ok(Box::pin(stream))
    }

    async fn state(&self, _config: &RunConfig) -> anyhow::Result<RunState> {
        match &self.state_error {
            Some(message) => Err(anyhow::anyhow!(message.clone())),
            None => Ok(self.final_state.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use threadline_core::types::{ModelSettings, ThreadId};

    fn config() -> RunConfig {
        RunConfig {
            thread_id: ThreadId::from("t"),
            model: ModelSettings::default(),
            recursion_limit: 10,
            configurable: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn test_counts_pulled_events() {
        let runtime = ScriptedRuntime::new(
            vec![
                RawEvent::text("model", "a", "1"),
                RawEvent::text("model", "a", "2"),
                RawEvent::text("model", "a", "3"),
            ],
            RunState::default(),
        );
        let mut feed = runtime
            .run_streaming(ChatMessage::user("go"), &config(), CancellationToken::new())
            .await
            .unwrap();

        feed.next().await.unwrap().unwrap();
        assert_eq!(runtime.consumed(), 1);
        feed.next().await.unwrap().unwrap();
        assert_eq!(runtime.consumed(), 2);
    }

    #[tokio::test]
    async fn test_fail_after_yields_error() {
        let runtime = ScriptedRuntime::new(
            vec![RawEvent::text("model", "a", "1"), RawEvent::text("model", "a", "2")],
            RunState::default(),
        )
        .fail_after(1, "429 Too Many Requests");
        let items: Vec<_> = runtime
            .run_streaming(ChatMessage::user("go"), &config(), CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].as_ref().unwrap_err().to_string().contains("429"));
    }

    #[tokio::test]
    async fn test_run_once_honors_cancellation() {
        let runtime = ScriptedRuntime::new(vec![], RunState::default())
            .run_delay(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = runtime
            .run_once(ChatMessage::user("go"), &config(), cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
