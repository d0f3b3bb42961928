//! Invocation coordination.
//!
//! One invocation moves `Starting -> Running -> {Completed | Stopped |
//! Cancelled | Failed}`. The registration is released exactly once on every
//! path, including a dropped stream, through [`RegistrationGuard`].

use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use futures::{Stream, StreamExt};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use threadline_agent::{AgentRuntime, StreamEventAssembler, serialize_messages};
use threadline_core::config::Config;
use threadline_core::error::{ErrorCode, ThreadlineError};
use threadline_core::protocol::{
    ChatRequest, ChatResult, StopRequest, StopResponse, StopStatus, StreamEvent, StreamFrame,
};
use threadline_core::store::ConversationStore;
use threadline_core::types::{ChatMessage, Role, RunConfig, ThreadId};

use crate::registry::{InvocationHandle, TaskRegistry};

/// Client-facing frames of one streamed invocation.
pub type FrameStream = Pin<Box<dyn Stream<Item = StreamFrame> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Starting,
    Running,
    Completed,
    Stopped,
    Cancelled,
    Failed,
}

impl InvocationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Starting | Self::Running)
    }
}

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Thread {0} already has a running invocation")]
    AlreadyRunning(String),

    #[error("Invocation stopped")]
    Stopped,

    #[error("Invocation cancelled")]
    Cancelled,

    #[error("{message}")]
    Upstream { code: ErrorCode, message: String },

    #[error("Store error: {0}")]
    Store(String),
}

impl InvocationError {
    fn upstream(err: &anyhow::Error) -> Self {
        let message = err.to_string();
        Self::Upstream {
            code: ErrorCode::classify(&message),
            message,
        }
    }

    /// Machine-readable code used in response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyRunning(_) => "already_running",
            Self::Stopped => "stopped",
            Self::Cancelled => "cancelled",
            Self::Upstream { code, .. } => code.as_str(),
            Self::Store(_) => "store_error",
        }
    }

    fn to_event(&self) -> StreamEvent {
        match self {
            Self::Upstream { code, message } => StreamEvent::Error {
                message: message.clone(),
                code: *code,
            },
            other => StreamEvent::Error {
                message: other.to_string(),
                code: ErrorCode::InternalError,
            },
        }
    }
}

impl From<ThreadlineError> for InvocationError {
    fn from(err: ThreadlineError) -> Self {
        match err {
            ThreadlineError::NotFound(what) => Self::NotFound(what),
            ThreadlineError::AlreadyRunning(thread) => Self::AlreadyRunning(thread),
            other => Self::Store(other.to_string()),
        }
    }
}

/// Owns one registration and releases it exactly once.
///
/// Dropping a guard that was never released cancels the invocation and
/// records it as `Cancelled`.
pub struct RegistrationGuard {
    registry: Arc<TaskRegistry>,
    handle: InvocationHandle,
    mode: &'static str,
    state: InvocationState,
}

impl RegistrationGuard {
    fn new(registry: Arc<TaskRegistry>, handle: InvocationHandle, mode: &'static str) -> Self {
        Self {
            registry,
            handle,
            mode,
            state: InvocationState::Starting,
        }
    }

    pub fn handle(&self) -> &InvocationHandle {
        &self.handle
    }

    pub fn state(&self) -> InvocationState {
        self.state
    }

    fn set_running(&mut self) {
        self.state = InvocationState::Running;
        #[cfg(feature = "metrics")]
        crate::metrics::record_invocation_start();
    }

    fn fail(&mut self, err: &InvocationError) {
        error!(thread_id = %self.handle.thread_id(), code = err.code(), error = %err, "Invocation failed");
        #[cfg(feature = "metrics")]
        crate::metrics::record_error(err.code());
        self.finish(InvocationState::Failed);
    }

    /// Move to a terminal state and unregister. Later calls are ignored.
    fn finish(&mut self, state: InvocationState) {
        if self.state.is_terminal() {
            return;
        }
        let was_running = self.state == InvocationState::Running;
        self.state = state;
        self.handle.complete();
        self.registry
            .unregister(self.handle.thread_id(), self.handle.id());

        let thread_id = self.handle.thread_id();
        match state {
            InvocationState::Completed => debug!(%thread_id, mode = self.mode, "Invocation completed"),
            InvocationState::Stopped => info!(%thread_id, mode = self.mode, "Invocation stopped"),
            InvocationState::Cancelled => info!(%thread_id, mode = self.mode, "Invocation cancelled"),
            _ => {}
        }

        #[cfg(feature = "metrics")]
        if was_running {
            crate::metrics::record_invocation_end(self.mode, state.as_str());
        }
        #[cfg(not(feature = "metrics"))]
        let _ = was_running;
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.handle.cancel();
            self.finish(InvocationState::Cancelled);
        }
    }
}

struct Started {
    thread_id: ThreadId,
    run_config: RunConfig,
    guard: RegistrationGuard,
}

async fn touch(store: &dyn ConversationStore, thread_id: &ThreadId) {
    if let Err(e) = store.touch(thread_id).await {
        warn!(%thread_id, error = %e, "Failed to refresh last-active timestamp");
    }
}

/// Runs invocations against the agent runtime and keeps the registry in sync.
pub struct InvocationCoordinator {
    config: Arc<Config>,
    runtime: Arc<dyn AgentRuntime>,
    store: Arc<dyn ConversationStore>,
    registry: Arc<TaskRegistry>,
}

impl InvocationCoordinator {
    pub fn new(
        config: Arc<Config>,
        runtime: Arc<dyn AgentRuntime>,
        store: Arc<dyn ConversationStore>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            config,
            runtime,
            store,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Resolve the thread and its run configuration, then register.
    async fn start(
        &self,
        request: &ChatRequest,
        mode: &'static str,
    ) -> Result<Started, InvocationError> {
        let conversation = self
            .store
            .get_or_create(
                request.thread_id.as_ref(),
                &request.message,
                request.metadata.clone().unwrap_or_default(),
            )
            .await?;
        let thread_id = conversation.thread_id;
        let settings = self.store.settings(&thread_id).await?;
        let run_config = self.config.run_config(&thread_id, Some(&settings));

        let handle = self.registry.new_handle(&thread_id);
        self.registry.register(handle.clone())?;
        debug!(%thread_id, handle = handle.id(), mode, model = %run_config.model.model, "Invocation starting");

        Ok(Started {
            thread_id,
            run_config,
            guard: RegistrationGuard::new(self.registry.clone(), handle, mode),
        })
    }

    /// Run one turn to completion.
    ///
    /// A forced cancel interrupts the runtime and yields `Cancelled`. A stop
    /// flag seen once the runtime returns yields `Stopped`.
    pub async fn run_once(&self, request: ChatRequest) -> Result<ChatResult, InvocationError> {
        let started_at = Instant::now();
        let Started {
            thread_id,
            run_config,
            mut guard,
        } = self.start(&request, "once").await?;
        guard.set_running();

        let cancel = guard.handle().cancel_token();
        let input = ChatMessage::user(request.message);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.runtime.run_once(input, &run_config, cancel.clone()) => Some(result),
        };

        if guard.handle().is_cancelled() {
            guard.finish(InvocationState::Cancelled);
            return Err(InvocationError::Cancelled);
        }
        if guard.handle().is_stopped() {
            guard.finish(InvocationState::Stopped);
            return Err(InvocationError::Stopped);
        }
        let state = match outcome {
            Some(Ok(state)) => state,
            Some(Err(e)) => {
                let err = InvocationError::upstream(&e);
                guard.fail(&err);
                return Err(err);
            }
            None => {
                guard.finish(InvocationState::Cancelled);
                return Err(InvocationError::Cancelled);
            }
        };

        guard.finish(InvocationState::Completed);
        touch(self.store.as_ref(), &thread_id).await;

        let response = state
            .messages
            .last()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(ChatResult {
            thread_id,
            response,
            duration_ms: started_at.elapsed().as_millis() as u64,
            messages: serialize_messages(state.current_turn()),
        })
    }

    /// Start a streamed turn.
    ///
    /// The invocation is registered before this returns, so it can be stopped
    /// as soon as the caller knows the thread id. Failures after that point
    /// are delivered as a terminal `error` frame.
    pub async fn run_streaming(
        &self,
        request: ChatRequest,
    ) -> Result<(ThreadId, FrameStream), InvocationError> {
        let Started {
            thread_id,
            run_config,
            guard,
        } = self.start(&request, "stream").await?;

        let runtime = self.runtime.clone();
        let store = self.store.clone();
        let model_node = self.config.model_node();
        let input = ChatMessage::user(request.message);
        let stream_thread = thread_id.clone();

        let events = async_stream::stream! {
            let mut guard = guard;
            guard.set_running();
            let cancel = guard.handle().cancel_token();
            let stop = guard.handle().stop_signal().clone();

            let mut feed = match runtime.run_streaming(input, &run_config, cancel.clone()).await {
                Ok(feed) => feed,
                Err(e) => {
                    let err = InvocationError::upstream(&e);
                    guard.fail(&err);
                    yield err.to_event();
                    return;
                }
            };

            let mut assembler = StreamEventAssembler::new(model_node);
            let stopped = loop {
                let next = tokio::select! {
                    biased;
                    _ = stop.wait() => break true,
                    next = feed.next() => next,
                };
                let Some(item) = next else {
                    break false;
                };
                if stop.is_set() {
                    break true;
                }
                match item {
                    Ok(raw) => {
                        for event in assembler.push(raw) {
                            yield event;
                        }
                    }
                    Err(e) => {
                        let err = InvocationError::upstream(&e);
                        guard.fail(&err);
                        yield err.to_event();
                        return;
                    }
                }
            };

            if stopped {
                drop(feed);
                let state = if cancel.is_cancelled() {
                    InvocationState::Cancelled
                } else {
                    InvocationState::Stopped
                };
                guard.finish(state);
                yield StreamEvent::Stopped;
                return;
            }

            for event in assembler.finish() {
                yield event;
            }
            guard.finish(InvocationState::Completed);
            touch(store.as_ref(), &stream_thread).await;

            match runtime.state(&run_config).await {
                Ok(state) => {
                    for event in StreamEventAssembler::reconcile(&state) {
                        yield event;
                    }
                }
                Err(e) => {
                    warn!(thread_id = %stream_thread, error = %e, "Failed to read final state");
                    yield StreamEvent::Done { messages: None };
                }
            }
        };

        let frame_thread = thread_id.clone();
        let frames: FrameStream = Box::pin(events.map(move |event| StreamFrame {
            thread_id: frame_thread.clone(),
            event,
        }));
        Ok((thread_id, frames))
    }

    /// Two-phase stop: cooperative flag, then an optional forced cancel.
    pub async fn stop(&self, request: StopRequest) -> Result<StopResponse, InvocationError> {
        let thread_id = request.thread_id;
        if self.store.get(&thread_id).await?.is_none() {
            return Err(InvocationError::NotFound(format!("Conversation {thread_id}")));
        }

        let target = self.registry.request_stop(&thread_id);
        let stopped = target.is_some();
        let cancelled = match target {
            Some(handle_id) if request.force => self.registry.force_cancel(&thread_id, handle_id),
            _ => false,
        };
        let status = if stopped {
            StopStatus::Stopped
        } else {
            StopStatus::NotRunning
        };

        #[cfg(feature = "metrics")]
        crate::metrics::record_stop_request(if stopped { "stopped" } else { "not_running" });
        debug!(%thread_id, ?status, cancelled, "Stop handled");

        Ok(StopResponse {
            status,
            thread_id,
            cancelled,
        })
    }

    /// Threads with a running invocation. Observability only.
    pub fn active(&self) -> Vec<ThreadId> {
        self.registry.list_active()
    }
}
