//! Per-thread registry of in-flight invocations.
//!
//! At most one [`InvocationHandle`] is registered per thread. Every operation
//! runs under one registry-wide lock, so a stop or cancel request can never
//! land on a handle registered after the one it was aimed at.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use threadline_core::config::ConflictPolicy;
use threadline_core::error::{Result, ThreadlineError};
use threadline_core::types::ThreadId;

/// Cooperative stop flag of one invocation.
///
/// A child of the handle's cancellation token: a forced cancel also sets it.
#[derive(Debug, Clone)]
pub struct StopSignal(CancellationToken);

impl StopSignal {
    fn child_of(parent: &CancellationToken) -> Self {
        Self(parent.child_token())
    }

    pub fn is_set(&self) -> bool {
        self.0.is_cancelled()
    }

    fn set(&self) {
        self.0.cancel();
    }

    /// Resolves once the flag is set.
    pub async fn wait(&self) {
        self.0.cancelled().await
    }
}

/// One running computation of a thread.
#[derive(Debug, Clone)]
pub struct InvocationHandle {
    id: u64,
    thread_id: ThreadId,
    cancel: CancellationToken,
    stop: StopSignal,
    completed: Arc<AtomicBool>,
    created_at: DateTime<Utc>,
}

impl InvocationHandle {
    fn new(id: u64, thread_id: ThreadId) -> Self {
        let cancel = CancellationToken::new();
        let stop = StopSignal::child_of(&cancel);
        Self {
            id,
            thread_id,
            cancel,
            stop,
            completed: Arc::new(AtomicBool::new(false)),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    /// Token handed to the agent runtime. Fires on forced cancellation only.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_set()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Mark the computation finished. Later cancellation is a no-op.
    pub fn complete(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }

    /// Cancel the computation. Returns false if it had already finished.
    pub fn cancel(&self) -> bool {
        if self.is_completed() {
            return false;
        }
        self.cancel.cancel();
        true
    }
}

/// Tracks the in-flight invocation of every thread.
pub struct TaskRegistry {
    policy: ConflictPolicy,
    next_id: AtomicU64,
    handles: Mutex<HashMap<ThreadId, InvocationHandle>>,
}

impl TaskRegistry {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            policy,
            next_id: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ThreadId, InvocationHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an unregistered handle with a fresh id.
    pub fn new_handle(&self, thread_id: &ThreadId) -> InvocationHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        InvocationHandle::new(id, thread_id.clone())
    }

    /// Store `handle` as the thread's current invocation.
    ///
    /// A live handle already registered for the thread is handled per the
    /// conflict policy and returned when displaced.
    pub fn register(&self, handle: InvocationHandle) -> Result<Option<InvocationHandle>> {
        let mut handles = self.lock();
        let thread_id = handle.thread_id.clone();

        if let Some(existing) = handles.get(&thread_id) {
            match self.policy {
                ConflictPolicy::Reject => {
                    warn!(%thread_id, "Rejecting second invocation for running thread");
                    return Err(ThreadlineError::AlreadyRunning(thread_id.to_string()));
                }
                ConflictPolicy::CancelPrevious => {
                    info!(%thread_id, handle = existing.id, "Cancelling displaced invocation");
                    existing.cancel();
                }
                ConflictPolicy::Overwrite => {
                    warn!(%thread_id, handle = existing.id, "Overwriting running invocation");
                }
            }
        }

        debug!(%thread_id, handle = handle.id, "Registered invocation");
        Ok(handles.insert(thread_id, handle))
    }

    /// Remove the thread's registration if it is still `handle_id`.
    pub fn unregister(&self, thread_id: &ThreadId, handle_id: u64) -> bool {
        let mut handles = self.lock();
        match handles.get(thread_id).map(|h| h.id) {
            Some(current) if current == handle_id => {
                handles.remove(thread_id);
                debug!(%thread_id, handle = handle_id, "Unregistered invocation");
                true
            }
            Some(current) => {
                debug!(%thread_id, handle = handle_id, current, "Stale unregister ignored");
                false
            }
            None => false,
        }
    }

    /// Set the stop flag of the thread's invocation.
    ///
    /// Returns the id of the handle that was flagged, `None` when nothing is running.
    pub fn request_stop(&self, thread_id: &ThreadId) -> Option<u64> {
        let handles = self.lock();
        let handle = handles.get(thread_id)?;
        handle.stop.set();
        info!(%thread_id, handle = handle.id, "Stop requested");
        Some(handle.id)
    }

    pub fn is_stopped(&self, thread_id: &ThreadId) -> bool {
        self.lock().get(thread_id).is_some_and(InvocationHandle::is_stopped)
    }

    /// Cancel and remove the thread's invocation if it is still `handle_id`.
    ///
    /// False when nothing is registered, a different handle is registered,
    /// or the computation already finished. A finished handle stays
    /// registered until its own unregister.
    pub fn force_cancel(&self, thread_id: &ThreadId, handle_id: u64) -> bool {
        let mut handles = self.lock();
        let Some(handle) = handles.get(thread_id) else {
            return false;
        };
        if handle.id != handle_id {
            debug!(%thread_id, handle = handle_id, current = handle.id, "Stale cancel ignored");
            return false;
        }
        if !handle.cancel() {
            return false;
        }
        let age_ms = (Utc::now() - handle.created_at).num_milliseconds();
        info!(%thread_id, handle = handle_id, age_ms, "Invocation force-cancelled");
        handles.remove(thread_id);
        true
    }

    /// Snapshot of threads with a registered invocation, sorted.
    pub fn list_active(&self) -> Vec<ThreadId> {
        let mut active: Vec<ThreadId> = self.lock().keys().cloned().collect();
        active.sort();
        active
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(ConflictPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(id: &str) -> ThreadId {
        ThreadId::from(id)
    }

    fn registered(registry: &TaskRegistry, id: &str) -> InvocationHandle {
        let handle = registry.new_handle(&thread(id));
        registry.register(handle.clone()).unwrap();
        handle
    }

    #[test]
    fn test_register_then_unregister_clears_everything() {
        let registry = TaskRegistry::default();
        let handle = registered(&registry, "a");
        assert_eq!(registry.list_active(), vec![thread("a")]);

        assert_eq!(registry.request_stop(&thread("a")), Some(handle.id()));
        assert!(registry.unregister(&thread("a"), handle.id()));
        assert!(!registry.is_stopped(&thread("a")));
        assert!(registry.list_active().is_empty());
    }

    #[test]
    fn test_request_stop_on_unregistered_thread() {
        let registry = TaskRegistry::default();
        assert_eq!(registry.request_stop(&thread("nobody")), None);
        assert!(!registry.is_stopped(&thread("nobody")));
    }

    #[test]
    fn test_stop_flag_holds_until_next_register() {
        let registry = TaskRegistry::new(ConflictPolicy::Overwrite);
        let first = registered(&registry, "a");
        assert!(registry.request_stop(&thread("a")).is_some());
        assert!(registry.is_stopped(&thread("a")));
        assert!(registry.is_stopped(&thread("a")));

        registered(&registry, "a");
        assert!(!registry.is_stopped(&thread("a")));
        // The displaced handle keeps its own flag.
        assert!(first.is_stopped());
    }

    #[test]
    fn test_force_cancel_is_idempotent() {
        let registry = TaskRegistry::default();
        let handle = registered(&registry, "a");

        assert!(registry.force_cancel(&thread("a"), handle.id()));
        assert!(handle.is_cancelled());
        assert!(handle.is_stopped());
        assert!(!registry.force_cancel(&thread("a"), handle.id()));
        assert!(registry.list_active().is_empty());
    }

    #[test]
    fn test_force_cancel_after_completion_is_noop() {
        let registry = TaskRegistry::default();
        let handle = registered(&registry, "a");
        handle.complete();

        assert!(!registry.force_cancel(&thread("a"), handle.id()));
        assert!(!handle.is_cancelled());
        assert_eq!(registry.list_active(), vec![thread("a")]);
        assert!(registry.unregister(&thread("a"), handle.id()));
    }

    #[test]
    fn test_cancel_aimed_at_finished_handle_spares_successor() {
        let registry = TaskRegistry::default();
        let first = registered(&registry, "a");
        let target = registry.request_stop(&thread("a"));
        assert_eq!(target, Some(first.id()));

        first.complete();
        assert!(registry.unregister(&thread("a"), first.id()));
        let second = registered(&registry, "a");

        assert!(!registry.force_cancel(&thread("a"), first.id()));
        assert!(!second.is_cancelled());
        assert!(!second.is_stopped());
        assert_eq!(registry.list_active(), vec![thread("a")]);
    }

    #[test]
    fn test_stale_unregister_keeps_newer_registration() {
        let registry = TaskRegistry::new(ConflictPolicy::Overwrite);
        let old = registered(&registry, "a");
        let new = registered(&registry, "a");

        assert!(!registry.unregister(&thread("a"), old.id()));
        assert_eq!(registry.list_active(), vec![thread("a")]);
        assert!(registry.unregister(&thread("a"), new.id()));
    }

    #[test]
    fn test_stop_between_finish_and_unregister_does_not_leak() {
        let registry = TaskRegistry::default();
        let old = registered(&registry, "a");
        assert!(registry.request_stop(&thread("a")).is_some());
        registry.unregister(&thread("a"), old.id());

        registered(&registry, "a");
        assert!(!registry.is_stopped(&thread("a")));
    }

    #[test]
    fn test_overwrite_does_not_cancel_previous() {
        let registry = TaskRegistry::new(ConflictPolicy::Overwrite);
        let old = registered(&registry, "a");
        let displaced = registry.register(registry.new_handle(&thread("a"))).unwrap();

        assert_eq!(displaced.map(|h| h.id()), Some(old.id()));
        assert!(!old.is_cancelled());
    }

    #[test]
    fn test_cancel_previous_cancels_displaced() {
        let registry = TaskRegistry::new(ConflictPolicy::CancelPrevious);
        let old = registered(&registry, "a");
        let new = registered(&registry, "a");

        assert!(old.is_cancelled());
        assert!(!new.is_cancelled());
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_reject_refuses_second_registration() {
        let registry = TaskRegistry::new(ConflictPolicy::Reject);
        let old = registered(&registry, "a");
        let err = registry.register(registry.new_handle(&thread("a"))).unwrap_err();

        assert!(matches!(err, ThreadlineError::AlreadyRunning(_)));
        assert!(!old.is_cancelled());
        assert!(registry.unregister(&thread("a"), old.id()));
    }

    #[test]
    fn test_handle_ids_are_unique() {
        let registry = TaskRegistry::default();
        let a = registry.new_handle(&thread("a"));
        let b = registry.new_handle(&thread("a"));
        assert!(b.id() > a.id());
    }

    #[tokio::test]
    async fn test_concurrent_registrations_on_distinct_threads() {
        let registry = Arc::new(TaskRegistry::default());
        let mut tasks = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let id = thread(&format!("t{i}"));
                let handle = registry.new_handle(&id);
                registry.register(handle.clone()).unwrap();
                registry.request_stop(&id);
                registry.unregister(&id, handle.id())
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }
        assert!(registry.list_active().is_empty());
    }

    #[tokio::test]
    async fn test_stop_signal_wakes_waiter() {
        let registry = TaskRegistry::default();
        let handle = registered(&registry, "a");
        let signal = handle.stop_signal().clone();
        let waiter = tokio::spawn(async move { signal.wait().await });

        registry.request_stop(&thread("a"));
        waiter.await.unwrap();
        assert!(!handle.is_cancelled());
    }
}
