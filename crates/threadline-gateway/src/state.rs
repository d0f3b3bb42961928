//! Gateway shared state.

use std::sync::Arc;

use threadline_agent::AgentRuntime;
use threadline_core::config::Config;
use threadline_core::store::ConversationStore;

use crate::coordinator::InvocationCoordinator;
use crate::registry::TaskRegistry;

/// Shared gateway state accessible from all handlers.
///
/// The composition root: the registry is built here from config and handed
/// to the coordinator, never reached through a global.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub store: Arc<dyn ConversationStore>,
    pub registry: Arc<TaskRegistry>,
    pub coordinator: InvocationCoordinator,
    #[cfg(feature = "metrics")]
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl GatewayState {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn ConversationStore>,
        runtime: Arc<dyn AgentRuntime>,
    ) -> Self {
        let registry = Arc::new(TaskRegistry::new(config.conflict_policy()));
        let coordinator =
            InvocationCoordinator::new(config.clone(), runtime, store.clone(), registry.clone());

        Self {
            config,
            store,
            registry,
            coordinator,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Serve `/metrics` from this recorder handle.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}
