//! HTTP gateway for Threadline.
//!
//! Hosts the chat endpoints, tracks the in-flight invocation of every thread
//! in the [`TaskRegistry`], and drives invocations through the
//! [`InvocationCoordinator`], streaming their lifecycle events as SSE.

pub mod coordinator;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod registry;
pub mod server;
pub mod state;

pub use coordinator::{InvocationCoordinator, InvocationError, InvocationState};
pub use registry::{InvocationHandle, StopSignal, TaskRegistry};
pub use server::{router, start_gateway};
pub use state::GatewayState;
