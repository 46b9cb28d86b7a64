//! The environment port: whatever actually hosts the caching agent.
//!
//! A browser binding, or [`InProcessHost`](crate::host::InProcessHost) for
//! tools and tests. The manager only registers, subscribes, inspects, and
//! asks for skip-waiting; every state transition is decided here.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use url::Url;

use crate::state::{AgentState, ServiceWorkerId, WorkerInfo};
use crate::ServiceWorkerError;

/// Opaque reference to a registration, issued by the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationHandle(u64);

impl RegistrationHandle {
    /// Allocate a new process-unique handle.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RegistrationHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RegistrationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg-{}", self.0)
    }
}

/// A state transition of one agent within a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub worker: ServiceWorkerId,
    pub state: AgentState,
}

impl LifecycleEvent {
    pub fn new(worker: ServiceWorkerId, state: AgentState) -> Self {
        Self { worker, state }
    }
}

/// Ordered stream of lifecycle events for one registration.
pub type LifecycleEvents = mpsc::UnboundedReceiver<LifecycleEvent>;

/// Point-in-time view of a registration, as returned by a fresh lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationSnapshot {
    pub handle: RegistrationHandle,
    pub scope: Url,
    pub installing: Option<WorkerInfo>,
    pub waiting: Option<WorkerInfo>,
    pub active: Option<WorkerInfo>,
}

/// Runtime that hosts background caching agents.
#[async_trait]
pub trait AgentEnvironment: Send + Sync {
    /// Whether this runtime can host caching agents at all.
    fn supports_agents(&self) -> bool;

    /// URL of the page the manager runs in.
    fn page_url(&self) -> Url;

    /// Register (or re-register) `script_url` at `scope`.
    ///
    /// Resolves once the script has been fetched and accepted; lifecycle
    /// transitions are delivered afterwards through [`subscribe`].
    ///
    /// [`subscribe`]: AgentEnvironment::subscribe
    async fn register_agent(
        &self,
        script_url: &Url,
        scope: &Url,
    ) -> Result<RegistrationHandle, ServiceWorkerError>;

    /// Subscribe to lifecycle events of a registration.
    ///
    /// Events that happened between `register_agent` resolving and the first
    /// subscription are replayed.
    async fn subscribe(
        &self,
        handle: RegistrationHandle,
    ) -> Result<LifecycleEvents, ServiceWorkerError>;

    /// Current state of a registration, if it still exists.
    async fn snapshot(&self, handle: RegistrationHandle) -> Option<RegistrationSnapshot>;

    /// Ask the waiting agent `worker` to activate without waiting for clients
    /// of the previous agent to close.
    async fn skip_waiting(
        &self,
        handle: RegistrationHandle,
        worker: ServiceWorkerId,
    ) -> Result<(), ServiceWorkerError>;

    /// Remove the registration at `scope`. Returns false if there was none.
    async fn unregister(&self, scope: &Url) -> Result<bool, ServiceWorkerError>;
}
