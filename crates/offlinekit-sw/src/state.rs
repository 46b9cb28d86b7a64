//! Agent lifecycle state machine.
//!
//! ```text
//! Unregistered ──► Installing ──► InstalledWaiting ──► Activating ──► Activated
//!                       │                │                  │             │
//!                       └────────────────┴──────────────────┴─────────────┴──► Redundant
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    /// Allocate a new process-unique id.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ServiceWorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Lifecycle state of a single agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentState {
    /// Not registered with the environment.
    #[default]
    Unregistered,
    /// Install event running.
    Installing,
    /// Installed, waiting for the previous agent to release its clients.
    InstalledWaiting,
    /// Activate event running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced, failed to install, or unregistered.
    Redundant,
}

impl AgentState {
    /// Whether the environment may move an agent from `self` to `next`.
    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Unregistered, Installing)
                | (Installing, InstalledWaiting)
                | (InstalledWaiting, Activating)
                | (Activating, Activated)
                | (Installing | InstalledWaiting | Activating | Activated, Redundant)
        )
    }

    /// Position along the happy path; `Redundant` is terminal.
    pub fn rank(self) -> u8 {
        match self {
            AgentState::Unregistered => 0,
            AgentState::Installing => 1,
            AgentState::InstalledWaiting => 2,
            AgentState::Activating => 3,
            AgentState::Activated => 4,
            AgentState::Redundant => 5,
        }
    }

    /// True if an event carrying `other` describes a state this agent has
    /// already left behind.
    pub fn is_past(self, other: AgentState) -> bool {
        other.rank() < self.rank()
    }

    /// Script-facing name, as reported by `ServiceWorker.state`.
    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Unregistered => "unregistered",
            AgentState::Installing => "installing",
            AgentState::InstalledWaiting => "installed",
            AgentState::Activating => "activating",
            AgentState::Activated => "activated",
            AgentState::Redundant => "redundant",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of an agent inside a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: ServiceWorkerId,
    pub script_url: Url,
    pub state: AgentState,
}
