//! # OfflineKit Service Workers
//!
//! Lifecycle management for the background caching agent of a web
//! application.
//!
//! ## Features
//!
//! - **Registration**: same-origin and scope checks, optional retry policy
//! - **Lifecycle**: installing → installed (waiting) → activating → activated
//! - **Update detection**: first install vs. update, using a durable marker
//! - **Skip waiting**: activate a waiting update on request
//! - **In-process host**: an environment implementation for tools and tests
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerManager
//!     │
//!     ├── AgentEnvironment (register / subscribe / skip_waiting)
//!     │       └── LifecycleEvent stream per RegistrationHandle
//!     ├── MarkerStore ("an agent was activated here before")
//!     └── UpdateNotifier (on_update_available / on_offline_ready)
//! ```

use std::time::Duration;
use thiserror::Error;

pub mod environment;
pub mod host;
pub mod manager;
pub mod marker;
pub mod notify;
pub mod scope;
pub mod state;

pub use environment::{
    AgentEnvironment, LifecycleEvent, LifecycleEvents, RegistrationHandle, RegistrationSnapshot,
};
pub use host::{DirectoryScripts, InProcessHost, ScriptResponse, ScriptSource, StaticScripts};
pub use manager::{ManagerConfig, ManagerStatus, ServiceWorkerManager};
pub use marker::{JsonFileMarkerStore, MarkerStore, MemoryMarkerStore};
pub use notify::{ChannelNotifier, HostNotification, LoggingNotifier, UpdateNotifier};
pub use scope::RegistrationTarget;
pub use state::{AgentState, ServiceWorkerId, WorkerInfo};

// ==================== Errors ====================

/// Why a registration attempt failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationFailure {
    #[error("network error: {0}")]
    Network(String),

    #[error("script not found: {0}")]
    ScriptNotFound(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("scope violation: {0}")]
    ScopeViolation(String),

    #[error("cross-origin script or scope: {0}")]
    CrossOrigin(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("registration timed out after {0:?}")]
    Timeout(Duration),
}

impl RegistrationFailure {
    /// Transient failures that a retry policy may try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegistrationFailure::Network(_) | RegistrationFailure::Timeout(_)
        )
    }

    /// The script URL answered, but not with a usable agent script.
    pub fn is_invalid_script(&self) -> bool {
        matches!(
            self,
            RegistrationFailure::ScriptNotFound(_) | RegistrationFailure::Script(_)
        )
    }
}

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(#[from] RegistrationFailure),

    #[error("No registration for handle {0}")]
    NotRegistered(RegistrationHandle),

    #[error("State error: {0}")]
    StateError(String),
}

impl ServiceWorkerError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceWorkerError::RegistrationFailed(reason) => reason.is_retryable(),
            _ => false,
        }
    }

    /// The registration failure reason, if this is one.
    pub fn failure(&self) -> Option<&RegistrationFailure> {
        match self {
            ServiceWorkerError::RegistrationFailed(reason) => Some(reason),
            _ => None,
        }
    }
}
