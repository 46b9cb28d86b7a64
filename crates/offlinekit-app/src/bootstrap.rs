//! Startup sequencing: mount the application, then register its service
//! worker in the background.

use offlinekit_sw::ServiceWorkerManager;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::page::{PageDocument, PageElement};

/// The element the application is mounted into.
pub type MountTarget = PageElement;

/// Errors that stop startup.
#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Mount target not found: #{0}")]
    MountTargetMissing(String),

    #[error("Application mount failed")]
    Mount(#[source] anyhow::Error),
}

/// Script and scope handed to the service worker manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub script_url: String,
    pub scope: String,
}

impl Default for RegistrationRequest {
    fn default() -> Self {
        Self {
            script_url: "/sw.js".to_string(),
            scope: "/".to_string(),
        }
    }
}

/// Result of a successful startup.
pub struct Bootstrapped {
    /// Background lifecycle task. Await it or let it run detached.
    pub registration: JoinHandle<()>,
    pub manager: ServiceWorkerManager,
}

/// Runs the one-shot startup sequence for a page.
pub struct BootstrapSequencer {
    document: PageDocument,
    manager: ServiceWorkerManager,
    request: RegistrationRequest,
}

impl BootstrapSequencer {
    pub fn new(
        document: PageDocument,
        manager: ServiceWorkerManager,
        request: RegistrationRequest,
    ) -> Self {
        Self {
            document,
            manager,
            request,
        }
    }

    /// Mount the application into `#root_id`, then start registration.
    ///
    /// Registration failures are handled by the manager and never fail this
    /// call. Must be called within a tokio runtime.
    #[instrument(skip(self, mount))]
    pub fn run<F>(self, root_id: &str, mount: F) -> Result<Bootstrapped, BootstrapError>
    where
        F: FnOnce(&MountTarget) -> anyhow::Result<()>,
    {
        let target = self
            .document
            .element_by_id(root_id)
            .ok_or_else(|| BootstrapError::MountTargetMissing(root_id.to_string()))?;

        debug!(tag = %target.tag_name, "Mounting application");
        mount(target).map_err(BootstrapError::Mount)?;
        info!("Application mounted");

        let registration = self
            .manager
            .register(self.request.script_url.as_str(), self.request.scope.as_str());

        Ok(Bootstrapped {
            registration,
            manager: self.manager,
        })
    }
}
