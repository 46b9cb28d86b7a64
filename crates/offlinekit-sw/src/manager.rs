//! Service worker lifecycle manager.
//!
//! Registers the caching agent without blocking startup, follows its
//! lifecycle events, and turns them into at most two host-visible signals:
//! "offline ready" on the very first activation for an origin, and "update
//! available" when a newer agent is waiting behind an active one.

use hashbrown::{HashMap, HashSet};
use offlinekit_common::{retry_with_backoff_if, with_timeout, RetryConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};
use url::Url;

use crate::environment::{AgentEnvironment, LifecycleEvent, LifecycleEvents, RegistrationHandle};
use crate::marker::MarkerStore;
use crate::notify::UpdateNotifier;
use crate::scope::{is_localhost, RegistrationTarget};
use crate::state::{AgentState, ServiceWorkerId};
use crate::{RegistrationFailure, ServiceWorkerError};

/// Default marker key for "an agent was activated for this origin".
pub const DEFAULT_MARKER_KEY: &str = "offlinekit.sw.activated";

/// Manager configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Register at all. Disabled behaves like an unsupported runtime.
    pub enabled: bool,
    /// Key of the durable marker.
    pub marker_key: String,
    /// Retry policy for failed registrations within one page load.
    pub retry: RetryConfig,
    /// Upper bound for a single registration attempt.
    pub registration_timeout_ms: u64,
    /// On localhost, remove the agent when its script is missing or invalid.
    pub validate_on_localhost: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            marker_key: DEFAULT_MARKER_KEY.to_string(),
            retry: RetryConfig::none(),
            registration_timeout_ms: 30_000,
            validate_on_localhost: true,
        }
    }
}

impl ManagerConfig {
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }
}

/// Snapshot of the manager's view, for diagnostics and host UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerStatus {
    pub supported: bool,
    pub enabled: bool,
    pub handle: Option<RegistrationHandle>,
    pub scope: Option<Url>,
    pub update_available: bool,
    pub waiting_worker: Option<ServiceWorkerId>,
    pub ever_activated: bool,
    pub last_failure: Option<ServiceWorkerError>,
}

/// Host-visible outcome of a single lifecycle observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    UpdateAvailable,
    OfflineReady,
}

#[derive(Debug, Default)]
struct ManagerState {
    handle: Option<RegistrationHandle>,
    scope: Option<Url>,
    workers: HashMap<ServiceWorkerId, AgentState>,
    ever_activated: bool,
    offline_ready_sent: bool,
    update_available: bool,
    waiting: Option<ServiceWorkerId>,
    /// Last worker to control the scope. Cleared only when the registration
    /// is removed, so a replacement activating after it went redundant still
    /// counts as an update.
    active: Option<ServiceWorkerId>,
    announced: HashSet<ServiceWorkerId>,
    last_failure: Option<ServiceWorkerError>,
}

impl ManagerState {
    fn observe(&mut self, event: LifecycleEvent) -> Option<Signal> {
        let LifecycleEvent { worker, state } = event;

        match self.workers.get(&worker).copied() {
            Some(previous) if previous == state => {
                trace!(%worker, %state, "Re-observed state");
            }
            Some(previous) if previous.is_past(state) => {
                debug!(%worker, %previous, %state, "Stale lifecycle event ignored");
                return None;
            }
            Some(previous) if !previous.can_transition_to(state) => {
                warn!(%worker, %previous, %state, "Invalid lifecycle transition ignored");
                return None;
            }
            Some(_) => {}
            None => trace!(%worker, %state, "First event for worker"),
        }
        self.workers.insert(worker, state);

        match state {
            AgentState::InstalledWaiting => {
                if !self.is_update(worker) {
                    debug!(%worker, "First install; nothing to update yet");
                    return None;
                }
                self.waiting = Some(worker);
                self.update_available = true;
                if self.announced.insert(worker) {
                    info!(%worker, "Update installed and waiting");
                    Some(Signal::UpdateAvailable)
                } else {
                    trace!(%worker, "Update already announced");
                    None
                }
            }
            AgentState::Activated => {
                if self.waiting == Some(worker) {
                    self.waiting = None;
                    self.update_available = false;
                }
                let update = self.is_update(worker);
                self.active = Some(worker);
                if update {
                    debug!(%worker, "Activated after update");
                    return None;
                }
                self.ever_activated = true;
                if self.offline_ready_sent {
                    return None;
                }
                self.offline_ready_sent = true;
                info!(%worker, "First agent activated");
                Some(Signal::OfflineReady)
            }
            AgentState::Redundant => {
                if self.waiting == Some(worker) {
                    self.waiting = None;
                    self.update_available = false;
                }
                debug!(%worker, "Worker redundant");
                None
            }
            AgentState::Installing | AgentState::Activating | AgentState::Unregistered => {
                debug!(%worker, %state, "Lifecycle transition");
                None
            }
        }
    }

    /// An update needs both the marker and a different worker already in
    /// control. A marker without an active worker is a fresh install.
    fn is_update(&self, worker: ServiceWorkerId) -> bool {
        self.ever_activated && self.active.is_some_and(|active| active != worker)
    }

    /// Record the environment's active worker. Workers this page is already
    /// following get their state from events instead.
    fn observe_active(&mut self, active: Option<ServiceWorkerId>) {
        if let Some(active) = active {
            if !self.workers.contains_key(&active) {
                trace!(worker = %active, "Active worker predates this page");
                self.active = Some(active);
            }
        }
    }
}

struct ManagerShared {
    environment: Arc<dyn AgentEnvironment>,
    markers: Arc<dyn MarkerStore>,
    notifier: Arc<dyn UpdateNotifier>,
    config: ManagerConfig,
    supported: bool,
    state: RwLock<ManagerState>,
}

/// Owns the registration → update → activation protocol for one page.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ServiceWorkerManager {
    shared: Arc<ManagerShared>,
}

impl ServiceWorkerManager {
    /// Create a manager. Capability detection and the marker read happen
    /// here, once.
    pub fn new(
        environment: Arc<dyn AgentEnvironment>,
        markers: Arc<dyn MarkerStore>,
        notifier: Arc<dyn UpdateNotifier>,
        config: ManagerConfig,
    ) -> Self {
        let supported = environment.supports_agents();
        let ever_activated = match markers.get(&config.marker_key) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    error = %e,
                    category = e.category(),
                    key = %config.marker_key,
                    "Could not read activation marker"
                );
                false
            }
        };
        debug!(supported, ever_activated, enabled = config.enabled, "Service worker manager created");

        Self {
            shared: Arc::new(ManagerShared {
                environment,
                markers,
                notifier,
                config,
                supported,
                state: RwLock::new(ManagerState {
                    ever_activated,
                    ..Default::default()
                }),
            }),
        }
    }

    /// Whether the runtime supports caching agents at all.
    pub fn is_supported(&self) -> bool {
        self.shared.supported
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    /// Start registration in the background and return immediately.
    ///
    /// The task registers, then follows lifecycle events until the
    /// environment closes the stream. Failures are reported through the
    /// notifier; they never reach the caller. Must be called within a tokio
    /// runtime.
    pub fn register(&self, script_url: impl Into<String>, scope: impl Into<String>) -> JoinHandle<()> {
        let manager = self.clone();
        let script_url = script_url.into();
        let scope = scope.into();
        tokio::spawn(async move { manager.run(&script_url, &scope).await })
    }

    /// Register and follow lifecycle events until the stream closes.
    pub async fn run(&self, script_url: &str, scope: &str) {
        if let Ok(Some(events)) = self.try_register(script_url, scope).await {
            self.pump(events).await;
        }
    }

    /// Register and subscribe, returning the event stream.
    ///
    /// `Ok(None)` when the runtime is unsupported or the manager is
    /// disabled. Errors are also reported through the notifier.
    #[instrument(skip(self))]
    pub async fn try_register(
        &self,
        script_url: &str,
        scope: &str,
    ) -> Result<Option<LifecycleEvents>, ServiceWorkerError> {
        if !self.shared.supported {
            debug!("Service workers unsupported; registration skipped");
            return Ok(None);
        }
        if !self.shared.config.enabled {
            debug!("Service worker registration disabled");
            return Ok(None);
        }

        let page = self.shared.environment.page_url();
        let target = match RegistrationTarget::resolve(&page, script_url, scope) {
            Ok(target) => target,
            Err(reason) => {
                let err = ServiceWorkerError::RegistrationFailed(reason);
                self.report_failure(&page, None, &err).await;
                return Err(err);
            }
        };

        let handle = match self.register_with_policy(&target).await {
            Ok(handle) => handle,
            Err(err) => {
                self.report_failure(&page, Some(&target), &err).await;
                return Err(err);
            }
        };

        let events = match self.shared.environment.subscribe(handle).await {
            Ok(events) => events,
            Err(err) => {
                self.report_failure(&page, Some(&target), &err).await;
                return Err(err);
            }
        };

        {
            let mut state = self.shared.state.write().await;
            state.handle = Some(handle);
            state.scope = Some(target.scope.clone());
            state.last_failure = None;
        }
        info!(%handle, scope = %target.scope, script = %target.script_url, "Service worker registered");

        self.recheck().await;
        Ok(Some(events))
    }

    async fn register_with_policy(
        &self,
        target: &RegistrationTarget,
    ) -> Result<RegistrationHandle, ServiceWorkerError> {
        retry_with_backoff_if(
            &self.shared.config.retry,
            ServiceWorkerError::is_retryable,
            move || self.register_once(target),
        )
        .await
    }

    async fn register_once(
        &self,
        target: &RegistrationTarget,
    ) -> Result<RegistrationHandle, ServiceWorkerError> {
        let timeout = self.shared.config.registration_timeout();
        let environment = &self.shared.environment;
        match with_timeout(timeout, || {
            environment.register_agent(&target.script_url, &target.scope)
        })
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RegistrationFailure::Timeout(timeout).into()),
        }
    }

    async fn report_failure(
        &self,
        page: &Url,
        target: Option<&RegistrationTarget>,
        err: &ServiceWorkerError,
    ) {
        self.shared.state.write().await.last_failure = Some(err.clone());

        match err.failure() {
            Some(RegistrationFailure::Network(_)) => {
                info!(error = %err, "No network connection; running in offline mode");
            }
            _ => warn!(error = %err, "Service worker registration failed"),
        }
        self.shared.notifier.on_registration_failed(err);

        let invalid_script = err.failure().is_some_and(RegistrationFailure::is_invalid_script);
        if let Some(target) = target {
            if invalid_script && self.shared.config.validate_on_localhost && is_localhost(page) {
                self.remove_stale_agent(target).await;
            }
        }
    }

    /// The script no longer exists or is not JavaScript: an agent still
    /// registered at this scope would keep serving a stale app.
    async fn remove_stale_agent(&self, target: &RegistrationTarget) {
        match self.shared.environment.unregister(&target.scope).await {
            Ok(true) => {
                self.shared.state.write().await.active = None;
                info!(scope = %target.scope, "Removed stale service worker");
                self.shared.notifier.on_reload_required();
            }
            Ok(false) => debug!(scope = %target.scope, "No stale service worker to remove"),
            Err(e) => warn!(error = %e, scope = %target.scope, "Could not remove stale service worker"),
        }
    }

    /// Follow lifecycle events until the environment closes the stream.
    pub async fn pump(&self, mut events: LifecycleEvents) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        debug!("Lifecycle event stream closed");
    }

    /// Apply one lifecycle transition and emit the resulting signal.
    pub async fn handle_event(&self, event: LifecycleEvent) {
        let signal = self.shared.state.write().await.observe(event);

        match signal {
            Some(Signal::UpdateAvailable) => self.shared.notifier.on_update_available(),
            Some(Signal::OfflineReady) => {
                if let Err(e) = self.shared.markers.set(&self.shared.config.marker_key, true) {
                    warn!(
                        error = %e,
                        category = e.category(),
                        "Could not persist activation marker"
                    );
                }
                self.shared.notifier.on_offline_ready();
            }
            None => {}
        }
    }

    /// Look the registration up again and account for a waiting worker.
    ///
    /// Safe to call repeatedly: a worker is announced at most once.
    pub async fn recheck(&self) {
        let Some(handle) = self.shared.state.read().await.handle else {
            return;
        };
        let Some(snapshot) = self.shared.environment.snapshot(handle).await else {
            debug!(%handle, "Registration no longer exists");
            return;
        };
        self.shared
            .state
            .write()
            .await
            .observe_active(snapshot.active.as_ref().map(|w| w.id));
        if let Some(waiting) = snapshot.waiting {
            self.handle_event(LifecycleEvent::new(waiting.id, AgentState::InstalledWaiting))
                .await;
        }
    }

    /// Ask the waiting update to activate now.
    ///
    /// Returns whether a skip-waiting request was sent. Without an available
    /// update this does nothing.
    pub async fn request_update_now(&self) -> bool {
        let (handle, worker) = {
            let state = self.shared.state.read().await;
            match (state.update_available, state.handle, state.waiting) {
                (true, Some(handle), Some(worker)) => (handle, worker),
                _ => {
                    debug!("No update waiting; skip-waiting not sent");
                    return false;
                }
            }
        };

        match self.shared.environment.skip_waiting(handle, worker).await {
            Ok(()) => {
                info!(%worker, "Requested immediate activation of update");
                true
            }
            Err(e) => {
                warn!(error = %e, %worker, "Skip-waiting request failed");
                false
            }
        }
    }

    /// Remove this page's registration. Returns false if there was none.
    pub async fn unregister(&self) -> Result<bool, ServiceWorkerError> {
        let Some(scope) = self.shared.state.read().await.scope.clone() else {
            return Ok(false);
        };

        let removed = self.shared.environment.unregister(&scope).await?;

        let mut state = self.shared.state.write().await;
        state.handle = None;
        state.scope = None;
        state.waiting = None;
        state.active = None;
        state.update_available = false;
        info!(%scope, removed, "Service worker unregistered");
        Ok(removed)
    }

    /// Current view of the registration.
    pub async fn status(&self) -> ManagerStatus {
        let state = self.shared.state.read().await;
        ManagerStatus {
            supported: self.shared.supported,
            enabled: self.shared.config.enabled,
            handle: state.handle,
            scope: state.scope.clone(),
            update_available: state.update_available,
            waiting_worker: state.waiting,
            ever_activated: state.ever_activated,
            last_failure: state.last_failure.clone(),
        }
    }

    /// Whether an update is installed and waiting.
    pub async fn update_available(&self) -> bool {
        self.shared.state.read().await.update_available
    }
}
