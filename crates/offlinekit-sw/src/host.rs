//! In-process agent host.
//!
//! Implements [`AgentEnvironment`] without a browser: registrations are kept
//! per scope with `installing` / `waiting` / `active` slots, scripts come from
//! a [`ScriptSource`], and every transition is published to subscribers in
//! the order a browser would fire `statechange`.
//!
//! ```text
//! InProcessHost
//!     └── HostedRegistration (per scope)
//!             ├── installing (HostedWorker)
//!             ├── waiting (HostedWorker)
//!             ├── active (HostedWorker)
//!             └── subscribers / backlog
//! ```

use async_trait::async_trait;
use hashbrown::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace};
use url::Url;

use crate::environment::{
    AgentEnvironment, LifecycleEvent, LifecycleEvents, RegistrationHandle, RegistrationSnapshot,
};
use crate::state::{AgentState, ServiceWorkerId, WorkerInfo};
use crate::{RegistrationFailure, ServiceWorkerError};

// ==================== Scripts ====================

/// Response to a script fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl ScriptResponse {
    /// A 200 response with a JavaScript MIME type.
    pub fn javascript(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: "application/javascript; charset=utf-8".to_string(),
            body: body.into(),
        }
    }

    /// A 404 response.
    pub fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "text/plain".to_string(),
            body: String::new(),
        }
    }

    /// Check if the MIME type is acceptable for an agent script.
    pub fn is_javascript(&self) -> bool {
        let mime = self
            .content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        matches!(
            mime.as_str(),
            "application/javascript" | "text/javascript" | "application/x-javascript"
        )
    }
}

/// Where the host fetches agent scripts from.
#[async_trait]
pub trait ScriptSource: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<ScriptResponse, RegistrationFailure>;
}

/// Scripts held in memory, keyed by URL path.
#[derive(Debug, Default)]
pub struct StaticScripts {
    responses: RwLock<HashMap<String, ScriptResponse>>,
}

impl StaticScripts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` as JavaScript at `path`, replacing any previous version.
    pub async fn serve(&self, path: &str, body: impl Into<String>) {
        self.respond(path, ScriptResponse::javascript(body)).await;
    }

    /// Serve an arbitrary response at `path`.
    pub async fn respond(&self, path: &str, response: ScriptResponse) {
        self.responses.write().await.insert(path.to_string(), response);
    }

    /// Stop serving `path`; later fetches get a 404.
    pub async fn remove(&self, path: &str) -> bool {
        self.responses.write().await.remove(path).is_some()
    }
}

#[async_trait]
impl ScriptSource for StaticScripts {
    async fn fetch(&self, url: &Url) -> Result<ScriptResponse, RegistrationFailure> {
        Ok(self
            .responses
            .read()
            .await
            .get(url.path())
            .cloned()
            .unwrap_or_else(ScriptResponse::not_found))
    }
}

/// Scripts read from a build output directory.
///
/// Unknown extensions are served as `text/html`, the way a single-page app
/// server answers every unknown path with its index page.
#[derive(Debug, Clone)]
pub struct DirectoryScripts {
    root: PathBuf,
}

impl DirectoryScripts {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, url: &Url) -> Option<PathBuf> {
        let relative = Path::new(url.path().trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(relative))
    }

    fn content_type(path: &Path) -> &'static str {
        match path.extension().and_then(|e| e.to_str()) {
            Some("js") | Some("mjs") => "application/javascript; charset=utf-8",
            Some("json") => "application/json",
            _ => "text/html; charset=utf-8",
        }
    }
}

#[async_trait]
impl ScriptSource for DirectoryScripts {
    async fn fetch(&self, url: &Url) -> Result<ScriptResponse, RegistrationFailure> {
        let Some(path) = self.resolve(url) else {
            return Ok(ScriptResponse::not_found());
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(body) => Ok(ScriptResponse {
                status: 200,
                content_type: Self::content_type(&path).to_string(),
                body,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ScriptResponse::not_found()),
            Err(e) => Err(RegistrationFailure::Network(format!(
                "reading {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

// ==================== Workers ====================

#[derive(Debug)]
struct HostedWorker {
    id: ServiceWorkerId,
    script_url: Url,
    script: String,
    state: AgentState,
}

impl HostedWorker {
    fn new(script_url: Url, script: String) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            script_url,
            script,
            state: AgentState::Unregistered,
        }
    }

    fn set_state(&mut self, state: AgentState) -> LifecycleEvent {
        self.state = state;
        LifecycleEvent::new(self.id, state)
    }

    fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            script_url: self.script_url.clone(),
            state: self.state,
        }
    }
}

// ==================== Registration ====================

#[derive(Debug)]
struct HostedRegistration {
    handle: RegistrationHandle,
    scope: Url,
    installing: Option<HostedWorker>,
    waiting: Option<HostedWorker>,
    active: Option<HostedWorker>,
    page_open: bool,
    subscribers: Vec<mpsc::UnboundedSender<LifecycleEvent>>,
    backlog: Vec<LifecycleEvent>,
}

impl HostedRegistration {
    fn new(scope: Url) -> Self {
        Self {
            handle: RegistrationHandle::new(),
            scope,
            installing: None,
            waiting: None,
            active: None,
            page_open: false,
            subscribers: Vec::new(),
            backlog: Vec::new(),
        }
    }

    /// Newest worker, the one an update check compares against.
    fn newest(&self) -> Option<&HostedWorker> {
        self.installing
            .as_ref()
            .or(self.waiting.as_ref())
            .or(self.active.as_ref())
    }

    fn is_current(&self, script_url: &Url, script: &str) -> bool {
        self.newest()
            .map(|w| &w.script_url == script_url && w.script == script)
            .unwrap_or(false)
    }

    fn publish(&mut self, event: LifecycleEvent) {
        trace!(scope = %self.scope, worker = %event.worker, state = %event.state, "statechange");
        if self.subscribers.is_empty() {
            if self.page_open {
                self.backlog.push(event);
            }
            return;
        }
        self.subscribers.retain(|tx| tx.send(event).is_ok());
    }

    fn subscribe(&mut self) -> LifecycleEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in self.backlog.drain(..) {
            let _ = tx.send(event);
        }
        self.subscribers.push(tx);
        rx
    }

    /// Run install for a new script. The first agent of a registration
    /// activates straight away; later ones wait.
    fn install(&mut self, script_url: Url, script: String) -> ServiceWorkerId {
        let mut worker = HostedWorker::new(script_url, script);
        let id = worker.id;

        let event = worker.set_state(AgentState::Installing);
        self.installing = Some(worker);
        self.publish(event);

        if let Some(mut worker) = self.installing.take() {
            let event = worker.set_state(AgentState::InstalledWaiting);
            if let Some(mut previous) = self.waiting.take() {
                let superseded = previous.set_state(AgentState::Redundant);
                self.publish(superseded);
            }
            self.waiting = Some(worker);
            self.publish(event);
        }

        if self.active.is_none() {
            self.activate_waiting();
        }
        id
    }

    fn activate_waiting(&mut self) -> Option<ServiceWorkerId> {
        let mut worker = self.waiting.take()?;

        let activating = worker.set_state(AgentState::Activating);
        self.publish(activating);

        if let Some(mut old) = self.active.take() {
            let retired = old.set_state(AgentState::Redundant);
            self.publish(retired);
        }

        let activated = worker.set_state(AgentState::Activated);
        let id = worker.id;
        self.active = Some(worker);
        self.publish(activated);
        Some(id)
    }

    fn retire(&mut self) {
        for slot in [&mut self.installing, &mut self.waiting, &mut self.active] {
            if let Some(mut worker) = slot.take() {
                let event = worker.set_state(AgentState::Redundant);
                trace!(worker = %event.worker, "retired");
                for tx in &self.subscribers {
                    let _ = tx.send(event);
                }
            }
        }
        self.subscribers.clear();
        self.backlog.clear();
    }

    fn snapshot(&self) -> RegistrationSnapshot {
        RegistrationSnapshot {
            handle: self.handle,
            scope: self.scope.clone(),
            installing: self.installing.as_ref().map(HostedWorker::info),
            waiting: self.waiting.as_ref().map(HostedWorker::info),
            active: self.active.as_ref().map(HostedWorker::info),
        }
    }
}

// ==================== Host ====================

#[derive(Debug, Default)]
struct HostState {
    registrations: HashMap<String, HostedRegistration>,
    offline: bool,
}

impl HostState {
    fn by_handle(&mut self, handle: RegistrationHandle) -> Option<&mut HostedRegistration> {
        self.registrations
            .values_mut()
            .find(|r| r.handle == handle)
    }
}

/// An [`AgentEnvironment`] that runs inside the current process.
///
/// Registrations outlive [`unload_page`](InProcessHost::unload_page), so one
/// host can model several page loads of the same origin.
pub struct InProcessHost {
    page_url: Url,
    supported: bool,
    scripts: Arc<dyn ScriptSource>,
    state: RwLock<HostState>,
}

impl InProcessHost {
    /// Create a host for a page, fetching scripts from `scripts`.
    pub fn new(page_url: Url, scripts: Arc<dyn ScriptSource>) -> Self {
        Self {
            page_url,
            supported: true,
            scripts,
            state: RwLock::new(HostState::default()),
        }
    }

    /// Model a runtime without service worker support.
    pub fn unsupported(mut self) -> Self {
        self.supported = false;
        self
    }

    /// Make script fetches fail as if the network were down.
    pub async fn set_offline(&self, offline: bool) {
        self.state.write().await.offline = offline;
    }

    /// Close the page: subscriptions end, and a waiting agent with no
    /// clients left becomes active.
    pub async fn unload_page(&self) {
        let mut state = self.state.write().await;
        for registration in state.registrations.values_mut() {
            registration.page_open = false;
            registration.subscribers.clear();
            registration.backlog.clear();
            if let Some(id) = registration.activate_waiting() {
                debug!(scope = %registration.scope, worker = %id, "Waiting worker activated on unload");
            }
        }
    }

    /// Number of live registrations.
    pub async fn registration_count(&self) -> usize {
        self.state.read().await.registrations.len()
    }

    /// Look up a registration by scope.
    pub async fn snapshot_scope(&self, scope: &Url) -> Option<RegistrationSnapshot> {
        self.state
            .read()
            .await
            .registrations
            .get(scope.as_str())
            .map(HostedRegistration::snapshot)
    }

    async fn fetch_script(&self, url: &Url) -> Result<String, RegistrationFailure> {
        let response = self.scripts.fetch(url).await?;
        match response.status {
            200..=299 => {}
            404 => return Err(RegistrationFailure::ScriptNotFound(url.to_string())),
            status => {
                return Err(RegistrationFailure::Network(format!(
                    "HTTP {status} fetching {url}"
                )))
            }
        }
        if !response.is_javascript() {
            return Err(RegistrationFailure::Script(format!(
                "unsupported MIME type `{}` for {}",
                response.content_type, url
            )));
        }
        if response.body.trim().is_empty() {
            return Err(RegistrationFailure::Script(format!("{url} is empty")));
        }
        Ok(response.body)
    }
}

#[async_trait]
impl AgentEnvironment for InProcessHost {
    fn supports_agents(&self) -> bool {
        self.supported
    }

    fn page_url(&self) -> Url {
        self.page_url.clone()
    }

    async fn register_agent(
        &self,
        script_url: &Url,
        scope: &Url,
    ) -> Result<RegistrationHandle, ServiceWorkerError> {
        if !self.supported {
            return Err(ServiceWorkerError::StateError(
                "service workers are not supported".to_string(),
            ));
        }
        if self.state.read().await.offline {
            return Err(RegistrationFailure::Network("no network connection".to_string()).into());
        }

        let script = self.fetch_script(script_url).await?;

        let mut state = self.state.write().await;
        let registration = state
            .registrations
            .entry(scope.to_string())
            .or_insert_with(|| HostedRegistration::new(scope.clone()));
        registration.page_open = true;

        if registration.is_current(script_url, &script) {
            debug!(scope = %scope, "Script unchanged; no update");
        } else {
            let worker = registration.install(script_url.clone(), script);
            info!(scope = %scope, script = %script_url, worker = %worker, "Installed new worker");
        }

        Ok(registration.handle)
    }

    async fn subscribe(
        &self,
        handle: RegistrationHandle,
    ) -> Result<LifecycleEvents, ServiceWorkerError> {
        let mut state = self.state.write().await;
        let registration = state
            .by_handle(handle)
            .ok_or(ServiceWorkerError::NotRegistered(handle))?;
        Ok(registration.subscribe())
    }

    async fn snapshot(&self, handle: RegistrationHandle) -> Option<RegistrationSnapshot> {
        self.state
            .read()
            .await
            .registrations
            .values()
            .find(|r| r.handle == handle)
            .map(HostedRegistration::snapshot)
    }

    async fn skip_waiting(
        &self,
        handle: RegistrationHandle,
        worker: ServiceWorkerId,
    ) -> Result<(), ServiceWorkerError> {
        let mut state = self.state.write().await;
        let registration = state
            .by_handle(handle)
            .ok_or(ServiceWorkerError::NotRegistered(handle))?;

        match registration.waiting.as_ref() {
            Some(waiting) if waiting.id == worker => {}
            _ => {
                return Err(ServiceWorkerError::StateError(format!(
                    "{worker} is not waiting"
                )))
            }
        }

        registration.activate_waiting();
        debug!(scope = %registration.scope, worker = %worker, "skipWaiting");
        Ok(())
    }

    async fn unregister(&self, scope: &Url) -> Result<bool, ServiceWorkerError> {
        let mut state = self.state.write().await;
        match state.registrations.remove(scope.as_str()) {
            Some(mut registration) => {
                registration.retire();
                info!(scope = %scope, "Unregistered");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    async fn host_with(body: &str) -> (InProcessHost, Arc<StaticScripts>) {
        let scripts = Arc::new(StaticScripts::new());
        scripts.serve("/sw.js", body).await;
        let host = InProcessHost::new(url("https://app.example/"), scripts.clone());
        (host, scripts)
    }

    fn drain(events: &mut LifecycleEvents) -> Vec<LifecycleEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    fn states(events: &[LifecycleEvent]) -> Vec<AgentState> {
        events.iter().map(|e| e.state).collect()
    }

    #[test]
    fn test_script_response_mime() {
        assert!(ScriptResponse::javascript("x").is_javascript());
        let html = ScriptResponse {
            status: 200,
            content_type: "text/html; charset=utf-8".into(),
            body: "<html>".into(),
        };
        assert!(!html.is_javascript());
    }

    #[tokio::test]
    async fn test_first_install_activates_immediately() {
        let (host, _) = host_with("// v1").await;
        let handle = host
            .register_agent(&url("https://app.example/sw.js"), &url("https://app.example/"))
            .await
            .unwrap();

        let mut events = host.subscribe(handle).await.unwrap();
        let seen = drain(&mut events);
        assert_eq!(
            states(&seen),
            vec![
                AgentState::Installing,
                AgentState::InstalledWaiting,
                AgentState::Activating,
                AgentState::Activated,
            ]
        );
        assert!(seen.iter().all(|e| e.worker == seen[0].worker));

        let snapshot = host.snapshot(handle).await.unwrap();
        assert_eq!(snapshot.active.unwrap().id, seen[0].worker);
        assert!(snapshot.waiting.is_none());
    }

    #[tokio::test]
    async fn test_unchanged_script_produces_no_events() {
        let (host, _) = host_with("// v1").await;
        let script = url("https://app.example/sw.js");
        let scope = url("https://app.example/");

        let first = host.register_agent(&script, &scope).await.unwrap();
        host.unload_page().await;

        let second = host.register_agent(&script, &scope).await.unwrap();
        assert_eq!(first, second);

        let mut events = host.subscribe(second).await.unwrap();
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_update_waits_until_skip_waiting() {
        let (host, scripts) = host_with("// v1").await;
        let script = url("https://app.example/sw.js");
        let scope = url("https://app.example/");

        let handle = host.register_agent(&script, &scope).await.unwrap();
        let old = host.snapshot(handle).await.unwrap().active.unwrap().id;
        host.unload_page().await;

        scripts.serve("/sw.js", "// v2").await;
        host.register_agent(&script, &scope).await.unwrap();
        let mut events = host.subscribe(handle).await.unwrap();

        let seen = drain(&mut events);
        assert_eq!(
            states(&seen),
            vec![AgentState::Installing, AgentState::InstalledWaiting]
        );
        let new = seen[0].worker;

        host.skip_waiting(handle, new).await.unwrap();
        let seen = drain(&mut events);
        assert_eq!(
            seen,
            vec![
                LifecycleEvent::new(new, AgentState::Activating),
                LifecycleEvent::new(old, AgentState::Redundant),
                LifecycleEvent::new(new, AgentState::Activated),
            ]
        );
    }

    #[tokio::test]
    async fn test_skip_waiting_requires_waiting_worker() {
        let (host, _) = host_with("// v1").await;
        let handle = host
            .register_agent(&url("https://app.example/sw.js"), &url("https://app.example/"))
            .await
            .unwrap();
        let active = host.snapshot(handle).await.unwrap().active.unwrap().id;

        let err = host.skip_waiting(handle, active).await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::StateError(_)));
    }

    #[tokio::test]
    async fn test_unload_promotes_waiting_worker() {
        let (host, scripts) = host_with("// v1").await;
        let script = url("https://app.example/sw.js");
        let scope = url("https://app.example/");

        let handle = host.register_agent(&script, &scope).await.unwrap();
        host.unload_page().await;
        scripts.serve("/sw.js", "// v2").await;
        host.register_agent(&script, &scope).await.unwrap();
        let waiting = host.snapshot(handle).await.unwrap().waiting.unwrap().id;

        host.unload_page().await;

        let snapshot = host.snapshot(handle).await.unwrap();
        assert!(snapshot.waiting.is_none());
        assert_eq!(snapshot.active.unwrap().id, waiting);
    }

    #[tokio::test]
    async fn test_fetch_failures() {
        let scripts = Arc::new(StaticScripts::new());
        scripts
            .respond(
                "/index.js",
                ScriptResponse {
                    status: 200,
                    content_type: "text/html".into(),
                    body: "<!doctype html>".into(),
                },
            )
            .await;
        scripts
            .respond(
                "/broken.js",
                ScriptResponse {
                    status: 503,
                    content_type: "text/plain".into(),
                    body: String::new(),
                },
            )
            .await;
        scripts.serve("/empty.js", "   ").await;
        let host = InProcessHost::new(url("https://app.example/"), scripts);
        let scope = url("https://app.example/");

        let missing = host
            .register_agent(&url("https://app.example/sw.js"), &scope)
            .await
            .unwrap_err();
        assert!(matches!(
            missing.failure(),
            Some(RegistrationFailure::ScriptNotFound(_))
        ));

        let html = host
            .register_agent(&url("https://app.example/index.js"), &scope)
            .await
            .unwrap_err();
        assert!(matches!(html.failure(), Some(RegistrationFailure::Script(_))));

        let unavailable = host
            .register_agent(&url("https://app.example/broken.js"), &scope)
            .await
            .unwrap_err();
        assert!(matches!(
            unavailable.failure(),
            Some(RegistrationFailure::Network(_))
        ));

        let empty = host
            .register_agent(&url("https://app.example/empty.js"), &scope)
            .await
            .unwrap_err();
        assert!(matches!(empty.failure(), Some(RegistrationFailure::Script(_))));

        assert_eq!(host.registration_count().await, 0);
    }

    #[tokio::test]
    async fn test_offline_registration_fails() {
        let (host, _) = host_with("// v1").await;
        host.set_offline(true).await;

        let err = host
            .register_agent(&url("https://app.example/sw.js"), &url("https://app.example/"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unregister_retires_workers() {
        let (host, _) = host_with("// v1").await;
        let scope = url("https://app.example/");
        let handle = host
            .register_agent(&url("https://app.example/sw.js"), &scope)
            .await
            .unwrap();
        let mut events = host.subscribe(handle).await.unwrap();
        drain(&mut events);

        assert!(host.unregister(&scope).await.unwrap());
        assert_eq!(states(&drain(&mut events)), vec![AgentState::Redundant]);
        assert!(!host.unregister(&scope).await.unwrap());
        assert!(host.snapshot(handle).await.is_none());
    }

    #[tokio::test]
    async fn test_directory_scripts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sw.js"), "self.addEventListener('fetch', () => {});")
            .unwrap();
        std::fs::write(dir.path().join("index.html"), "<!doctype html>").unwrap();
        let scripts = DirectoryScripts::new(dir.path());

        let js = scripts.fetch(&url("https://app.example/sw.js")).await.unwrap();
        assert_eq!(js.status, 200);
        assert!(js.is_javascript());

        let html = scripts
            .fetch(&url("https://app.example/index.html"))
            .await
            .unwrap();
        assert!(!html.is_javascript());

        let missing = scripts.fetch(&url("https://app.example/nope.js")).await.unwrap();
        assert_eq!(missing.status, 404);
    }
}
