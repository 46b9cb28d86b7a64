//! Notification surface towards the host application.

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::ServiceWorkerError;

/// Implemented by the host application.
///
/// `on_update_available` and `on_offline_ready` are the only user-facing
/// signals. The remaining hooks report failures and default to no-ops.
pub trait UpdateNotifier: Send + Sync {
    /// A new agent is installed and waiting; a reload will pick it up.
    fn on_update_available(&self);

    /// The first agent for this scope is active; assets are cached.
    fn on_offline_ready(&self);

    /// Registration failed; offline support is unavailable this session.
    fn on_registration_failed(&self, _error: &ServiceWorkerError) {}

    /// A stale agent was removed and the page should be reloaded.
    fn on_reload_required(&self) {}
}

/// Notifications as delivered by [`ChannelNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostNotification {
    UpdateAvailable,
    OfflineReady,
    RegistrationFailed(ServiceWorkerError),
    ReloadRequired,
}

impl HostNotification {
    /// Whether this is one of the two user-facing signals.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            HostNotification::UpdateAvailable | HostNotification::OfflineReady
        )
    }
}

/// Forwards notifications into a channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<HostNotification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HostNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, notification: HostNotification) {
        let _ = self.tx.send(notification);
    }
}

impl UpdateNotifier for ChannelNotifier {
    fn on_update_available(&self) {
        self.send(HostNotification::UpdateAvailable);
    }

    fn on_offline_ready(&self) {
        self.send(HostNotification::OfflineReady);
    }

    fn on_registration_failed(&self, error: &ServiceWorkerError) {
        self.send(HostNotification::RegistrationFailed(error.clone()));
    }

    fn on_reload_required(&self) {
        self.send(HostNotification::ReloadRequired);
    }
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

impl UpdateNotifier for LoggingNotifier {
    fn on_update_available(&self) {
        info!("New content is available; please refresh.");
    }

    fn on_offline_ready(&self) {
        info!("Content is cached for offline use.");
    }

    fn on_registration_failed(&self, error: &ServiceWorkerError) {
        warn!(%error, "Error during service worker registration");
    }

    fn on_reload_required(&self) {
        info!("Stale service worker removed; reload the page.");
    }
}
