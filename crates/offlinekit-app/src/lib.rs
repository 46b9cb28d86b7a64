//! # OfflineKit App
//!
//! Page bootstrap: find the mount element, hand it to the application, then
//! register the service worker in the background.
//!
//! ```text
//! AppConfig ──► PageDocument ──► BootstrapSequencer::run
//!                                   ├── mount(#root)      (once, errors propagate)
//!                                   └── ServiceWorkerManager::register (spawned)
//! ```

pub mod bootstrap;
pub mod config;
pub mod page;

pub use bootstrap::{
    BootstrapError, BootstrapSequencer, Bootstrapped, MountTarget, RegistrationRequest,
};
pub use config::AppConfig;
pub use page::{PageDocument, PageElement, PageError};
