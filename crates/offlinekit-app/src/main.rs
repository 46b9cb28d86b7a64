//! OfflineKit bootstrap runner
//!
//! Loads a built page, mounts into its root element and registers the
//! service worker against an in-process host serving the assets directory.
//! Lifecycle notifications go to the log.
//!
//! The host starts empty on every run while the marker file persists, so each
//! run is a fresh install with the marker already set. The manager reports
//! that as offline-ready; an update needs a worker already in control.

use anyhow::Context;
use offlinekit_app::{AppConfig, BootstrapSequencer, PageDocument};
use offlinekit_common::init_logging;
use offlinekit_sw::{
    DirectoryScripts, InProcessHost, JsonFileMarkerStore, LoggingNotifier, ServiceWorkerManager,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Parse command line arguments
struct Args {
    config: Option<PathBuf>,
    page: Option<PathBuf>,
    settle_ms: u64,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config = None;
        let mut page = None;
        let mut settle_ms = 500u64;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    config = args.next().map(PathBuf::from);
                }
                "--page" => {
                    page = args.next().map(PathBuf::from);
                }
                "--settle-ms" => {
                    if let Some(val) = args.next() {
                        settle_ms = val.parse().unwrap_or(500);
                    }
                }
                _ => {}
            }
        }

        Self {
            config,
            page,
            settle_ms,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load_or_default(args.config.as_deref())?;
    if let Some(page) = args.page {
        config.index_html = page;
    }
    init_logging(&config.log)?;

    info!(
        page = %config.index_html.display(),
        page_url = %config.page_url,
        assets = %config.assets_dir.display(),
        settle_ms = args.settle_ms,
        "Starting OfflineKit"
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;

    runtime.block_on(run(config, Duration::from_millis(args.settle_ms)))
}

async fn run(config: AppConfig, settle: Duration) -> anyhow::Result<()> {
    let page_url = config.page_url()?;
    let document = PageDocument::from_file(&config.index_html)
        .with_context(|| format!("loading {}", config.index_html.display()))?;
    info!(title = ?document.title(), "Page loaded");

    let scripts = Arc::new(DirectoryScripts::new(&config.assets_dir));
    let host = Arc::new(InProcessHost::new(page_url.clone(), scripts));
    let markers = Arc::new(JsonFileMarkerStore::open(config.marker_path(), &page_url));
    let manager = ServiceWorkerManager::new(
        host.clone(),
        markers,
        Arc::new(LoggingNotifier),
        config.service_worker.clone(),
    );

    let sequencer =
        BootstrapSequencer::new(document, manager, config.registration_request());
    let booted = sequencer.run(&config.root_element_id, |target| {
        info!(tag = %target.tag_name, id = ?target.id(), "Application mounted into page");
        Ok(())
    })?;

    tokio::time::sleep(settle).await;
    host.unload_page().await;
    if tokio::time::timeout(settle.max(Duration::from_secs(1)), booted.registration)
        .await
        .is_err()
    {
        warn!("Lifecycle task still running after unload");
    }

    let status = booted.manager.status().await;
    info!(
        supported = status.supported,
        handle = ?status.handle,
        scope = ?status.scope.as_ref().map(|s| s.as_str()),
        update_available = status.update_available,
        ever_activated = status.ever_activated,
        last_failure = ?status.last_failure,
        "Bootstrap finished"
    );
    Ok(())
}
