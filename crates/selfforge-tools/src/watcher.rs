//! Manifest file watcher
//!
//! Polls the manifest's mtime and triggers a registry reconcile when it
//! advances. Tool source files are deliberately not watched: the manifest
//! is the source of record, so source edits without a manifest bump stay
//! invisible.

use crate::registry::ToolRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ManifestWatcher {
    registry: Arc<ToolRegistry>,
    path: PathBuf,
    poll_interval: Duration,
    last_mtime: Option<SystemTime>,
}

impl ManifestWatcher {
    pub fn new(registry: Arc<ToolRegistry>, poll_interval: Duration) -> Self {
        let path = registry.manifest_path().to_path_buf();
        // Initialize with the current mtime so startup does not refire.
        let last_mtime = mtime_of(&path);
        Self {
            registry,
            path,
            poll_interval,
            last_mtime,
        }
    }

    /// Run the poll loop until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            "manifest watcher started: {} every {:?}",
            self.path.display(),
            self.poll_interval
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.cancelled() => {
                    info!("manifest watcher shutting down");
                    return;
                }
            }

            // The file may be momentarily absent during an atomic rename.
            let Some(current) = mtime_of(&self.path) else {
                continue;
            };

            let changed = match self.last_mtime {
                Some(last) => current > last,
                None => true,
            };
            if !changed {
                continue;
            }

            debug!("manifest mtime advanced, reconciling");
            self.last_mtime = Some(current);
            if let Err(e) = self.registry.load_manifest().await {
                warn!("manifest reconcile failed: {}", e);
            }
        }
    }
}

fn mtime_of(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
