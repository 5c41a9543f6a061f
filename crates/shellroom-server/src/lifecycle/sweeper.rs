//! Periodic expiry of containers past their lifetime.

use super::LifecycleManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Idle → scanning → idle, once per `interval`.
pub struct ExpirySweeper {
    manager: Arc<LifecycleManager>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(manager: Arc<LifecycleManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// One scan. Returns the usernames whose containers were torn down.
    ///
    /// Expiry is re-checked under each user's lock, so an extend that lands
    /// between listing and teardown wins.
    pub async fn scan_once(&self) -> Vec<String> {
        let mut removed = Vec::new();
        for username in self.manager.expired_users().await {
            if self.manager.teardown_if_expired(&username).await {
                removed.push(username);
            }
        }
        if removed.is_empty() {
            debug!("sweep found nothing expired");
        } else {
            info!(count = removed.len(), users = ?removed, "sweep removed expired containers");
        }
        removed
    }

    /// Run until the shutdown broadcast fires.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately.
        interval.tick().await;
        info!(interval_secs = self.interval.as_secs(), "expiry sweeper started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.scan_once().await;
                }
                _ = shutdown_rx.recv() => {
                    debug!("expiry sweeper stopping");
                    break;
                }
            }
        }
    }
}
