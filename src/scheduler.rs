use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::error::{AppError, Result};
use crate::room::ChatHub;
use crate::store::Store;

/// Deferred deletion of resolved alerts. Jobs live in the store next to the
/// alerts, so a restart with a snapshot picks them up again; a worker polls
/// for due jobs and runs the cascade delete for each.
pub struct DeletionScheduler {
    store: Arc<Store>,
    hub: ChatHub,
    clock: Arc<dyn Clock>,
    delay: chrono::Duration,
}

impl DeletionScheduler {
    pub fn new(store: Arc<Store>, hub: ChatHub, clock: Arc<dyn Clock>, delay: chrono::Duration) -> Self {
        Self { store, hub, clock, delay }
    }

    /// Queue the alert for deletion after the configured delay. A second
    /// call while a job is pending changes nothing and returns `false`.
    pub async fn schedule(&self, alert_id: &str) -> Result<bool> {
        let due_at = self.clock.now() + self.delay;
        let created = self.store.enqueue_deletion(alert_id, due_at).await?;
        if created {
            info!("Scheduling deletion for alert {alert_id} at {due_at}");
        }
        Ok(created)
    }

    pub async fn pending(&self, alert_id: &str) -> Option<DateTime<Utc>> {
        self.store.pending_deletion(alert_id).await
    }

    /// Execute every job that is due. Returns the ids of alerts deleted.
    pub async fn run_due(&self) -> Result<Vec<String>> {
        let now = self.clock.now();
        let mut deleted = Vec::new();
        for alert_id in self.store.due_deletions(now).await {
            match self.store.remove_alert(&alert_id, None, |_| Ok(())).await {
                Ok(removed) => {
                    info!(
                        "Alert {alert_id} deleted after being resolved ({} chat messages purged)",
                        removed.messages
                    );
                    self.hub.close_room(&alert_id).await;
                    deleted.push(alert_id);
                }
                Err(AppError::NotFound(_)) => {
                    warn!("Alert {alert_id} was already gone, dropping its deletion job");
                    self.store.discard_deletion(&alert_id).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = self.run_due().await {
                    error!("Deletion worker failed: {e}");
                }
            }
        })
    }
}
