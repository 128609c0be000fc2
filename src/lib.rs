pub mod error;
pub mod jobs;
pub mod remote;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod testing;

use std::sync::Arc;

pub use error::{Error, Result};
pub use jobs::actions::{MovieFlag, ShowFlag};
pub use jobs::{JobAction, JobFailure, JobQueue, Notifier, RawJob};
pub use remote::{CloudClient, HttpCloudClient, HttpTrackerClient, RemoteError, Service, TrackerClient};
pub use storage::models::{Episode, List, ListItem, ListItemType, Movie, Show, WatchedState};
pub use storage::Database;
pub use sync::{
    CancellationFlag, Catalog, Connectivity, ProgressSnapshot, Stage, StageError, SyncContext,
    SyncCoordinator, SyncOptions, SyncReport, SyncStatus, SyncType,
};

use storage::{repository, settings};
use tokio::sync::watch;

/// The most recent finished sync run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SyncRunSummary {
    pub sync_type: String,
    pub status: String,
    pub completed_at: Option<String>,
    pub error: Option<String>,
}

/// Main entry point: a local library kept in step with the Cloud and the
/// tracker.
pub struct ShowSync {
    coordinator: SyncCoordinator,
}

impl ShowSync {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            coordinator: SyncCoordinator::new(ctx),
        }
    }

    /// Build a context with the remote services configured in the
    /// environment. Services without configuration are left out and their
    /// stages skipped.
    pub fn from_env(db: Database) -> Result<Self> {
        let mut ctx = SyncContext::new(db);
        match HttpCloudClient::from_env()? {
            Some(cloud) => ctx = ctx.with_cloud(Arc::new(cloud)),
            None => log::info!("Cloud not configured"),
        }
        match HttpTrackerClient::from_env()? {
            Some(tracker) => ctx = ctx.with_tracker(Arc::new(tracker)),
            None => log::info!("Tracker not configured"),
        }
        Ok(Self::new(ctx))
    }

    pub fn context(&self) -> &SyncContext {
        self.coordinator.context()
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.context().db
    }

    pub fn queue(&self) -> JobQueue {
        JobQueue::new(self.db().clone())
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.context().progress.subscribe()
    }

    /// Flag observed by a running sync between loop iterations.
    pub fn cancellation(&self) -> CancellationFlag {
        self.context().cancel.clone()
    }

    // ── Sync commands ──────────────────────────────────────────────

    pub async fn sync(&self, options: &SyncOptions) -> Result<SyncReport> {
        self.context().cancel.reset();
        self.coordinator.run(options).await
    }

    /// Forget the cursors and merge flags of one service. The next sync
    /// merges with it from scratch.
    pub async fn reset_service(&self, service: Service) -> Result<()> {
        self.db()
            .writer()
            .call(move |conn| settings::reset_service(conn, service))
            .await?;
        Ok(())
    }

    pub async fn last_sync_run(&self) -> Result<Option<SyncRunSummary>> {
        let row = self
            .db()
            .reader()
            .call(|conn| repository::last_sync_run(conn))
            .await?;
        Ok(row.map(|(sync_type, status, completed_at, error)| SyncRunSummary {
            sync_type,
            status,
            completed_at,
            error,
        }))
    }

    // ── Config commands ────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        Ok(self
            .db()
            .reader()
            .call(move |conn| repository::get_config(conn, &key))
            .await?)
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.db()
            .writer()
            .call(move |conn| repository::set_config(conn, &key, &value))
            .await?;
        Ok(())
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        Ok(self
            .db()
            .reader()
            .call(|conn| repository::list_config(conn))
            .await?)
    }
}
