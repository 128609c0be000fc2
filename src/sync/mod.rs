pub mod cloud;
pub mod context;
pub mod coordinator;
pub mod progress;
pub mod rate_limit;
pub mod refresh;
pub mod tracker;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::storage::settings::{self, Cursor};
use crate::storage::{repository, BatchOp, Database};

pub use context::{AlwaysOnline, CancellationFlag, Catalog, Connectivity, PlaceholderCatalog, SyncContext};
pub use coordinator::SyncCoordinator;
pub use progress::{ProgressSnapshot, Stage, StageError, SyncProgress};

/// Catalog id → local show id of every show the remotes can address.
pub type ShowMap = HashMap<i32, i64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncType {
    /// Send queued jobs only.
    Jobs,
    /// Send queued jobs, then refresh one show from the catalog.
    Single(i64),
    /// All stages; stale shows are refreshed.
    Delta,
    /// All stages; every show is refreshed.
    Full,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Jobs => "jobs",
            SyncType::Single(_) => "single",
            SyncType::Delta => "delta",
            SyncType::Full => "full",
        }
    }
}

/// Options controlling a sync operation.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub sync_type: SyncType,
    /// Shows whose catalog data is older than this are refreshed by a
    /// delta sync.
    pub stale_after: chrono::Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            sync_type: SyncType::Delta,
            stale_after: chrono::Duration::days(7),
        }
    }
}

impl SyncOptions {
    pub fn new(sync_type: SyncType) -> Self {
        Self {
            sync_type,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SyncStatus {
    Success,
    /// Some stage failed; the others ran.
    PartialFailure,
    /// Halted by lost connectivity or cancellation. Safe to retry.
    Incomplete,
    /// Halted by a credential failure.
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::PartialFailure => "partial_failure",
            SyncStatus::Incomplete => "incomplete",
            SyncStatus::Failed => "failed",
        }
    }
}

/// Report returned after a sync run completes.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub sync_type: SyncType,
    pub status: SyncStatus,
    pub stage_errors: Vec<StageError>,
    pub error: Option<String>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.status == SyncStatus::Success
    }
}

/// End a family on a failure that does not end the run. Run-fatal errors
/// are passed through.
pub(crate) fn family_failed(ctx: &SyncContext, family: &str, e: Error) -> Result<bool> {
    if e.is_fatal_to_run() {
        return Err(e);
    }
    log::warn!("{family} sync failed: {e}");
    ctx.progress.set_important_error(format!("{family}: {e}"));
    Ok(false)
}

/// Snapshot of the show map. Reload it after shows may have been added.
pub async fn load_show_map(db: &Database) -> Result<ShowMap> {
    Ok(db.reader().call(|conn| repository::tmdb_id_map(conn)).await?)
}

/// Apply reconciler output, logging how much actually changed.
pub(crate) async fn apply_ops(db: &Database, family: &str, ops: Vec<BatchOp>) -> Result<usize> {
    if ops.is_empty() {
        return Ok(0);
    }
    let count = ops.len();
    let changed = db.apply_batch(ops).await?;
    log::info!("{family}: {count} updates, {changed} rows changed");
    Ok(changed)
}

pub(crate) async fn read_cursor(db: &Database, cursor: Cursor) -> Result<Option<DateTime<Utc>>> {
    Ok(db
        .reader()
        .call(move |conn| settings::get_cursor(conn, cursor))
        .await?)
}

/// Move a cursor forward. Only call this once everything up to
/// `changed_at` has been applied locally.
pub(crate) async fn store_cursor(
    db: &Database,
    cursor: Cursor,
    changed_at: Option<DateTime<Utc>>,
) -> Result<()> {
    if let Some(changed_at) = changed_at {
        db.writer()
            .call(move |conn| settings::advance_cursor(conn, cursor, changed_at))
            .await?;
    }
    Ok(())
}
