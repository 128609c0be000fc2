use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::progress::SyncProgress;
use crate::error::{Error, Result};
use crate::jobs::{LogNotifier, Notifier};
use crate::remote::{CloudClient, RemoteResult, TrackerClient};
use crate::storage::{repository, Database};

/// Source of show metadata. Adding a show creates its local rows; updating
/// refreshes them.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Returns the new local show id.
    async fn add_show(&self, tmdb_id: i32, language: Option<String>) -> RemoteResult<i64>;

    async fn update_show(&self, show_id: i64) -> RemoteResult<()>;
}

/// Catalog used when no metadata source is wired in: shows are created
/// without seasons and an update only bumps the freshness stamp.
pub struct PlaceholderCatalog {
    db: Database,
}

impl PlaceholderCatalog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Catalog for PlaceholderCatalog {
    async fn add_show(&self, tmdb_id: i32, language: Option<String>) -> RemoteResult<i64> {
        let now = chrono::Utc::now().timestamp_millis();
        self.db
            .writer()
            .call(move |conn| {
                if let Some(show) = repository::show_by_tmdb_id(conn, tmdb_id)? {
                    return Ok(show.show_id);
                }
                let show_id = repository::insert_show(conn, Some(tmdb_id), "", language.as_deref())?;
                repository::set_show_last_updated(conn, show_id, now)?;
                Ok::<i64, rusqlite::Error>(show_id)
            })
            .await
            .map_err(|e| crate::remote::RemoteError::Transport(e.to_string()))
    }

    async fn update_show(&self, show_id: i64) -> RemoteResult<()> {
        let now = chrono::Utc::now().timestamp_millis();
        self.db
            .writer()
            .call(move |conn| repository::set_show_last_updated(conn, show_id, now))
            .await
            .map_err(|e| crate::remote::RemoteError::Transport(e.to_string()))
    }
}

pub trait Connectivity: Send + Sync {
    fn is_connected(&self) -> bool;
}

pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_connected(&self) -> bool {
        true
    }
}

/// Cooperative cancellation shared between the caller and a running sync.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Everything one sync run needs. Services that are `None` are not
/// configured and their stages are skipped.
pub struct SyncContext {
    pub db: Database,
    pub cloud: Option<Arc<dyn CloudClient>>,
    pub tracker: Option<Arc<dyn TrackerClient>>,
    pub catalog: Arc<dyn Catalog>,
    pub connectivity: Arc<dyn Connectivity>,
    pub notifier: Arc<dyn Notifier>,
    pub progress: SyncProgress,
    pub cancel: CancellationFlag,
}

impl SyncContext {
    pub fn new(db: Database) -> Self {
        Self {
            catalog: Arc::new(PlaceholderCatalog::new(db.clone())),
            db,
            cloud: None,
            tracker: None,
            connectivity: Arc::new(AlwaysOnline),
            notifier: Arc::new(LogNotifier),
            progress: SyncProgress::new(),
            cancel: CancellationFlag::new(),
        }
    }

    pub fn with_cloud(mut self, cloud: Arc<dyn CloudClient>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn TrackerClient>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Checked between loop iterations.
    pub fn check_continue(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if !self.connectivity.is_connected() {
            return Err(Error::Offline);
        }
        Ok(())
    }
}
