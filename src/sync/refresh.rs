//! Catalog refresh: creates shows the Cloud knows about and refreshes the
//! metadata of existing ones.

use chrono::Utc;

use crate::error::{Error, Result};
use crate::remote::{RemoteError, RemoteResult};
use crate::storage::repository;
use crate::sync::cloud::shows::ShowToAdd;
use crate::sync::SyncContext;

/// The refresh loop gives up after this many timeouts in a row.
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshScope {
    /// Shows not refreshed within the given age.
    Stale(chrono::Duration),
    All,
    Single(i64),
}

/// Counts timeouts in a row across catalog calls.
#[derive(Debug, Default)]
struct TimeoutGuard {
    consecutive: u32,
    failures: usize,
}

impl TimeoutGuard {
    /// Record one call. Returns `Ok(false)` once the loop has to stop.
    fn record<T>(&mut self, what: &str, result: RemoteResult<T>) -> Result<bool> {
        match result {
            Ok(_) => {
                self.consecutive = 0;
                Ok(true)
            }
            Err(RemoteError::Offline) => Err(Error::Offline),
            Err(e) if e.is_timeout() => {
                self.consecutive += 1;
                self.failures += 1;
                log::warn!(
                    "{what} timed out ({}/{MAX_CONSECUTIVE_TIMEOUTS})",
                    self.consecutive
                );
                Ok(self.consecutive < MAX_CONSECUTIVE_TIMEOUTS)
            }
            Err(e) => {
                self.consecutive = 0;
                self.failures += 1;
                log::warn!("{what} failed: {e}");
                Ok(true)
            }
        }
    }
}

pub struct ShowRefresher<'a> {
    ctx: &'a SyncContext,
}

impl<'a> ShowRefresher<'a> {
    pub fn new(ctx: &'a SyncContext) -> Self {
        Self { ctx }
    }

    /// Add shows, then refresh the ones in `scope`. Returns `Ok(false)` if
    /// any catalog call failed or the loop was aborted.
    pub async fn run(&self, to_add: Vec<ShowToAdd>, scope: RefreshScope) -> Result<bool> {
        let mut guard = TimeoutGuard::default();

        for show in to_add {
            self.ctx.check_continue()?;
            let what = format!("Adding show {}", show.tmdb_id);
            let result = self.ctx.catalog.add_show(show.tmdb_id, show.language).await;
            if !guard.record(&what, result)? {
                return Ok(self.aborted());
            }
        }

        let show_ids = self.show_ids(scope).await?;
        if !show_ids.is_empty() {
            log::info!("Refreshing {} shows", show_ids.len());
        }
        for show_id in show_ids {
            self.ctx.check_continue()?;
            let what = format!("Refreshing show {show_id}");
            let result = self.ctx.catalog.update_show(show_id).await;
            if !guard.record(&what, result)? {
                return Ok(self.aborted());
            }
        }

        if guard.failures > 0 {
            self.ctx
                .progress
                .set_important_error(format!("{} shows could not be refreshed", guard.failures));
            return Ok(false);
        }
        Ok(true)
    }

    fn aborted(&self) -> bool {
        log::warn!("Show refresh aborted after {MAX_CONSECUTIVE_TIMEOUTS} consecutive timeouts");
        self.ctx
            .progress
            .set_important_error("Show refresh aborted: the catalog keeps timing out");
        false
    }

    async fn show_ids(&self, scope: RefreshScope) -> Result<Vec<i64>> {
        let ids = match scope {
            RefreshScope::Single(show_id) => vec![show_id],
            RefreshScope::All => self
                .ctx
                .db
                .reader()
                .call(|conn| repository::list_shows(conn))
                .await?
                .into_iter()
                .map(|s| s.show_id)
                .collect(),
            RefreshScope::Stale(age) => {
                let cutoff = (Utc::now() - age).timestamp_millis();
                self.ctx
                    .db
                    .reader()
                    .call(move |conn| repository::show_ids_needing_update(conn, cutoff))
                    .await?
            }
        };
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::Database;
    use crate::testing::FakeCatalog;

    async fn seed_shows(db: &Database, count: i32) {
        db.writer()
            .call(move |conn| {
                for i in 0..count {
                    repository::insert_show(conn, Some(i + 1), "S", None)?;
                }
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    fn ctx_with(db: Database, catalog: Arc<FakeCatalog>) -> SyncContext {
        SyncContext::new(db).with_catalog(catalog)
    }

    #[tokio::test]
    async fn test_three_consecutive_timeouts_abort() {
        let db = Database::open_memory().await.unwrap();
        seed_shows(&db, 8).await;
        let catalog = Arc::new(FakeCatalog::default());
        catalog.script_updates(vec![
            Err(RemoteError::Timeout),
            Err(RemoteError::Timeout),
            Ok(()),
            Err(RemoteError::Timeout),
            Err(RemoteError::Timeout),
            Err(RemoteError::Timeout),
        ]);
        let ctx = ctx_with(db, catalog.clone());

        let ok = ShowRefresher::new(&ctx)
            .run(Vec::new(), RefreshScope::All)
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(catalog.update_calls(), 6);
        assert!(ctx.progress.snapshot().important_error.is_some());
    }

    #[tokio::test]
    async fn test_other_errors_reset_the_count() {
        let db = Database::open_memory().await.unwrap();
        seed_shows(&db, 5).await;
        let catalog = Arc::new(FakeCatalog::default());
        catalog.script_updates(vec![
            Err(RemoteError::Timeout),
            Err(RemoteError::Timeout),
            Err(RemoteError::NotFound("gone".into())),
            Err(RemoteError::Timeout),
            Err(RemoteError::Timeout),
        ]);
        let ctx = ctx_with(db, catalog.clone());

        let ok = ShowRefresher::new(&ctx)
            .run(Vec::new(), RefreshScope::All)
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(catalog.update_calls(), 5);
    }

    #[tokio::test]
    async fn test_adds_then_refreshes_single() {
        let db = Database::open_memory().await.unwrap();
        let catalog = Arc::new(FakeCatalog::default());
        let ctx = ctx_with(db, catalog.clone());

        let to_add = vec![
            ShowToAdd {
                tmdb_id: 1399,
                language: Some("de".into()),
            },
            ShowToAdd {
                tmdb_id: 1400,
                language: None,
            },
        ];
        let ok = ShowRefresher::new(&ctx)
            .run(to_add, RefreshScope::Single(7))
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(
            catalog.added(),
            vec![(1399, Some("de".to_string())), (1400, None)]
        );
        assert_eq!(catalog.update_calls(), 1);
    }

    #[tokio::test]
    async fn test_offline_is_fatal() {
        let db = Database::open_memory().await.unwrap();
        seed_shows(&db, 2).await;
        let catalog = Arc::new(FakeCatalog::default());
        catalog.script_updates(vec![Err(RemoteError::Offline)]);
        let ctx = ctx_with(db, catalog);

        let err = ShowRefresher::new(&ctx)
            .run(Vec::new(), RefreshScope::All)
            .await
            .unwrap_err();
        assert!(err.is_offline());
    }
}
