use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::remote::cloud::{CloudShow, MAX_BATCH_SIZE};
use crate::remote::{CloudClient, Service};
use crate::storage::batch::ShowChanges;
use crate::storage::models::Show;
use crate::storage::settings::{self, Cursor, MergeFlag};
use crate::storage::{repository, BatchOp};
use crate::sync::rate_limit::retry_remote;
use crate::sync::{apply_ops, family_failed, read_cursor, store_cursor, ShowMap, SyncContext};

const FAMILY: &str = "Cloud shows";

/// A show the Cloud knows and the library does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShowToAdd {
    pub tmdb_id: i32,
    pub language: Option<String>,
}

pub struct ShowReconciler<'a> {
    ctx: &'a SyncContext,
    cloud: &'a dyn CloudClient,
}

impl<'a> ShowReconciler<'a> {
    pub fn new(ctx: &'a SyncContext, cloud: &'a dyn CloudClient) -> Self {
        Self { ctx, cloud }
    }

    /// Download, and on the first merge upload everything afterwards.
    pub async fn sync(&self, show_map: &ShowMap, to_add: &mut Vec<ShowToAdd>) -> Result<bool> {
        let has_merged = self
            .ctx
            .db
            .reader()
            .call(|conn| settings::is_merged(conn, MergeFlag::CloudShows))
            .await?;

        if !self.download(show_map, to_add, has_merged).await? {
            return Ok(false);
        }
        if has_merged {
            return Ok(true);
        }
        if !self.upload_all().await? {
            return Ok(false);
        }
        self.ctx
            .db
            .writer()
            .call(|conn| settings::set_merged(conn, MergeFlag::CloudShows, true))
            .await?;
        log::info!("Shows merged with the Cloud");
        Ok(true)
    }

    /// Apply show changes since the cursor. Shows missing locally are
    /// appended to `to_add` unless the Cloud marks them removed. The cursor
    /// moves only after the last page.
    pub async fn download(
        &self,
        show_map: &ShowMap,
        to_add: &mut Vec<ShowToAdd>,
        has_merged: bool,
    ) -> Result<bool> {
        let since = read_cursor(&self.ctx.db, Cursor::CloudShows).await?;
        let mut queued: HashSet<i32> = to_add.iter().map(|s| s.tmdb_id).collect();

        let mut newest: Option<DateTime<Utc>> = None;
        let mut page_cursor: Option<String> = None;
        loop {
            self.ctx.check_continue()?;
            let page = match retry_remote!(
                Service::Cloud,
                self.cloud.shows_changed(since, page_cursor.clone())
            ) {
                Ok(page) => page,
                Err(e) => return family_failed(self.ctx, FAMILY, e),
            };

            let known: Vec<(CloudShow, i64)> = page
                .items
                .iter()
                .filter_map(|remote| {
                    show_map
                        .get(&remote.tmdb_id)
                        .map(|&show_id| (remote.clone(), show_id))
                })
                .collect();
            let locals = self.load_shows(known.iter().map(|(_, id)| *id).collect()).await?;

            let mut ops = Vec::new();
            for remote in &page.items {
                newest = newest.max(remote.updated_at);
                if show_map.contains_key(&remote.tmdb_id) {
                    continue;
                }
                if remote.is_removed != Some(true) && queued.insert(remote.tmdb_id) {
                    to_add.push(ShowToAdd {
                        tmdb_id: remote.tmdb_id,
                        language: remote.language.clone(),
                    });
                }
            }
            for (remote, show_id) in &known {
                let Some(local) = locals.iter().find(|s| s.show_id == *show_id) else {
                    continue;
                };
                let changes = show_changes(local, remote, has_merged);
                if !changes.is_empty() {
                    ops.push(BatchOp::UpdateShow {
                        show_id: *show_id,
                        changes,
                    });
                }
            }

            apply_ops(&self.ctx.db, FAMILY, ops).await?;

            match page.next_cursor {
                Some(next) => page_cursor = Some(next),
                None => break,
            }
        }
        store_cursor(&self.ctx.db, Cursor::CloudShows, newest).await?;
        Ok(true)
    }

    /// Send every mappable local show.
    pub async fn upload_all(&self) -> Result<bool> {
        let shows = self
            .ctx
            .db
            .reader()
            .call(|conn| repository::list_shows(conn))
            .await?;
        let payload: Vec<CloudShow> = shows
            .iter()
            .filter_map(|show| {
                Some(CloudShow {
                    tmdb_id: show.tmdb_id?,
                    is_favorite: Some(show.favorite),
                    notify: Some(show.notify),
                    is_hidden: Some(show.hidden),
                    language: show.language.clone(),
                    is_removed: None,
                    updated_at: None,
                })
            })
            .collect();

        for chunk in payload.chunks(MAX_BATCH_SIZE) {
            self.ctx.check_continue()?;
            if let Err(e) = retry_remote!(Service::Cloud, self.cloud.save_shows(chunk.to_vec())) {
                return family_failed(self.ctx, FAMILY, e);
            }
        }
        log::info!("Uploaded {} shows to the Cloud", payload.len());
        Ok(true)
    }

    async fn load_shows(&self, ids: Vec<i64>) -> Result<Vec<Show>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .ctx
            .db
            .reader()
            .call(move |conn| {
                let mut shows = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(show) = repository::get_show(conn, id)? {
                        shows.push(show);
                    }
                }
                Ok::<_, rusqlite::Error>(shows)
            })
            .await?)
    }
}

/// Field rules: on the first merge favorite and notify can only be turned
/// on and hidden can only be turned off; afterwards all three mirror the
/// Cloud. Language is always taken from the Cloud.
pub fn show_changes(local: &Show, remote: &CloudShow, has_merged: bool) -> ShowChanges {
    let mut changes = ShowChanges::default();

    let turn_on_or_mirror = |local: bool, remote: Option<bool>| -> Option<bool> {
        match remote {
            Some(value) if value != local && (has_merged || value) => Some(value),
            _ => None,
        }
    };
    changes.favorite = turn_on_or_mirror(local.favorite, remote.is_favorite);
    changes.notify = turn_on_or_mirror(local.notify, remote.notify);
    changes.hidden = match remote.is_hidden {
        Some(value) if value != local.hidden && (has_merged || !value) => Some(value),
        _ => None,
    };
    if let Some(language) = &remote.language {
        if local.language.as_ref() != Some(language) {
            changes.language = Some(language.clone());
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::Database;
    use crate::sync::load_show_map;
    use crate::testing::FakeCloud;

    fn local_show() -> Show {
        Show {
            show_id: 1,
            tmdb_id: Some(1399),
            title: "S".into(),
            favorite: true,
            notify: false,
            hidden: true,
            language: Some("en".into()),
            last_updated_ms: 0,
            last_watched_ms: 0,
            rating: 0,
            cloud_merged: false,
        }
    }

    fn remote_show() -> CloudShow {
        CloudShow {
            tmdb_id: 1399,
            is_favorite: Some(false),
            notify: Some(true),
            is_hidden: Some(false),
            language: Some("de".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_initial_merge_keeps_favorite() {
        let changes = show_changes(&local_show(), &remote_show(), false);
        assert_eq!(changes.favorite, None);
        assert_eq!(changes.notify, Some(true));
        assert_eq!(changes.hidden, Some(false));
        assert_eq!(changes.language.as_deref(), Some("de"));
    }

    #[test]
    fn test_steady_state_mirrors_favorite() {
        let changes = show_changes(&local_show(), &remote_show(), true);
        assert_eq!(changes.favorite, Some(false));
    }

    #[test]
    fn test_initial_merge_never_hides() {
        let mut local = local_show();
        local.hidden = false;
        let mut remote = remote_show();
        remote.is_hidden = Some(true);
        assert_eq!(show_changes(&local, &remote, false).hidden, None);
        assert_eq!(show_changes(&local, &remote, true).hidden, Some(true));
    }

    #[tokio::test]
    async fn test_favorite_asymmetry_end_to_end() {
        let db = Database::open_memory().await.unwrap();
        let show_id = db
            .writer()
            .call(|conn| {
                let id = repository::insert_show(conn, Some(1399), "S", None)?;
                repository::set_show_flags(conn, id, Some(true), None, None)?;
                Ok::<i64, rusqlite::Error>(id)
            })
            .await
            .unwrap();

        let cloud = Arc::new(FakeCloud::default());
        cloud.set_shows(vec![CloudShow {
            tmdb_id: 1399,
            is_favorite: Some(false),
            ..Default::default()
        }]);
        let ctx = SyncContext::new(db.clone()).with_cloud(cloud.clone());
        let map = load_show_map(&db).await.unwrap();
        let reconciler = ShowReconciler::new(&ctx, cloud.as_ref());

        let mut to_add = Vec::new();
        assert!(reconciler.sync(&map, &mut to_add).await.unwrap());
        let favorite = |db: Database| async move {
            db.reader()
                .call(move |conn| repository::get_show(conn, show_id))
                .await
                .unwrap()
                .unwrap()
                .favorite
        };
        assert!(favorite(db.clone()).await);
        // The first merge uploaded the local state.
        assert_eq!(cloud.saved_shows()[0].is_favorite, Some(true));

        // Steady state: the remote value wins.
        db.writer()
            .call(|conn| repository::delete_config(conn, Cursor::CloudShows.key()))
            .await
            .unwrap();
        assert!(reconciler.sync(&map, &mut to_add).await.unwrap());
        assert!(!favorite(db.clone()).await);
    }

    #[tokio::test]
    async fn test_unknown_shows_are_collected_once() {
        let db = Database::open_memory().await.unwrap();
        let cloud = Arc::new(FakeCloud::default());
        cloud.set_shows(vec![
            CloudShow {
                tmdb_id: 1,
                language: Some("fr".into()),
                ..Default::default()
            },
            CloudShow {
                tmdb_id: 2,
                is_removed: Some(true),
                ..Default::default()
            },
        ]);
        let ctx = SyncContext::new(db).with_cloud(cloud.clone());

        let mut to_add = vec![ShowToAdd {
            tmdb_id: 1,
            language: None,
        }];
        let ok = ShowReconciler::new(&ctx, cloud.as_ref())
            .download(&ShowMap::new(), &mut to_add, true)
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(to_add.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_page_keeps_cursor_until_all_pages_read() {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| {
                repository::insert_show(conn, Some(1399), "S", None)?;
                repository::insert_show(conn, Some(1400), "T", None)?;
                settings::set_merged(conn, MergeFlag::CloudShows, true)
            })
            .await
            .unwrap();

        let cloud = Arc::new(FakeCloud::default());
        cloud.set_page_size(1);
        cloud.set_shows(vec![
            CloudShow {
                tmdb_id: 1399,
                is_favorite: Some(true),
                updated_at: DateTime::from_timestamp_millis(2000),
                ..Default::default()
            },
            CloudShow {
                tmdb_id: 1400,
                is_favorite: Some(true),
                updated_at: DateTime::from_timestamp_millis(1000),
                ..Default::default()
            },
        ]);
        cloud.fail_read_after(1, crate::remote::RemoteError::Timeout);
        let ctx = SyncContext::new(db.clone()).with_cloud(cloud.clone());
        let map = load_show_map(&db).await.unwrap();
        let reconciler = ShowReconciler::new(&ctx, cloud.as_ref());
        let cursor = |db: Database| async move {
            db.reader()
                .call(|conn| settings::get_cursor(conn, Cursor::CloudShows))
                .await
                .unwrap()
        };
        let favorites = |db: Database| async move {
            let mut ids: Vec<i32> = db
                .reader()
                .call(|conn| repository::list_shows(conn))
                .await
                .unwrap()
                .into_iter()
                .filter(|s| s.favorite)
                .filter_map(|s| s.tmdb_id)
                .collect();
            ids.sort_unstable();
            ids
        };

        let mut to_add = Vec::new();
        assert!(!reconciler.sync(&map, &mut to_add).await.unwrap());
        assert_eq!(favorites(db.clone()).await, vec![1399]);
        assert_eq!(cursor(db.clone()).await, None);

        cloud.restore_reads();
        assert!(reconciler.sync(&map, &mut to_add).await.unwrap());
        assert_eq!(favorites(db.clone()).await, vec![1399, 1400]);
        assert_eq!(cursor(db.clone()).await, DateTime::from_timestamp_millis(2000));
    }
}
