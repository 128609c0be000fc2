//! Runs the sync stages in order and turns their outcome into a report.

use std::future::Future;

use crate::error::{Error, Result};
use crate::jobs::JobProcessor;
use crate::remote::tracker::LastActivity;
use crate::remote::{Service, TrackerClient};
use crate::storage::repository;
use crate::storage::settings::{self, MergeFlag};
use crate::sync::cloud::shows::ShowToAdd;
use crate::sync::cloud::{CloudEpisodeSync, ListReconciler, MovieReconciler, ShowReconciler};
use crate::sync::rate_limit::retry_remote;
use crate::sync::refresh::{RefreshScope, ShowRefresher};
use crate::sync::tracker::{TrackerEpisodeSync, TrackerMovieSync, TrackerRatingSync};
use crate::sync::{
    load_show_map, ShowMap, Stage, SyncContext, SyncOptions, SyncReport, SyncStatus, SyncType,
};

pub struct SyncCoordinator {
    ctx: SyncContext,
}

impl SyncCoordinator {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Run one sync. Only a failure to record the run itself is returned as
    /// an error; everything else ends up in the report.
    pub async fn run(&self, options: &SyncOptions) -> Result<SyncReport> {
        let sync_type = options.sync_type;
        self.ctx.progress.reset();
        let run_id = self
            .ctx
            .db
            .writer()
            .call(move |conn| repository::insert_sync_run(conn, sync_type.as_str()))
            .await?;
        log::info!("Starting {} sync", sync_type.as_str());

        let outcome = self.run_stages(options).await;
        self.ctx.progress.enter(Stage::Done);
        let snapshot = self.ctx.progress.snapshot();

        let (status, error) = match outcome {
            Ok(()) if snapshot.has_errors() => (SyncStatus::PartialFailure, None),
            Ok(()) => (SyncStatus::Success, None),
            Err(e @ (Error::Offline | Error::Cancelled)) => {
                (SyncStatus::Incomplete, Some(e.to_string()))
            }
            Err(e) if e.is_offline() => (SyncStatus::Incomplete, Some(e.to_string())),
            Err(e) => (SyncStatus::Failed, Some(e.to_string())),
        };
        match (&status, &error) {
            (SyncStatus::Success, _) => log::info!("Sync finished"),
            (_, Some(error)) => log::warn!("Sync {}: {error}", status.as_str()),
            (_, None) => log::warn!(
                "Sync finished with {} failed stages",
                snapshot.stage_errors.len()
            ),
        }

        let stage_errors = if snapshot.stage_errors.is_empty() {
            None
        } else {
            serde_json::to_string(&snapshot.stage_errors).ok()
        };
        let status_str = status.as_str();
        let error_message = error.clone();
        self.ctx
            .db
            .writer()
            .call(move |conn| {
                repository::finish_sync_run(
                    conn,
                    run_id,
                    status_str,
                    stage_errors.as_deref(),
                    error_message.as_deref(),
                )
            })
            .await?;

        Ok(SyncReport {
            sync_type,
            status,
            stage_errors: snapshot.stage_errors,
            error,
        })
    }

    async fn run_stages(&self, options: &SyncOptions) -> Result<()> {
        let jobs_sent = self
            .stage(Stage::Jobs, JobProcessor::new(&self.ctx).process())
            .await?;

        let scope = match options.sync_type {
            SyncType::Jobs => return Ok(()),
            SyncType::Single(show_id) => {
                self.stage(
                    Stage::Metadata,
                    ShowRefresher::new(&self.ctx).run(Vec::new(), RefreshScope::Single(show_id)),
                )
                .await?;
                return Ok(());
            }
            SyncType::Delta => RefreshScope::Stale(options.stale_after),
            SyncType::Full => RefreshScope::All,
        };

        // A download would overwrite local changes still waiting in the
        // queue, so remote state is only read once the queue is empty.
        let download = jobs_sent;
        if !download {
            log::warn!("Queued changes were not sent, skipping downloads");
        }

        let mut to_add: Vec<ShowToAdd> = Vec::new();
        if let Some(cloud) = self.ctx.cloud.clone().filter(|_| download) {
            let show_map = load_show_map(&self.ctx.db).await?;
            let cloud = cloud.as_ref();
            self.stage(
                Stage::CloudEpisodes,
                CloudEpisodeSync::new(&self.ctx, cloud).sync(&show_map),
            )
            .await?;
            self.stage(
                Stage::CloudShows,
                ShowReconciler::new(&self.ctx, cloud).sync(&show_map, &mut to_add),
            )
            .await?;
            self.stage(Stage::CloudMovies, MovieReconciler::new(&self.ctx, cloud).sync())
                .await?;
            self.stage(Stage::CloudLists, ListReconciler::new(&self.ctx, cloud).sync())
                .await?;
        }

        self.stage(Stage::Metadata, ShowRefresher::new(&self.ctx).run(to_add, scope))
            .await?;

        if let Some(tracker) = self.ctx.tracker.clone().filter(|_| download) {
            self.run_tracker(tracker.as_ref()).await?;
        }
        Ok(())
    }

    async fn run_tracker(&self, tracker: &dyn TrackerClient) -> Result<()> {
        self.ctx.progress.enter(Stage::Tracker);
        let activity = match retry_remote!(Service::Tracker, tracker.last_activity()) {
            Ok(activity) => activity,
            Err(e) => {
                self.fail_stage(e)?;
                log::warn!("Skipping the remaining tracker stages");
                return Ok(());
            }
        };

        // Shows may have been added by the metadata stage.
        let show_map = load_show_map(&self.ctx.db).await?;
        self.stage(
            Stage::TrackerEpisodes,
            self.tracker_episodes(tracker, &show_map, &activity),
        )
        .await?;
        self.stage(
            Stage::TrackerRatings,
            self.tracker_ratings(tracker, &show_map, &activity),
        )
        .await?;
        self.stage(Stage::TrackerMovies, self.tracker_movies(tracker, &activity))
            .await?;
        Ok(())
    }

    async fn tracker_episodes(
        &self,
        tracker: &dyn TrackerClient,
        show_map: &ShowMap,
        activity: &LastActivity,
    ) -> Result<bool> {
        let initial = !self
            .ctx
            .db
            .reader()
            .call(|conn| settings::is_merged(conn, MergeFlag::TrackerEpisodes))
            .await?;
        let sync = TrackerEpisodeSync::new(&self.ctx, tracker);
        let watched = sync
            .sync_watched(show_map, activity.episodes.watched_at, initial)
            .await?;
        let collected = sync
            .sync_collected(show_map, activity.episodes.collected_at, initial)
            .await?;
        let ok = watched && collected;
        if ok && initial {
            self.ctx
                .db
                .writer()
                .call(|conn| settings::set_merged(conn, MergeFlag::TrackerEpisodes, true))
                .await?;
            log::info!("Episodes merged with the tracker");
        }
        Ok(ok)
    }

    async fn tracker_ratings(
        &self,
        tracker: &dyn TrackerClient,
        show_map: &ShowMap,
        activity: &LastActivity,
    ) -> Result<bool> {
        let initial = !self
            .ctx
            .db
            .reader()
            .call(|conn| settings::is_merged(conn, MergeFlag::TrackerRatings))
            .await?;
        let ok = TrackerRatingSync::new(&self.ctx, tracker)
            .sync(show_map, activity, initial)
            .await?;
        if ok && initial {
            self.ctx
                .db
                .writer()
                .call(|conn| settings::set_merged(conn, MergeFlag::TrackerRatings, true))
                .await?;
            log::info!("Ratings merged with the tracker");
        }
        Ok(ok)
    }

    async fn tracker_movies(
        &self,
        tracker: &dyn TrackerClient,
        activity: &LastActivity,
    ) -> Result<bool> {
        let has_merged = self
            .ctx
            .db
            .reader()
            .call(|conn| settings::is_merged(conn, MergeFlag::TrackerMovies))
            .await?;
        let ok = TrackerMovieSync::new(&self.ctx, tracker)
            .sync_lists(&activity.movies, has_merged)
            .await?;
        if ok && !has_merged {
            self.ctx
                .db
                .writer()
                .call(|conn| settings::set_merged(conn, MergeFlag::TrackerMovies, true))
                .await?;
            log::info!("Movies merged with the tracker");
        }
        Ok(ok)
    }

    /// Publish `stage`, run it and record a failure. Run-fatal errors are
    /// returned; anything else lets the next stage run. Yields whether the
    /// stage completed.
    async fn stage<F>(&self, stage: Stage, work: F) -> Result<bool>
    where
        F: Future<Output = Result<bool>>,
    {
        self.ctx.progress.enter(stage);
        match work.await {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.ctx.progress.record_error(format!("{stage} did not complete"));
                Ok(false)
            }
            Err(e) => self.fail_stage(e).map(|()| false),
        }
    }

    fn fail_stage(&self, e: Error) -> Result<()> {
        self.ctx.progress.record_error(e.to_string());
        self.ctx.progress.set_important_error(e.to_string());
        if e.is_fatal_to_run() {
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Utc};

    use super::*;
    use crate::remote::cloud::{CloudEpisode, CloudList, CloudMovie, CloudShow};
    use crate::remote::tracker::{
        EpisodeActivity, MovieSnapshot, ShowSnapshot, TrackerEpisode, TrackerIds,
        TrackerMovieEntry, TrackerMovieRef, TrackerSeason, TrackerShowEntry, TrackerShowRef,
    };
    use crate::remote::RemoteError;
    use crate::jobs::{actions, JobQueue};
    use crate::storage::models::{List, Movie, WatchedState};
    use crate::storage::settings::Cursor;
    use crate::storage::Database;
    use crate::sync::Connectivity;
    use crate::testing::{FakeCatalog, FakeCloud, FakeTracker};

    fn t1() -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(1_700_000_000_000)
    }

    async fn seed_library(db: &Database) {
        db.writer()
            .call(|conn| {
                let show_id = repository::insert_show(conn, Some(1399), "S", None)?;
                let season_id = repository::insert_season(conn, show_id, 1)?;
                for n in 1..=3 {
                    let id = repository::insert_episode(conn, show_id, season_id, 1, n, "")?;
                    if n == 1 {
                        repository::set_episode_watched(conn, id, WatchedState::Watched, 1)?;
                    }
                }
                repository::upsert_movie(
                    conn,
                    &Movie {
                        tmdb_id: 603,
                        in_collection: true,
                        ..Default::default()
                    },
                )?;
                repository::insert_list(
                    conn,
                    &List {
                        list_id: "l1".into(),
                        name: "L1".into(),
                        sort_order: 0,
                    },
                )?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    fn cloud_with_library() -> Arc<FakeCloud> {
        let cloud = Arc::new(FakeCloud::default());
        cloud.set_episodes(vec![CloudEpisode {
            show_tmdb_id: 1399,
            season_number: 1,
            episode_number: 1,
            watched_flag: Some(1),
            plays: Some(1),
            updated_at: t1(),
            ..Default::default()
        }]);
        cloud.set_shows(vec![CloudShow {
            tmdb_id: 1399,
            is_favorite: Some(true),
            updated_at: t1(),
            ..Default::default()
        }]);
        cloud.set_movies(vec![CloudMovie {
            tmdb_id: 603,
            is_in_collection: Some(true),
            updated_at: t1(),
            ..Default::default()
        }]);
        cloud.set_lists(vec![CloudList {
            list_id: "l1".into(),
            name: "L1".into(),
            order: Some(0),
            items: Vec::new(),
        }]);
        cloud
    }

    fn tracker_with_library() -> Arc<FakeTracker> {
        let tracker = Arc::new(FakeTracker::default());
        tracker.set_last_activity(LastActivity {
            episodes: EpisodeActivity {
                watched_at: t1(),
                ..Default::default()
            },
            ..Default::default()
        });
        tracker.set_shows(
            ShowSnapshot::Watched,
            vec![TrackerShowEntry {
                show: TrackerShowRef {
                    title: Some("S".into()),
                    ids: TrackerIds::tmdb(1399),
                },
                seasons: vec![TrackerSeason {
                    number: 1,
                    episodes: vec![TrackerEpisode {
                        number: 1,
                        plays: Some(1),
                    }],
                }],
            }],
        );
        tracker.set_movies(
            MovieSnapshot::Collection,
            vec![TrackerMovieEntry {
                movie: TrackerMovieRef {
                    title: None,
                    ids: TrackerIds::tmdb(603),
                },
                plays: None,
            }],
        );
        tracker
    }

    async fn total_changes(db: &Database) -> u64 {
        db.writer()
            .call(|conn| Ok::<_, rusqlite::Error>(conn.total_changes()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_second_delta_sync_changes_nothing() {
        let db = Database::open_memory().await.unwrap();
        seed_library(&db).await;
        let ctx = SyncContext::new(db.clone())
            .with_cloud(cloud_with_library())
            .with_tracker(tracker_with_library())
            .with_catalog(Arc::new(FakeCatalog::default()));
        let coordinator = SyncCoordinator::new(ctx);
        let options = SyncOptions::default();

        let first = coordinator.run(&options).await.unwrap();
        assert_eq!(first.status, SyncStatus::Success, "{:?}", first.stage_errors);

        let merged = db
            .reader()
            .call(|conn| settings::is_merged(conn, MergeFlag::TrackerRatings))
            .await
            .unwrap();
        assert!(merged);

        let before = total_changes(&db).await;
        let second = coordinator.run(&options).await.unwrap();
        assert!(second.is_success());
        // Only the run log itself is written.
        assert_eq!(total_changes(&db).await - before, 2);

        let show = db
            .reader()
            .call(|conn| repository::show_by_tmdb_id(conn, 1399))
            .await
            .unwrap()
            .unwrap();
        assert!(show.favorite);
    }

    #[tokio::test]
    async fn test_unauthorized_fails_the_run() {
        let db = Database::open_memory().await.unwrap();
        let cloud = Arc::new(FakeCloud::default());
        cloud.fail_reads(RemoteError::Unauthorized);
        let tracker = tracker_with_library();
        let ctx = SyncContext::new(db.clone())
            .with_cloud(cloud)
            .with_tracker(tracker.clone());

        let report = SyncCoordinator::new(ctx)
            .run(&SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(report.status, SyncStatus::Failed);
        assert_eq!(report.stage_errors.len(), 1);
        assert_eq!(report.stage_errors[0].stage, Some(Stage::CloudEpisodes));
        assert_eq!(tracker.show_fetches(), 0);

        let (sync_type, status, _, error) = db
            .reader()
            .call(|conn| repository::last_sync_run(conn))
            .await
            .unwrap()
            .unwrap();
        assert_eq!((sync_type.as_str(), status.as_str()), ("delta", "failed"));
        assert!(error.is_some());
    }

    struct Offline;

    impl Connectivity for Offline {
        fn is_connected(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_lost_connectivity_is_incomplete() {
        let db = Database::open_memory().await.unwrap();
        let ctx = SyncContext::new(db)
            .with_cloud(cloud_with_library())
            .with_connectivity(Arc::new(Offline));

        let report = SyncCoordinator::new(ctx)
            .run(&SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(report.status, SyncStatus::Incomplete);
    }

    #[tokio::test]
    async fn test_activity_failure_skips_tracker_stages() {
        let db = Database::open_memory().await.unwrap();
        seed_library(&db).await;
        let tracker = tracker_with_library();
        tracker.fail_reads(RemoteError::Server {
            status: 503,
            message: "maintenance".into(),
        });
        let ctx = SyncContext::new(db)
            .with_tracker(tracker.clone())
            .with_catalog(Arc::new(FakeCatalog::default()));
        let coordinator = SyncCoordinator::new(ctx);

        let report = coordinator.run(&SyncOptions::default()).await.unwrap();
        assert_eq!(report.status, SyncStatus::PartialFailure);
        assert_eq!(report.stage_errors.len(), 1);
        assert_eq!(report.stage_errors[0].stage, Some(Stage::Tracker));
        assert_eq!(tracker.show_fetches(), 0);
        assert_eq!(coordinator.context().progress.snapshot().stage, Stage::Done);
    }

    #[tokio::test]
    async fn test_jobs_sync_runs_only_jobs() {
        let db = Database::open_memory().await.unwrap();
        let cloud = cloud_with_library();
        let catalog = Arc::new(FakeCatalog::default());
        let ctx = SyncContext::new(db)
            .with_cloud(cloud.clone())
            .with_catalog(catalog.clone());

        let report = SyncCoordinator::new(ctx)
            .run(&SyncOptions::new(SyncType::Jobs))
            .await
            .unwrap();
        assert!(report.is_success());
        assert!(cloud.saved_shows().is_empty());
        assert_eq!(catalog.update_calls(), 0);
    }

    #[tokio::test]
    async fn test_unsent_jobs_block_downloads() {
        let db = Database::open_memory().await.unwrap();
        seed_library(&db).await;
        let episode_id = db
            .writer()
            .call(|conn| {
                settings::set_merged(conn, MergeFlag::TrackerEpisodes, true)?;
                settings::advance_cursor(
                    conn,
                    Cursor::TrackerEpisodesWatched,
                    DateTime::from_timestamp_millis(1_000).unwrap(),
                )?;
                let show = repository::show_by_tmdb_id(conn, 1399)?.unwrap();
                let episodes = repository::episodes_for_show(conn, show.show_id)?;
                Ok::<i64, rusqlite::Error>(episodes[1].episode_id)
            })
            .await
            .unwrap();
        actions::set_episode_watched(&db, episode_id, WatchedState::Watched)
            .await
            .unwrap();

        // The tracker has newer activity but does not know the change yet.
        let tracker = Arc::new(FakeTracker::default());
        tracker.set_last_activity(LastActivity {
            episodes: EpisodeActivity {
                watched_at: t1(),
                ..Default::default()
            },
            ..Default::default()
        });
        tracker.fail_posts(RemoteError::Timeout);
        let ctx = SyncContext::new(db.clone())
            .with_tracker(tracker.clone())
            .with_catalog(Arc::new(FakeCatalog::default()));
        let coordinator = SyncCoordinator::new(ctx);

        let report = coordinator.run(&SyncOptions::default()).await.unwrap();
        assert_eq!(report.status, SyncStatus::PartialFailure);
        assert_eq!(report.stage_errors.len(), 1);
        assert_eq!(report.stage_errors[0].stage, Some(Stage::Jobs));
        assert_eq!(tracker.show_fetches(), 0);
        assert_eq!(JobQueue::new(db.clone()).len().await.unwrap(), 1);

        let episode = db
            .reader()
            .call(move |conn| repository::get_episode(conn, episode_id))
            .await
            .unwrap()
            .unwrap();
        assert!(episode.is_watched());
    }
}
