use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::remote::tracker::{
    ShowSnapshot, SyncEndpoint, SyncEpisode, SyncItems, SyncSeason, SyncShow, TrackerIds,
    TrackerShowEntry,
};
use crate::remote::{Service, TrackerClient};
use crate::storage::models::{Episode, WatchedState};
use crate::storage::settings::Cursor;
use crate::storage::{repository, BatchOp};
use crate::sync::rate_limit::retry_remote;
use crate::sync::{apply_ops, family_failed, read_cursor, store_cursor, ShowMap, SyncContext};

use super::{needs_fetch, send};

/// (season, episode) → plays of one remote show.
type RemoteEpisodes = HashMap<(i32, i32), i32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Watched,
    Collected,
}

impl Family {
    fn name(&self) -> &'static str {
        match self {
            Family::Watched => "Tracker watched episodes",
            Family::Collected => "Tracker collected episodes",
        }
    }

    fn snapshot(&self) -> ShowSnapshot {
        match self {
            Family::Watched => ShowSnapshot::Watched,
            Family::Collected => ShowSnapshot::Collected,
        }
    }

    fn cursor(&self) -> Cursor {
        match self {
            Family::Watched => Cursor::TrackerEpisodesWatched,
            Family::Collected => Cursor::TrackerEpisodesCollected,
        }
    }

    fn endpoint(&self) -> SyncEndpoint {
        match self {
            Family::Watched => SyncEndpoint::HistoryAdd,
            Family::Collected => SyncEndpoint::CollectionAdd,
        }
    }
}

/// Local writes and tracker uploads for one show.
#[derive(Debug, Default, PartialEq, Eq)]
struct ShowPlan {
    ops: Vec<BatchOp>,
    upload: BTreeMap<i32, Vec<SyncEpisode>>,
}

impl ShowPlan {
    fn upload_episode(&mut self, episode: &Episode, entries: i32) {
        let season = self.upload.entry(episode.season_number).or_default();
        for _ in 0..entries {
            season.push(SyncEpisode {
                number: episode.number,
                ..Default::default()
            });
        }
    }

    fn upload_seasons(&mut self) -> Vec<SyncSeason> {
        std::mem::take(&mut self.upload)
            .into_iter()
            .map(|(number, episodes)| SyncSeason { number, episodes })
            .collect()
    }
}

pub struct TrackerEpisodeSync<'a> {
    ctx: &'a SyncContext,
    tracker: &'a dyn TrackerClient,
}

impl<'a> TrackerEpisodeSync<'a> {
    pub fn new(ctx: &'a SyncContext, tracker: &'a dyn TrackerClient) -> Self {
        Self { ctx, tracker }
    }

    pub async fn sync_watched(
        &self,
        show_map: &ShowMap,
        remote_changed_at: Option<DateTime<Utc>>,
        is_initial_merge: bool,
    ) -> Result<bool> {
        self.sync_family(Family::Watched, show_map, remote_changed_at, is_initial_merge)
            .await
    }

    pub async fn sync_collected(
        &self,
        show_map: &ShowMap,
        remote_changed_at: Option<DateTime<Utc>>,
        is_initial_merge: bool,
    ) -> Result<bool> {
        self.sync_family(Family::Collected, show_map, remote_changed_at, is_initial_merge)
            .await
    }

    async fn sync_family(
        &self,
        family: Family,
        show_map: &ShowMap,
        remote_changed_at: Option<DateTime<Utc>>,
        is_initial_merge: bool,
    ) -> Result<bool> {
        let cursor = read_cursor(&self.ctx.db, family.cursor()).await?;
        if !needs_fetch(cursor, remote_changed_at, is_initial_merge) {
            log::debug!("{}: no remote changes", family.name());
            return Ok(true);
        }

        self.ctx.check_continue()?;
        let snapshot = match retry_remote!(Service::Tracker, self.tracker.shows(family.snapshot()))
        {
            Ok(snapshot) => snapshot,
            Err(e) => return family_failed(self.ctx, family.name(), e),
        };
        let remote = index_snapshot(snapshot);

        let mut shows: Vec<(i32, i64)> = show_map.iter().map(|(&t, &s)| (t, s)).collect();
        shows.sort_unstable();

        let mut ops = Vec::new();
        let mut uploads = Vec::new();
        for (tmdb_id, show_id) in shows {
            self.ctx.check_continue()?;
            let episodes = self
                .ctx
                .db
                .reader()
                .call(move |conn| repository::episodes_for_show(conn, show_id))
                .await?;
            if episodes.is_empty() {
                continue;
            }
            let remote_show = remote.get(&tmdb_id);
            let mut plan = match family {
                Family::Watched => plan_watched(show_id, &episodes, remote_show, is_initial_merge),
                Family::Collected => {
                    plan_collected(show_id, &episodes, remote_show, is_initial_merge)
                }
            };
            ops.append(&mut plan.ops);
            let seasons = plan.upload_seasons();
            if !seasons.is_empty() {
                uploads.push(SyncShow {
                    ids: TrackerIds::tmdb(tmdb_id),
                    rating: None,
                    seasons,
                });
            }
        }

        apply_ops(&self.ctx.db, family.name(), ops).await?;

        for show in uploads {
            self.ctx.check_continue()?;
            let items = SyncItems {
                shows: vec![show],
                movies: Vec::new(),
            };
            log::debug!("Uploading {} episode entries", items.episode_count());
            if let Err(e) = send(self.tracker, family.endpoint(), items).await {
                return family_failed(self.ctx, family.name(), e);
            }
        }

        store_cursor(&self.ctx.db, family.cursor(), remote_changed_at).await?;
        Ok(true)
    }
}

fn index_snapshot(snapshot: Vec<TrackerShowEntry>) -> HashMap<i32, RemoteEpisodes> {
    let mut index = HashMap::new();
    for entry in snapshot {
        let Some(tmdb_id) = entry.show.ids.tmdb else {
            continue;
        };
        let episodes: &mut RemoteEpisodes = index.entry(tmdb_id).or_default();
        for season in entry.seasons {
            for episode in season.episodes {
                let plays = episode.plays.unwrap_or(1).max(1);
                episodes.insert((season.number, episode.number), plays);
            }
        }
    }
    index
}

/// Episodes of a show grouped by season, in season order.
fn by_season(episodes: &[Episode]) -> BTreeMap<(i32, i64), Vec<&Episode>> {
    let mut seasons: BTreeMap<(i32, i64), Vec<&Episode>> = BTreeMap::new();
    for episode in episodes {
        seasons
            .entry((episode.season_number, episode.season_id))
            .or_default()
            .push(episode);
    }
    seasons
}

fn plan_watched(
    show_id: i64,
    episodes: &[Episode],
    remote: Option<&RemoteEpisodes>,
    is_initial_merge: bool,
) -> ShowPlan {
    let mut plan = ShowPlan::default();

    let Some(remote) = remote else {
        if is_initial_merge {
            for episode in episodes.iter().filter(|e| e.is_watched()) {
                plan.upload_episode(episode, episode.plays.max(1));
            }
        } else if episodes.iter().any(|e| e.is_watched()) {
            plan.ops.push(BatchOp::ClearShowWatched { show_id });
        }
        return plan;
    };

    for ((_, season_id), season) in by_season(episodes) {
        // (episode, watched, plays) after reconciling.
        let mut targets = Vec::with_capacity(season.len());
        for episode in season {
            let local_plays = if episode.is_watched() { episode.plays.max(1) } else { 0 };
            let target = match remote.get(&(episode.season_number, episode.number)) {
                Some(&remote_plays) if is_initial_merge && local_plays > remote_plays => {
                    plan.upload_episode(episode, local_plays - remote_plays);
                    (true, local_plays)
                }
                Some(&remote_plays) => (true, remote_plays),
                None if episode.is_watched() && is_initial_merge => {
                    plan.upload_episode(episode, local_plays);
                    (true, local_plays)
                }
                None => (false, 0),
            };
            targets.push((episode, target.0, target.1));
        }

        let changed = |&(episode, watched, plays): &(&Episode, bool, i32)| {
            episode.is_watched() != watched || (watched && episode.plays != plays)
        };
        if !targets.iter().any(changed) {
            continue;
        }

        let first_plays = targets[0].2;
        if targets.iter().all(|&(_, watched, plays)| watched && plays == first_plays) {
            plan.ops.push(BatchOp::SetSeasonWatched {
                season_id,
                plays: first_plays,
            });
        } else if targets.iter().all(|&(_, watched, _)| !watched) {
            plan.ops.push(BatchOp::ClearSeasonWatched { season_id });
        } else {
            for target in targets.iter().filter(|t| changed(*t)) {
                let (episode, watched, plays) = *target;
                plan.ops.push(BatchOp::SetEpisodeWatched {
                    episode_id: episode.episode_id,
                    state: if watched {
                        WatchedState::Watched
                    } else {
                        WatchedState::Unwatched
                    },
                    plays,
                });
            }
        }
    }
    plan
}

fn plan_collected(
    show_id: i64,
    episodes: &[Episode],
    remote: Option<&RemoteEpisodes>,
    is_initial_merge: bool,
) -> ShowPlan {
    let mut plan = ShowPlan::default();

    let Some(remote) = remote else {
        if is_initial_merge {
            for episode in episodes.iter().filter(|e| e.collected) {
                plan.upload_episode(episode, 1);
            }
        } else if episodes.iter().any(|e| e.collected) {
            plan.ops.push(BatchOp::ClearShowCollected { show_id });
        }
        return plan;
    };

    for ((_, season_id), season) in by_season(episodes) {
        let mut targets = Vec::with_capacity(season.len());
        for episode in season {
            let remote_has = remote.contains_key(&(episode.season_number, episode.number));
            let collected = if remote_has {
                true
            } else if episode.collected && is_initial_merge {
                plan.upload_episode(episode, 1);
                true
            } else {
                false
            };
            targets.push((episode, collected));
        }

        if targets.iter().all(|(e, c)| e.collected == *c) {
            continue;
        }
        if targets.iter().all(|(_, c)| *c) {
            plan.ops.push(BatchOp::SetSeasonCollected {
                season_id,
                collected: true,
            });
        } else if targets.iter().all(|(_, c)| !*c) {
            plan.ops.push(BatchOp::SetSeasonCollected {
                season_id,
                collected: false,
            });
        } else {
            for (episode, collected) in targets {
                if episode.collected != collected {
                    plan.ops.push(BatchOp::SetEpisodeCollected {
                        episode_id: episode.episode_id,
                        collected,
                    });
                }
            }
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::remote::tracker::{TrackerEpisode, TrackerSeason, TrackerShowRef};
    use crate::storage::Database;
    use crate::sync::load_show_map;
    use crate::testing::FakeTracker;

    fn episode(id: i64, season: i32, number: i32) -> Episode {
        Episode {
            episode_id: id,
            show_id: 1,
            season_id: 100 + season as i64,
            season_number: season,
            number,
            watched: WatchedState::Unwatched,
            plays: 0,
            collected: false,
            rating: 0,
        }
    }

    fn watched(mut e: Episode, plays: i32) -> Episode {
        e.watched = WatchedState::Watched;
        e.plays = plays;
        e
    }

    fn remote_season(season: i32, numbers: impl IntoIterator<Item = i32>, plays: i32) -> RemoteEpisodes {
        numbers.into_iter().map(|n| ((season, n), plays)).collect()
    }

    #[test]
    fn test_full_remote_season_collapses() {
        let episodes: Vec<Episode> = (1..=20).map(|n| episode(n as i64, 1, n)).collect();
        let remote = remote_season(1, 1..=20, 1);

        let plan = plan_watched(1, &episodes, Some(&remote), false);
        assert_eq!(
            plan.ops,
            vec![BatchOp::SetSeasonWatched {
                season_id: 101,
                plays: 1
            }]
        );
        assert!(plan.upload.is_empty());
    }

    #[test]
    fn test_partial_season_writes_per_episode() {
        let episodes = vec![episode(1, 1, 1), episode(2, 1, 2), watched(episode(3, 1, 3), 2)];
        let remote = remote_season(1, [1, 3], 2);

        let plan = plan_watched(1, &episodes, Some(&remote), false);
        assert_eq!(
            plan.ops,
            vec![BatchOp::SetEpisodeWatched {
                episode_id: 1,
                state: WatchedState::Watched,
                plays: 2
            }]
        );
    }

    #[test]
    fn test_steady_state_absence_clears_season_but_not_skipped() {
        let mut skipped = episode(2, 1, 2);
        skipped.watched = WatchedState::Skipped;
        let episodes = vec![watched(episode(1, 1, 1), 1), skipped, watched(episode(3, 2, 1), 1)];
        let remote = remote_season(2, [1], 1);

        let plan = plan_watched(1, &episodes, Some(&remote), false);
        assert_eq!(plan.ops, vec![BatchOp::ClearSeasonWatched { season_id: 101 }]);
    }

    #[test]
    fn test_initial_merge_uploads_extra_plays() {
        let episodes = vec![watched(episode(1, 1, 1), 3), watched(episode(2, 1, 2), 1)];
        let remote = remote_season(1, [1], 1);

        let plan = plan_watched(1, &episodes, Some(&remote), true);
        assert!(plan.ops.is_empty());
        let entries: Vec<i32> = plan.upload[&1].iter().map(|e| e.number).collect();
        assert_eq!(entries, vec![1, 1, 2]);
    }

    #[test]
    fn test_remote_higher_plays_raise_local() {
        let episodes = vec![watched(episode(1, 1, 1), 1)];
        let remote = remote_season(1, [1], 4);
        for initial in [true, false] {
            let plan = plan_watched(1, &episodes, Some(&remote), initial);
            assert_eq!(
                plan.ops,
                vec![BatchOp::SetSeasonWatched {
                    season_id: 101,
                    plays: 4
                }]
            );
        }
    }

    #[test]
    fn test_absent_show() {
        let episodes = vec![watched(episode(1, 1, 1), 2)];
        let steady = plan_watched(1, &episodes, None, false);
        assert_eq!(steady.ops, vec![BatchOp::ClearShowWatched { show_id: 1 }]);

        let initial = plan_watched(1, &episodes, None, true);
        assert!(initial.ops.is_empty());
        assert_eq!(initial.upload[&1].len(), 2);
    }

    #[test]
    fn test_collected_mixed_season() {
        let mut owned = episode(2, 1, 2);
        owned.collected = true;
        let episodes = vec![episode(1, 1, 1), owned, episode(3, 1, 3)];
        let remote = remote_season(1, [1], 1);

        let steady = plan_collected(1, &episodes, Some(&remote), false);
        assert_eq!(
            steady.ops,
            vec![
                BatchOp::SetEpisodeCollected {
                    episode_id: 1,
                    collected: true
                },
                BatchOp::SetEpisodeCollected {
                    episode_id: 2,
                    collected: false
                },
            ]
        );

        let initial = plan_collected(1, &episodes, Some(&remote), true);
        assert_eq!(
            initial.ops,
            vec![BatchOp::SetEpisodeCollected {
                episode_id: 1,
                collected: true
            }]
        );
        assert_eq!(initial.upload[&1].len(), 1);
    }

    #[tokio::test]
    async fn test_sync_watched_applies_season_and_skips_unchanged() {
        let db = Database::open_memory().await.unwrap();
        let show_id = db
            .writer()
            .call(|conn| {
                let show_id = repository::insert_show(conn, Some(1399), "S", None)?;
                let season_id = repository::insert_season(conn, show_id, 1)?;
                for n in 1..=20 {
                    repository::insert_episode(conn, show_id, season_id, 1, n, "")?;
                }
                Ok::<i64, rusqlite::Error>(show_id)
            })
            .await
            .unwrap();

        let tracker = Arc::new(FakeTracker::default());
        tracker.set_shows(
            ShowSnapshot::Watched,
            vec![TrackerShowEntry {
                show: TrackerShowRef {
                    title: Some("S".into()),
                    ids: TrackerIds::tmdb(1399),
                },
                seasons: vec![TrackerSeason {
                    number: 1,
                    episodes: (1..=20)
                        .map(|number| TrackerEpisode {
                            number,
                            plays: Some(1),
                        })
                        .collect(),
                }],
            }],
        );
        let ctx = SyncContext::new(db.clone()).with_tracker(tracker.clone());
        let map = load_show_map(&db).await.unwrap();
        let changed_at = DateTime::from_timestamp_millis(1_700_000_000_000);
        let sync = TrackerEpisodeSync::new(&ctx, tracker.as_ref());

        assert!(sync.sync_watched(&map, changed_at, false).await.unwrap());
        let episodes = db
            .reader()
            .call(move |conn| repository::episodes_for_show(conn, show_id))
            .await
            .unwrap();
        assert!(episodes.iter().all(|e| e.is_watched() && e.plays == 1));
        assert!(tracker.posts().is_empty());
        assert_eq!(tracker.show_fetches(), 1);

        // Same activity instant: nothing is fetched.
        assert!(sync.sync_watched(&map, changed_at, false).await.unwrap());
        assert_eq!(tracker.show_fetches(), 1);
    }
}
