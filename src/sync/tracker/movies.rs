use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::remote::tracker::{
    MovieActivity, MovieSnapshot, SyncEndpoint, SyncItems, SyncMovie, TrackerIds,
    TrackerMovieEntry,
};
use crate::remote::{Service, TrackerClient};
use crate::storage::batch::MovieChanges;
use crate::storage::models::Movie;
use crate::storage::settings::Cursor;
use crate::storage::{repository, BatchOp};
use crate::sync::rate_limit::retry_remote;
use crate::sync::{apply_ops, family_failed, read_cursor, store_cursor, SyncContext};

use super::{needs_fetch, send};

const FAMILY: &str = "Tracker movies";

/// The three remote movie sets.
#[derive(Debug, Default)]
struct RemoteMovies {
    collection: HashSet<i32>,
    watchlist: HashSet<i32>,
    /// Catalog id → plays.
    watched: HashMap<i32, i32>,
    titles: HashMap<i32, String>,
}

impl RemoteMovies {
    fn ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self
            .collection
            .iter()
            .chain(self.watchlist.iter())
            .chain(self.watched.keys())
            .copied()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        ids.sort_unstable();
        ids
    }

    fn note_title(&mut self, entry: &TrackerMovieEntry, tmdb_id: i32) {
        if let Some(title) = &entry.movie.title {
            self.titles.entry(tmdb_id).or_insert_with(|| title.clone());
        }
    }
}

/// Local writes and uploads for the movie sets.
#[derive(Debug, Default, PartialEq, Eq)]
struct MoviePlan {
    ops: Vec<BatchOp>,
    collection: Vec<i32>,
    watchlist: Vec<i32>,
    /// Catalog id → plays to add to the history.
    history: Vec<(i32, i32)>,
}

pub struct TrackerMovieSync<'a> {
    ctx: &'a SyncContext,
    tracker: &'a dyn TrackerClient,
}

impl<'a> TrackerMovieSync<'a> {
    pub fn new(ctx: &'a SyncContext, tracker: &'a dyn TrackerClient) -> Self {
        Self { ctx, tracker }
    }

    /// Reconcile collection, watchlist and watched movies. Skipped unless
    /// one of the three activity instants moved, or on the first merge.
    pub async fn sync_lists(&self, activity: &MovieActivity, has_merged: bool) -> Result<bool> {
        let families = [
            (Cursor::TrackerMoviesCollection, activity.collected_at),
            (Cursor::TrackerMoviesWatchlist, activity.watchlisted_at),
            (Cursor::TrackerMoviesWatched, activity.watched_at),
        ];
        let mut changed = !has_merged;
        for (cursor, changed_at) in families {
            let stored = read_cursor(&self.ctx.db, cursor).await?;
            changed |= needs_fetch(stored, changed_at, false);
        }
        if !changed {
            log::debug!("{FAMILY}: no remote changes");
            return Ok(true);
        }

        let mut remote = RemoteMovies::default();
        for kind in [
            MovieSnapshot::Collection,
            MovieSnapshot::Watchlist,
            MovieSnapshot::Watched,
        ] {
            self.ctx.check_continue()?;
            let entries = match retry_remote!(Service::Tracker, self.tracker.movies(kind)) {
                Ok(entries) => entries,
                Err(e) => return family_failed(self.ctx, FAMILY, e),
            };
            for entry in &entries {
                let Some(tmdb_id) = entry.movie.ids.tmdb else {
                    continue;
                };
                remote.note_title(entry, tmdb_id);
                match kind {
                    MovieSnapshot::Collection => {
                        remote.collection.insert(tmdb_id);
                    }
                    MovieSnapshot::Watchlist => {
                        remote.watchlist.insert(tmdb_id);
                    }
                    MovieSnapshot::Watched => {
                        remote.watched.insert(tmdb_id, entry.plays.unwrap_or(1).max(1));
                    }
                }
            }
        }

        let local = self
            .ctx
            .db
            .reader()
            .call(|conn| repository::all_movies(conn))
            .await?;
        let plan = plan_movies(&local, &remote, has_merged);
        apply_ops(&self.ctx.db, FAMILY, plan.ops).await?;

        let uploads = [
            (SyncEndpoint::CollectionAdd, movie_entries(&plan.collection)),
            (SyncEndpoint::WatchlistAdd, movie_entries(&plan.watchlist)),
            (
                SyncEndpoint::HistoryAdd,
                plan.history
                    .iter()
                    .flat_map(|&(tmdb_id, plays)| {
                        (0..plays).map(move |_| SyncMovie {
                            ids: TrackerIds::tmdb(tmdb_id),
                            ..Default::default()
                        })
                    })
                    .collect(),
            ),
        ];
        for (endpoint, movies) in uploads {
            if movies.is_empty() {
                continue;
            }
            self.ctx.check_continue()?;
            log::info!("Uploading {} movies to {endpoint:?}", movies.len());
            let items = SyncItems {
                shows: Vec::new(),
                movies,
            };
            if let Err(e) = send(self.tracker, endpoint, items).await {
                return family_failed(self.ctx, FAMILY, e);
            }
        }

        for (cursor, changed_at) in families {
            store_cursor(&self.ctx.db, cursor, changed_at).await?;
        }
        Ok(true)
    }
}

fn movie_entries(ids: &[i32]) -> Vec<SyncMovie> {
    ids.iter()
        .map(|&tmdb_id| SyncMovie {
            ids: TrackerIds::tmdb(tmdb_id),
            ..Default::default()
        })
        .collect()
}

/// On the first merge flags are only turned on locally and local-only
/// memberships are uploaded. Afterwards the local sets mirror the remote
/// ones. Movies left without any reference are deleted.
fn plan_movies(local: &HashMap<i32, Movie>, remote: &RemoteMovies, has_merged: bool) -> MoviePlan {
    let mut plan = MoviePlan::default();

    let mut ids: Vec<&i32> = local.keys().collect();
    ids.sort_unstable();
    for tmdb_id in ids {
        let movie = &local[tmdb_id];
        let in_collection = remote.collection.contains(tmdb_id);
        let in_watchlist = remote.watchlist.contains(tmdb_id);
        let remote_plays = remote.watched.get(tmdb_id).copied();

        let mut next = movie.clone();
        if has_merged {
            next.in_collection = in_collection;
            next.in_watchlist = in_watchlist;
            next.watched = remote_plays.is_some();
            next.plays = remote_plays.unwrap_or(0);
        } else {
            if movie.in_collection && !in_collection {
                plan.collection.push(*tmdb_id);
            }
            if movie.in_watchlist && !in_watchlist {
                plan.watchlist.push(*tmdb_id);
            }
            next.in_collection |= in_collection;
            next.in_watchlist |= in_watchlist;
            let local_plays = if movie.watched { movie.plays.max(1) } else { 0 };
            match remote_plays {
                Some(remote_plays) => {
                    if local_plays > remote_plays {
                        plan.history.push((*tmdb_id, local_plays - remote_plays));
                    }
                    next.watched = true;
                    next.plays = local_plays.max(remote_plays);
                }
                None if movie.watched => plan.history.push((*tmdb_id, local_plays)),
                None => {}
            }
        }

        if next.is_prunable() {
            plan.ops.push(BatchOp::DeleteMovie { tmdb_id: *tmdb_id });
            continue;
        }
        let changes = MovieChanges {
            in_collection: (next.in_collection != movie.in_collection).then_some(next.in_collection),
            in_watchlist: (next.in_watchlist != movie.in_watchlist).then_some(next.in_watchlist),
            watched: (next.watched != movie.watched).then_some(next.watched),
            plays: (next.watched && next.plays != movie.plays).then_some(next.plays),
        };
        if !changes.is_empty() {
            plan.ops.push(BatchOp::UpdateMovie {
                tmdb_id: *tmdb_id,
                changes,
            });
        }
    }

    for tmdb_id in remote.ids() {
        if local.contains_key(&tmdb_id) {
            continue;
        }
        let plays = remote.watched.get(&tmdb_id).copied();
        plan.ops.push(BatchOp::InsertMovie {
            movie: Movie {
                tmdb_id,
                title: remote.titles.get(&tmdb_id).cloned().unwrap_or_default(),
                in_collection: remote.collection.contains(&tmdb_id),
                in_watchlist: remote.watchlist.contains(&tmdb_id),
                watched: plays.is_some(),
                plays: plays.unwrap_or(0),
                rating: 0,
            },
        });
    }
    plan
}
