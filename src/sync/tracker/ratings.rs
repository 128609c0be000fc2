use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::remote::tracker::{
    LastActivity, RatedItem, RatingKind, SyncEndpoint, SyncEpisode, SyncItems, SyncMovie,
    SyncSeason, SyncShow, TrackerIds,
};
use crate::remote::{Service, TrackerClient};
use crate::storage::models::Movie;
use crate::storage::settings::Cursor;
use crate::storage::{repository, BatchOp};
use crate::sync::rate_limit::retry_remote;
use crate::sync::{apply_ops, family_failed, read_cursor, store_cursor, ShowMap, SyncContext};

use super::{needs_fetch, send};

/// (show catalog id, season, episode).
type EpisodeRef = (i32, i32, i32);

/// Outcome of comparing local and remote ratings of one kind.
#[derive(Debug, PartialEq, Eq)]
struct RatingPlan<K> {
    /// Local ratings to write; zero clears.
    set: Vec<(K, i32)>,
    /// Local-only ratings to send.
    upload: Vec<(K, i32)>,
}

/// `local` holds rated items only. The first merge uploads local-only
/// ratings instead of clearing them.
fn plan_ratings<K: Hash + Eq + Copy + Ord>(
    local: &HashMap<K, i32>,
    remote: &HashMap<K, i32>,
    is_initial: bool,
) -> RatingPlan<K> {
    let mut set: Vec<(K, i32)> = remote
        .iter()
        .filter(|(key, rating)| local.get(key).copied().unwrap_or(0) != **rating)
        .map(|(&key, &rating)| (key, rating))
        .collect();
    let mut upload = Vec::new();
    for (&key, &rating) in local {
        if remote.contains_key(&key) {
            continue;
        }
        if is_initial {
            upload.push((key, rating));
        } else {
            set.push((key, 0));
        }
    }
    set.sort_unstable();
    upload.sort_unstable();
    RatingPlan { set, upload }
}

enum Fetched {
    Unchanged,
    Failed,
    Items(Vec<RatedItem>),
}

pub struct TrackerRatingSync<'a> {
    ctx: &'a SyncContext,
    tracker: &'a dyn TrackerClient,
}

impl<'a> TrackerRatingSync<'a> {
    pub fn new(ctx: &'a SyncContext, tracker: &'a dyn TrackerClient) -> Self {
        Self { ctx, tracker }
    }

    /// Show, episode and movie ratings. One kind failing does not stop the
    /// others. Until the first merge has completed every kind is fetched.
    pub async fn sync(
        &self,
        show_map: &ShowMap,
        activity: &LastActivity,
        is_initial_merge: bool,
    ) -> Result<bool> {
        let shows = self
            .sync_shows(show_map, activity.shows.rated_at, is_initial_merge)
            .await?;
        let episodes = self
            .sync_episodes(show_map, activity.episodes.rated_at, is_initial_merge)
            .await?;
        let movies = self
            .sync_movies(activity.movies.rated_at, is_initial_merge)
            .await?;
        Ok(shows && episodes && movies)
    }

    /// Fetch the remote ratings of `kind` unless nothing changed.
    async fn fetch(
        &self,
        family: &str,
        kind: RatingKind,
        cursor: Cursor,
        rated_at: Option<DateTime<Utc>>,
        is_initial: bool,
    ) -> Result<Fetched> {
        let stored = read_cursor(&self.ctx.db, cursor).await?;
        if !needs_fetch(stored, rated_at, is_initial) {
            log::debug!("{family}: no remote changes");
            return Ok(Fetched::Unchanged);
        }
        self.ctx.check_continue()?;
        match retry_remote!(Service::Tracker, self.tracker.ratings(kind)) {
            Ok(items) => Ok(Fetched::Items(items)),
            Err(e) => {
                family_failed(self.ctx, family, e)?;
                Ok(Fetched::Failed)
            }
        }
    }

    async fn sync_shows(
        &self,
        show_map: &ShowMap,
        rated_at: Option<DateTime<Utc>>,
        is_initial: bool,
    ) -> Result<bool> {
        const FAMILY: &str = "Tracker show ratings";
        let fetched = self
            .fetch(FAMILY, RatingKind::Shows, Cursor::TrackerShowRatings, rated_at, is_initial)
            .await?;
        let items = match fetched {
            Fetched::Items(items) => items,
            Fetched::Unchanged => return Ok(true),
            Fetched::Failed => return Ok(false),
        };

        let remote: HashMap<i32, i32> = items
            .iter()
            .filter_map(|item| Some((item.show.as_ref()?.ids.tmdb?, item.rating)))
            .collect();
        let local: HashMap<i32, i32> = self
            .ctx
            .db
            .reader()
            .call(|conn| repository::list_shows(conn))
            .await?
            .into_iter()
            .filter(|s| s.rating > 0)
            .filter_map(|s| Some((s.tmdb_id?, s.rating)))
            .collect();

        let plan = plan_ratings(&local, &remote, is_initial);
        let ops = plan
            .set
            .iter()
            .filter_map(|(tmdb_id, rating)| {
                show_map.get(tmdb_id).map(|&show_id| BatchOp::SetShowRating {
                    show_id,
                    rating: *rating,
                })
            })
            .collect();
        apply_ops(&self.ctx.db, FAMILY, ops).await?;

        let items = SyncItems {
            shows: plan
                .upload
                .iter()
                .map(|&(tmdb_id, rating)| SyncShow {
                    ids: TrackerIds::tmdb(tmdb_id),
                    rating: Some(rating),
                    seasons: Vec::new(),
                })
                .collect(),
            movies: Vec::new(),
        };
        if let Err(e) = send(self.tracker, SyncEndpoint::RatingsAdd, items).await {
            return family_failed(self.ctx, FAMILY, e);
        }
        store_cursor(&self.ctx.db, Cursor::TrackerShowRatings, rated_at).await?;
        Ok(true)
    }

    async fn sync_episodes(
        &self,
        show_map: &ShowMap,
        rated_at: Option<DateTime<Utc>>,
        is_initial: bool,
    ) -> Result<bool> {
        const FAMILY: &str = "Tracker episode ratings";
        let fetched = self
            .fetch(
                FAMILY,
                RatingKind::Episodes,
                Cursor::TrackerEpisodeRatings,
                rated_at,
                is_initial,
            )
            .await?;
        let items = match fetched {
            Fetched::Items(items) => items,
            Fetched::Unchanged => return Ok(true),
            Fetched::Failed => return Ok(false),
        };

        let remote: HashMap<EpisodeRef, i32> = items
            .iter()
            .filter_map(|item| {
                let tmdb_id = item.show.as_ref()?.ids.tmdb?;
                let key = item.episode.as_ref()?;
                Some(((tmdb_id, key.season, key.number), item.rating))
            })
            .collect();
        let by_show_id: HashMap<i64, i32> = show_map.iter().map(|(&t, &s)| (s, t)).collect();
        let local: HashMap<EpisodeRef, i32> = self
            .ctx
            .db
            .reader()
            .call(|conn| repository::rated_episodes(conn))
            .await?
            .into_iter()
            .filter_map(|((show_id, season, number), (_, rating))| {
                Some(((*by_show_id.get(&show_id)?, season, number), rating))
            })
            .collect();

        let plan = plan_ratings(&local, &remote, is_initial);
        let targets: Vec<(i64, i32, i32, i32)> = plan
            .set
            .iter()
            .filter_map(|&((tmdb_id, season, number), rating)| {
                show_map
                    .get(&tmdb_id)
                    .map(|&show_id| (show_id, season, number, rating))
            })
            .collect();
        let ops = self
            .ctx
            .db
            .reader()
            .call(move |conn| {
                let mut ops = Vec::with_capacity(targets.len());
                for (show_id, season, number, rating) in targets {
                    if let Some(episode) = repository::find_episode(conn, show_id, season, number)? {
                        ops.push(BatchOp::SetEpisodeRating {
                            episode_id: episode.episode_id,
                            rating,
                        });
                    }
                }
                Ok::<_, rusqlite::Error>(ops)
            })
            .await?;
        apply_ops(&self.ctx.db, FAMILY, ops).await?;

        let mut nested: BTreeMap<i32, BTreeMap<i32, Vec<SyncEpisode>>> = BTreeMap::new();
        for &((tmdb_id, season, number), rating) in &plan.upload {
            nested
                .entry(tmdb_id)
                .or_default()
                .entry(season)
                .or_default()
                .push(SyncEpisode {
                    number,
                    watched_at: None,
                    rating: Some(rating),
                });
        }
        let items = SyncItems {
            shows: nested
                .into_iter()
                .map(|(tmdb_id, seasons)| SyncShow {
                    ids: TrackerIds::tmdb(tmdb_id),
                    rating: None,
                    seasons: seasons
                        .into_iter()
                        .map(|(number, episodes)| SyncSeason { number, episodes })
                        .collect(),
                })
                .collect(),
            movies: Vec::new(),
        };
        if let Err(e) = send(self.tracker, SyncEndpoint::RatingsAdd, items).await {
            return family_failed(self.ctx, FAMILY, e);
        }
        store_cursor(&self.ctx.db, Cursor::TrackerEpisodeRatings, rated_at).await?;
        Ok(true)
    }

    async fn sync_movies(&self, rated_at: Option<DateTime<Utc>>, is_initial: bool) -> Result<bool> {
        const FAMILY: &str = "Tracker movie ratings";
        let fetched = self
            .fetch(FAMILY, RatingKind::Movies, Cursor::TrackerMovieRatings, rated_at, is_initial)
            .await?;
        let items = match fetched {
            Fetched::Items(items) => items,
            Fetched::Unchanged => return Ok(true),
            Fetched::Failed => return Ok(false),
        };

        let titles: HashMap<i32, String> = items
            .iter()
            .filter_map(|item| {
                let movie = item.movie.as_ref()?;
                Some((movie.ids.tmdb?, movie.title.clone().unwrap_or_default()))
            })
            .collect();
        let remote: HashMap<i32, i32> = items
            .iter()
            .filter_map(|item| Some((item.movie.as_ref()?.ids.tmdb?, item.rating)))
            .collect();
        let movies = self
            .ctx
            .db
            .reader()
            .call(|conn| repository::all_movies(conn))
            .await?;
        let local: HashMap<i32, i32> = movies
            .values()
            .filter(|m| m.rating > 0)
            .map(|m| (m.tmdb_id, m.rating))
            .collect();

        let plan = plan_ratings(&local, &remote, is_initial);
        let mut ops = Vec::new();
        for &(tmdb_id, rating) in &plan.set {
            match movies.get(&tmdb_id) {
                Some(movie) => {
                    let rated = Movie {
                        rating,
                        ..movie.clone()
                    };
                    if rated.is_prunable() {
                        ops.push(BatchOp::DeleteMovie { tmdb_id });
                    } else {
                        ops.push(BatchOp::SetMovieRating { tmdb_id, rating });
                    }
                }
                None if rating > 0 => ops.push(BatchOp::InsertMovie {
                    movie: Movie {
                        tmdb_id,
                        title: titles.get(&tmdb_id).cloned().unwrap_or_default(),
                        rating,
                        ..Default::default()
                    },
                }),
                None => {}
            }
        }
        apply_ops(&self.ctx.db, FAMILY, ops).await?;

        let items = SyncItems {
            shows: Vec::new(),
            movies: plan
                .upload
                .iter()
                .map(|&(tmdb_id, rating)| SyncMovie {
                    ids: TrackerIds::tmdb(tmdb_id),
                    watched_at: None,
                    rating: Some(rating),
                })
                .collect(),
        };
        if let Err(e) = send(self.tracker, SyncEndpoint::RatingsAdd, items).await {
            return family_failed(self.ctx, FAMILY, e);
        }
        store_cursor(&self.ctx.db, Cursor::TrackerMovieRatings, rated_at).await?;
        Ok(true)
    }
}
