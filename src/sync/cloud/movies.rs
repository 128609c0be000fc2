use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::remote::cloud::{CloudMovie, MAX_BATCH_SIZE};
use crate::remote::{CloudClient, Service};
use crate::storage::batch::MovieChanges;
use crate::storage::models::Movie;
use crate::storage::settings::{self, Cursor, MergeFlag};
use crate::storage::{repository, BatchOp};
use crate::sync::rate_limit::retry_remote;
use crate::sync::{apply_ops, family_failed, read_cursor, store_cursor, SyncContext};

const FAMILY: &str = "Cloud movies";

/// Movies the Cloud has and the library does not, by category.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewMovies {
    pub collection: HashSet<i32>,
    pub watchlist: HashSet<i32>,
    /// Catalog id → plays.
    pub watched: HashMap<i32, i32>,
}

impl NewMovies {
    pub fn is_empty(&self) -> bool {
        self.collection.is_empty() && self.watchlist.is_empty() && self.watched.is_empty()
    }

    /// One insert per distinct movie carrying all its flags.
    pub fn into_ops(self) -> Vec<BatchOp> {
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
        ids.into_iter()
            .map(|tmdb_id| {
                let plays = self.watched.get(&tmdb_id).copied();
                BatchOp::InsertMovie {
                    movie: Movie {
                        tmdb_id,
                        title: String::new(),
                        in_collection: self.collection.contains(&tmdb_id),
                        in_watchlist: self.watchlist.contains(&tmdb_id),
                        watched: plays.is_some(),
                        plays: plays.unwrap_or(0),
                        rating: 0,
                    },
                }
            })
            .collect()
    }
}

/// Outcome of reading every page of movie changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Downloaded {
    /// All pages were applied. `newest` is the latest change seen.
    Complete { newest: Option<DateTime<Utc>> },
    /// A page could not be read.
    Failed,
}

pub struct MovieReconciler<'a> {
    ctx: &'a SyncContext,
    cloud: &'a dyn CloudClient,
}

impl<'a> MovieReconciler<'a> {
    pub fn new(ctx: &'a SyncContext, cloud: &'a dyn CloudClient) -> Self {
        Self { ctx, cloud }
    }

    pub async fn sync(&self) -> Result<bool> {
        let has_merged = self
            .ctx
            .db
            .reader()
            .call(|conn| settings::is_merged(conn, MergeFlag::CloudMovies))
            .await?;

        let mut new_movies = NewMovies::default();
        let newest = match self.download(&mut new_movies, has_merged).await? {
            Downloaded::Complete { newest } => newest,
            Downloaded::Failed => return Ok(false),
        };
        if !new_movies.is_empty() {
            apply_ops(&self.ctx.db, FAMILY, new_movies.into_ops()).await?;
        }
        store_cursor(&self.ctx.db, Cursor::CloudMovies, newest).await?;
        if has_merged {
            return Ok(true);
        }
        if !self.upload_all().await? {
            return Ok(false);
        }
        self.ctx
            .db
            .writer()
            .call(|conn| settings::set_merged(conn, MergeFlag::CloudMovies, true))
            .await?;
        log::info!("Movies merged with the Cloud");
        Ok(true)
    }

    /// Update known movies from changes since the cursor; unknown ones go
    /// to `new_movies` for the caller to create. The cursor is left alone:
    /// the caller moves it once the new movies exist.
    pub async fn download(&self, new_movies: &mut NewMovies, has_merged: bool) -> Result<Downloaded> {
        let since = read_cursor(&self.ctx.db, Cursor::CloudMovies).await?;
        let mut local = self
            .ctx
            .db
            .reader()
            .call(|conn| repository::all_movies(conn))
            .await?;

        let mut newest: Option<DateTime<Utc>> = None;
        let mut page_cursor: Option<String> = None;
        loop {
            self.ctx.check_continue()?;
            let page = match retry_remote!(
                Service::Cloud,
                self.cloud.movies_changed(since, page_cursor.clone())
            ) {
                Ok(page) => page,
                Err(e) => {
                    family_failed(self.ctx, FAMILY, e)?;
                    return Ok(Downloaded::Failed);
                }
            };

            let mut ops = Vec::new();
            for remote in &page.items {
                newest = newest.max(remote.updated_at);
                match local.get_mut(&remote.tmdb_id) {
                    Some(movie) => {
                        if let Some(op) = update_known(movie, remote, has_merged) {
                            if matches!(op, BatchOp::DeleteMovie { .. }) {
                                local.remove(&remote.tmdb_id);
                            }
                            ops.push(op);
                        }
                    }
                    None => collect_new(remote, new_movies),
                }
            }

            apply_ops(&self.ctx.db, FAMILY, ops).await?;

            match page.next_cursor {
                Some(next) => page_cursor = Some(next),
                None => break,
            }
        }
        Ok(Downloaded::Complete { newest })
    }

    pub async fn upload_all(&self) -> Result<bool> {
        let movies = self
            .ctx
            .db
            .reader()
            .call(|conn| repository::all_movies(conn))
            .await?;
        let mut payload: Vec<CloudMovie> = movies
            .values()
            .filter(|m| m.in_collection || m.in_watchlist || m.watched)
            .map(|m| CloudMovie {
                tmdb_id: m.tmdb_id,
                is_in_collection: Some(m.in_collection),
                is_in_watchlist: Some(m.in_watchlist),
                is_watched: Some(m.watched),
                plays: Some(m.plays),
                updated_at: None,
            })
            .collect();
        payload.sort_by_key(|m| m.tmdb_id);

        for chunk in payload.chunks(MAX_BATCH_SIZE) {
            self.ctx.check_continue()?;
            if let Err(e) = retry_remote!(Service::Cloud, self.cloud.save_movies(chunk.to_vec())) {
                return family_failed(self.ctx, FAMILY, e);
            }
        }
        log::info!("Uploaded {} movies to the Cloud", payload.len());
        Ok(true)
    }
}

/// The single write a remote movie causes on its local row, if any. A movie
/// left in no category, unwatched and unrated is deleted.
fn update_known(movie: &mut Movie, remote: &CloudMovie, has_merged: bool) -> Option<BatchOp> {
    let merge = |local: bool, remote: Option<bool>| -> Option<bool> {
        match remote {
            Some(value) if value != local && (has_merged || value) => Some(value),
            _ => None,
        }
    };

    let mut changes = MovieChanges {
        in_collection: merge(movie.in_collection, remote.is_in_collection),
        in_watchlist: merge(movie.in_watchlist, remote.is_in_watchlist),
        watched: merge(movie.watched, remote.is_watched),
        plays: None,
    };
    if let Some(v) = changes.in_collection {
        movie.in_collection = v;
    }
    if let Some(v) = changes.in_watchlist {
        movie.in_watchlist = v;
    }
    if let Some(v) = changes.watched {
        movie.watched = v;
        if !v {
            movie.plays = 0;
        }
    }
    // Remote wins if higher.
    if movie.watched {
        let remote_plays = remote.plays.unwrap_or(0);
        let floor = movie.plays.max(1);
        let plays = floor.max(remote_plays);
        if plays != movie.plays {
            changes.plays = Some(plays);
            movie.plays = plays;
        }
    }

    if movie.is_prunable() {
        return Some(BatchOp::DeleteMovie {
            tmdb_id: movie.tmdb_id,
        });
    }
    (!changes.is_empty()).then(|| BatchOp::UpdateMovie {
        tmdb_id: movie.tmdb_id,
        changes,
    })
}

fn collect_new(remote: &CloudMovie, new_movies: &mut NewMovies) {
    if remote.is_in_collection == Some(true) {
        new_movies.collection.insert(remote.tmdb_id);
    }
    if remote.is_in_watchlist == Some(true) {
        new_movies.watchlist.insert(remote.tmdb_id);
    }
    if remote.is_watched == Some(true) {
        new_movies
            .watched
            .insert(remote.tmdb_id, remote.plays.unwrap_or(1).max(1));
    }
}
