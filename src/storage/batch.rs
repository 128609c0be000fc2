//! Batched local mutations.
//!
//! Reconcilers never write row by row while walking remote data. They
//! collect [`BatchOp`]s and hand them to [`apply`], which runs every chunk of
//! at most [`MAX_BATCH_OPS`] operations inside one transaction.

use rusqlite::{params, Connection};

use super::models::{List, ListItem, Movie, WatchedState};

/// Operations per transaction.
pub const MAX_BATCH_OPS: usize = 400;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShowChanges {
    pub favorite: Option<bool>,
    pub notify: Option<bool>,
    pub hidden: Option<bool>,
    pub language: Option<String>,
}

impl ShowChanges {
    pub fn is_empty(&self) -> bool {
        self.favorite.is_none()
            && self.notify.is_none()
            && self.hidden.is_none()
            && self.language.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MovieChanges {
    pub in_collection: Option<bool>,
    pub in_watchlist: Option<bool>,
    pub watched: Option<bool>,
    pub plays: Option<i32>,
}

impl MovieChanges {
    pub fn is_empty(&self) -> bool {
        self.in_collection.is_none()
            && self.in_watchlist.is_none()
            && self.watched.is_none()
            && self.plays.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Plays are forced to zero unless the state is watched.
    SetEpisodeWatched {
        episode_id: i64,
        state: WatchedState,
        plays: i32,
    },
    SetEpisodeCollected {
        episode_id: i64,
        collected: bool,
    },
    /// Every episode of the season becomes watched with `plays`.
    SetSeasonWatched {
        season_id: i64,
        plays: i32,
    },
    /// Watched episodes of the season become unwatched; skipped ones stay.
    ClearSeasonWatched {
        season_id: i64,
    },
    SetSeasonCollected {
        season_id: i64,
        collected: bool,
    },
    ClearShowWatched {
        show_id: i64,
    },
    ClearShowCollected {
        show_id: i64,
    },
    UpdateShow {
        show_id: i64,
        changes: ShowChanges,
    },
    SetShowCloudMerged {
        show_id: i64,
        merged: bool,
    },
    SetShowRating {
        show_id: i64,
        rating: i32,
    },
    SetEpisodeRating {
        episode_id: i64,
        rating: i32,
    },
    SetMovieRating {
        tmdb_id: i32,
        rating: i32,
    },
    InsertMovie {
        movie: Movie,
    },
    UpdateMovie {
        tmdb_id: i32,
        changes: MovieChanges,
    },
    DeleteMovie {
        tmdb_id: i32,
    },
    InsertList {
        list: List,
    },
    UpdateList {
        list_id: String,
        name: String,
        sort_order: i32,
    },
    DeleteList {
        list_id: String,
    },
    InsertListItem {
        item: ListItem,
    },
    DeleteListItem {
        list_item_id: String,
    },
}

/// Apply `ops` in order, one transaction per chunk. Returns the number of
/// rows that actually changed.
pub fn apply(conn: &mut Connection, ops: &[BatchOp]) -> Result<usize, rusqlite::Error> {
    let mut changed = 0;
    for chunk in ops.chunks(MAX_BATCH_OPS) {
        let tx = conn.transaction()?;
        for op in chunk {
            changed += apply_op(&tx, op)?;
        }
        tx.commit()?;
    }
    Ok(changed)
}

fn apply_op(conn: &Connection, op: &BatchOp) -> Result<usize, rusqlite::Error> {
    match op {
        BatchOp::SetEpisodeWatched {
            episode_id,
            state,
            plays,
        } => {
            let plays = if *state == WatchedState::Watched {
                (*plays).max(1)
            } else {
                0
            };
            conn.execute(
                "UPDATE episodes SET watched = ?2, plays = ?3
                 WHERE episode_id = ?1 AND (watched != ?2 OR plays != ?3)",
                params![episode_id, state.code(), plays],
            )
        }
        BatchOp::SetEpisodeCollected {
            episode_id,
            collected,
        } => conn.execute(
            "UPDATE episodes SET collected = ?2 WHERE episode_id = ?1 AND collected != ?2",
            params![episode_id, *collected as i32],
        ),
        BatchOp::SetSeasonWatched { season_id, plays } => conn.execute(
            "UPDATE episodes SET watched = 1, plays = ?2
             WHERE season_id = ?1 AND (watched != 1 OR plays != ?2)",
            params![season_id, (*plays).max(1)],
        ),
        BatchOp::ClearSeasonWatched { season_id } => conn.execute(
            "UPDATE episodes SET watched = 0, plays = 0 WHERE season_id = ?1 AND watched = 1",
            params![season_id],
        ),
        BatchOp::SetSeasonCollected {
            season_id,
            collected,
        } => conn.execute(
            "UPDATE episodes SET collected = ?2 WHERE season_id = ?1 AND collected != ?2",
            params![season_id, *collected as i32],
        ),
        BatchOp::ClearShowWatched { show_id } => conn.execute(
            "UPDATE episodes SET watched = 0, plays = 0 WHERE show_id = ?1 AND watched = 1",
            params![show_id],
        ),
        BatchOp::ClearShowCollected { show_id } => conn.execute(
            "UPDATE episodes SET collected = 0 WHERE show_id = ?1 AND collected = 1",
            params![show_id],
        ),
        BatchOp::UpdateShow { show_id, changes } => {
            if changes.is_empty() {
                return Ok(0);
            }
            conn.execute(
                "UPDATE shows SET
                    favorite = COALESCE(?2, favorite),
                    notify = COALESCE(?3, notify),
                    hidden = COALESCE(?4, hidden),
                    language = COALESCE(?5, language)
                 WHERE show_id = ?1",
                params![
                    show_id,
                    changes.favorite.map(|b| b as i32),
                    changes.notify.map(|b| b as i32),
                    changes.hidden.map(|b| b as i32),
                    changes.language,
                ],
            )
        }
        BatchOp::SetShowCloudMerged { show_id, merged } => conn.execute(
            "UPDATE shows SET cloud_merged = ?2 WHERE show_id = ?1 AND cloud_merged != ?2",
            params![show_id, *merged as i32],
        ),
        BatchOp::SetShowRating { show_id, rating } => conn.execute(
            "UPDATE shows SET rating = ?2 WHERE show_id = ?1 AND rating != ?2",
            params![show_id, rating],
        ),
        BatchOp::SetEpisodeRating { episode_id, rating } => conn.execute(
            "UPDATE episodes SET rating = ?2 WHERE episode_id = ?1 AND rating != ?2",
            params![episode_id, rating],
        ),
        BatchOp::SetMovieRating { tmdb_id, rating } => conn.execute(
            "UPDATE movies SET rating = ?2 WHERE tmdb_id = ?1 AND rating != ?2",
            params![tmdb_id, rating],
        ),
        BatchOp::InsertMovie { movie } => conn.execute(
            "INSERT INTO movies (tmdb_id, title, in_collection, in_watchlist, watched, plays, rating)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(tmdb_id) DO NOTHING",
            params![
                movie.tmdb_id,
                movie.title,
                movie.in_collection as i32,
                movie.in_watchlist as i32,
                movie.watched as i32,
                if movie.watched { movie.plays.max(1) } else { 0 },
                movie.rating,
            ],
        ),
        BatchOp::UpdateMovie { tmdb_id, changes } => {
            if changes.is_empty() {
                return Ok(0);
            }
            // Unwatching always resets plays.
            let plays = match changes.watched {
                Some(false) => Some(0),
                _ => changes.plays,
            };
            conn.execute(
                "UPDATE movies SET
                    in_collection = COALESCE(?2, in_collection),
                    in_watchlist = COALESCE(?3, in_watchlist),
                    watched = COALESCE(?4, watched),
                    plays = COALESCE(?5, plays)
                 WHERE tmdb_id = ?1",
                params![
                    tmdb_id,
                    changes.in_collection.map(|b| b as i32),
                    changes.in_watchlist.map(|b| b as i32),
                    changes.watched.map(|b| b as i32),
                    plays,
                ],
            )
        }
        BatchOp::DeleteMovie { tmdb_id } => {
            conn.execute("DELETE FROM movies WHERE tmdb_id = ?1", params![tmdb_id])
        }
        BatchOp::InsertList { list } => conn.execute(
            "INSERT INTO lists (list_id, name, sort_order) VALUES (?1, ?2, ?3)
             ON CONFLICT(list_id) DO NOTHING",
            params![list.list_id, list.name, list.sort_order],
        ),
        BatchOp::UpdateList {
            list_id,
            name,
            sort_order,
        } => conn.execute(
            "UPDATE lists SET name = ?2, sort_order = ?3
             WHERE list_id = ?1 AND (name != ?2 OR sort_order != ?3)",
            params![list_id, name, sort_order],
        ),
        BatchOp::DeleteList { list_id } => {
            conn.execute("DELETE FROM lists WHERE list_id = ?1", params![list_id])
        }
        BatchOp::InsertListItem { item } => conn.execute(
            "INSERT INTO list_items (list_item_id, list_id, item_ref_id, item_type)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(list_item_id) DO NOTHING",
            params![
                item.list_item_id,
                item.list_id,
                item.item_ref_id,
                item.item_type.code()
            ],
        ),
        BatchOp::DeleteListItem { list_item_id } => conn.execute(
            "DELETE FROM list_items WHERE list_item_id = ?1",
            params![list_item_id],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::repository;
    use crate::storage::Database;

    #[tokio::test]
    async fn test_season_ops_respect_skipped() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let show_id = repository::insert_show(conn, Some(1), "S", None)?;
                let season_id = repository::insert_season(conn, show_id, 1)?;
                let e1 = repository::insert_episode(conn, show_id, season_id, 1, 1, "")?;
                let e2 = repository::insert_episode(conn, show_id, season_id, 1, 2, "")?;

                let changed = apply(
                    conn,
                    &[
                        BatchOp::SetEpisodeWatched {
                            episode_id: e1,
                            state: WatchedState::Watched,
                            plays: 2,
                        },
                        BatchOp::SetEpisodeWatched {
                            episode_id: e2,
                            state: WatchedState::Skipped,
                            plays: 5,
                        },
                    ],
                )?;
                assert_eq!(changed, 2);

                let changed = apply(conn, &[BatchOp::ClearSeasonWatched { season_id }])?;
                assert_eq!(changed, 1);

                let episodes = repository::episodes_for_show(conn, show_id)?;
                assert_eq!(episodes[0].watched, WatchedState::Unwatched);
                assert_eq!(episodes[0].plays, 0);
                assert_eq!(episodes[1].watched, WatchedState::Skipped);
                assert_eq!(episodes[1].plays, 0);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reapplying_changes_nothing() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let show_id = repository::insert_show(conn, Some(1), "S", None)?;
                let season_id = repository::insert_season(conn, show_id, 1)?;
                for n in 1..=3 {
                    repository::insert_episode(conn, show_id, season_id, 1, n, "")?;
                }
                let ops = [
                    BatchOp::SetSeasonWatched { season_id, plays: 1 },
                    BatchOp::SetSeasonCollected {
                        season_id,
                        collected: true,
                    },
                ];
                assert_eq!(apply(conn, &ops)?, 6);
                assert_eq!(apply(conn, &ops)?, 0);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_chunk_rolls_back() {
        let db = Database::open_memory().await.unwrap();

        let result = db
            .writer()
            .call(|conn| {
                apply(
                    conn,
                    &[
                        BatchOp::InsertList {
                            list: List {
                                list_id: "l1".into(),
                                name: "Favorites".into(),
                                sort_order: 0,
                            },
                        },
                        // Unknown list violates the foreign key.
                        BatchOp::InsertListItem {
                            item: ListItem::new("1", crate::storage::models::ListItemType::Show, "missing"),
                        },
                    ],
                )
            })
            .await;
        assert!(result.is_err());

        let lists = db
            .reader()
            .call(|conn| repository::all_lists(conn))
            .await
            .unwrap();
        assert!(lists.is_empty());
    }

    #[tokio::test]
    async fn test_large_batch_is_chunked() {
        let db = Database::open_memory().await.unwrap();

        let ops: Vec<BatchOp> = (0..(MAX_BATCH_OPS as i32 * 2 + 7))
            .map(|i| BatchOp::InsertMovie {
                movie: Movie {
                    tmdb_id: i + 1,
                    in_watchlist: true,
                    ..Default::default()
                },
            })
            .collect();
        let expected = ops.len();
        let changed = db.apply_batch(ops).await.unwrap();
        assert_eq!(changed, expected);
    }
}
