//! User changes. Each one updates the local library and queues the job that
//! carries it to the remote services, in a single transaction.
//!
//! Items without a catalog id cannot be addressed remotely; for those only
//! the local change is made.

use chrono::Utc;
use rusqlite::Connection;

use super::queue::enqueue_in;
use super::{EpisodeRef, JobAction, JobPayload};
use crate::error::{Error, Result};
use crate::storage::models::{Episode, List, ListItem, ListItemType, Movie, Show, WatchedState};
use crate::storage::{repository, Database};

pub const MAX_RATING: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowFlag {
    Favorite,
    Notify,
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovieFlag {
    Collection,
    Watchlist,
    Watched,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn check_rating(rating: i32) -> Result<()> {
    if (0..=MAX_RATING).contains(&rating) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "rating must be between 0 and {MAX_RATING}, got {rating}"
        )))
    }
}

fn not_found(what: &str, id: impl std::fmt::Display) -> Error {
    Error::NotFound(format!("{what} {id}"))
}

/// Play count after a user sets `state`. Marking a watched episode watched
/// again records another play.
fn plays_after(current: &Episode, state: WatchedState) -> i32 {
    match state {
        WatchedState::Watched if current.is_watched() => current.plays + 1,
        WatchedState::Watched => 1,
        _ => 0,
    }
}

fn episode_action(state: WatchedState) -> JobAction {
    match state {
        WatchedState::Watched => JobAction::EpisodeWatched,
        WatchedState::Skipped => JobAction::EpisodeSkipped,
        WatchedState::Unwatched => JobAction::EpisodeUnwatched,
    }
}

fn enqueue_episodes(
    conn: &Connection,
    show: &Show,
    action: JobAction,
    episodes: Vec<EpisodeRef>,
    now: i64,
) -> std::result::Result<(), rusqlite::Error> {
    let Some(show_tmdb_id) = show.tmdb_id else {
        return Ok(());
    };
    if episodes.is_empty() {
        return Ok(());
    }
    let payload = JobPayload::Episodes {
        show_tmdb_id,
        show_title: show.title.clone(),
        episodes,
    };
    enqueue_in(conn, action, &payload, now)?;
    Ok(())
}

// ── Episodes ───────────────────────────────────────────────────────

pub async fn set_episode_watched(db: &Database, episode_id: i64, state: WatchedState) -> Result<()> {
    let now = now_ms();
    db.writer()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let Some(episode) = repository::get_episode(&tx, episode_id)? else {
                return Ok(Err(not_found("episode", episode_id)));
            };
            let Some(show) = repository::get_show(&tx, episode.show_id)? else {
                return Ok(Err(not_found("show", episode.show_id)));
            };
            let plays = plays_after(&episode, state);
            repository::set_episode_watched(&tx, episode_id, state, plays)?;
            if state == WatchedState::Watched {
                repository::set_show_last_watched(&tx, show.show_id, now)?;
            }
            let episode_ref = EpisodeRef {
                season: episode.season_number,
                number: episode.number,
                plays,
            };
            enqueue_episodes(&tx, &show, episode_action(state), vec![episode_ref], now)?;
            tx.commit()?;
            Ok::<Result<()>, rusqlite::Error>(Ok(()))
        })
        .await??;
    log::debug!("Episode {episode_id} set to {state:?}");
    Ok(())
}

/// Set every episode of a season at once.
pub async fn set_season_watched(
    db: &Database,
    show_id: i64,
    season_number: i32,
    state: WatchedState,
) -> Result<usize> {
    let now = now_ms();
    db.writer()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let Some(show) = repository::get_show(&tx, show_id)? else {
                return Ok(Err(not_found("show", show_id)));
            };
            let episodes: Vec<Episode> = repository::episodes_for_show(&tx, show_id)?
                .into_iter()
                .filter(|e| e.season_number == season_number)
                .collect();
            if episodes.is_empty() {
                return Ok(Err(not_found("season", season_number)));
            }
            let mut refs = Vec::with_capacity(episodes.len());
            for episode in &episodes {
                let plays = plays_after(episode, state);
                repository::set_episode_watched(&tx, episode.episode_id, state, plays)?;
                refs.push(EpisodeRef {
                    season: season_number,
                    number: episode.number,
                    plays,
                });
            }
            if state == WatchedState::Watched {
                repository::set_show_last_watched(&tx, show_id, now)?;
            }
            enqueue_episodes(&tx, &show, episode_action(state), refs, now)?;
            tx.commit()?;
            Ok::<Result<usize>, rusqlite::Error>(Ok(episodes.len()))
        })
        .await?
}

pub async fn set_episode_collected(db: &Database, episode_id: i64, collected: bool) -> Result<()> {
    let now = now_ms();
    db.writer()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let Some(episode) = repository::get_episode(&tx, episode_id)? else {
                return Ok(Err(not_found("episode", episode_id)));
            };
            let Some(show) = repository::get_show(&tx, episode.show_id)? else {
                return Ok(Err(not_found("show", episode.show_id)));
            };
            repository::set_episode_collected(&tx, episode_id, collected)?;
            let action = if collected {
                JobAction::EpisodeCollected
            } else {
                JobAction::EpisodeUncollected
            };
            let episode_ref = EpisodeRef {
                season: episode.season_number,
                number: episode.number,
                plays: 0,
            };
            enqueue_episodes(&tx, &show, action, vec![episode_ref], now)?;
            tx.commit()?;
            Ok::<Result<()>, rusqlite::Error>(Ok(()))
        })
        .await?
}

// ── Shows ──────────────────────────────────────────────────────────

pub async fn set_show_flag(db: &Database, show_id: i64, flag: ShowFlag, value: bool) -> Result<()> {
    let now = now_ms();
    db.writer()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let Some(show) = repository::get_show(&tx, show_id)? else {
                return Ok(Err(not_found("show", show_id)));
            };
            let (favorite, notify, hidden, action) = match flag {
                ShowFlag::Favorite => (Some(value), None, None, JobAction::ShowFavorite),
                ShowFlag::Notify => (None, Some(value), None, JobAction::ShowNotify),
                ShowFlag::Hidden => (None, None, Some(value), JobAction::ShowHidden),
            };
            repository::set_show_flags(&tx, show_id, favorite, notify, hidden)?;
            if let Some(show_tmdb_id) = show.tmdb_id {
                let payload = JobPayload::ShowFlag {
                    show_tmdb_id,
                    show_title: show.title.clone(),
                    value,
                };
                enqueue_in(&tx, action, &payload, now)?;
            }
            tx.commit()?;
            Ok::<Result<()>, rusqlite::Error>(Ok(()))
        })
        .await?
}

// ── Movies ─────────────────────────────────────────────────────────

/// Change one movie flag. Unknown movies are created; a movie left without
/// any flag or rating is removed.
pub async fn set_movie_flag(
    db: &Database,
    tmdb_id: i32,
    title: &str,
    flag: MovieFlag,
    value: bool,
) -> Result<()> {
    let now = now_ms();
    let title = title.to_string();
    db.writer()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let mut movie = repository::get_movie(&tx, tmdb_id)?.unwrap_or(Movie {
                tmdb_id,
                title,
                ..Default::default()
            });
            let action = match (flag, value) {
                (MovieFlag::Collection, true) => JobAction::MovieCollected,
                (MovieFlag::Collection, false) => JobAction::MovieUncollected,
                (MovieFlag::Watchlist, true) => JobAction::MovieWatchlisted,
                (MovieFlag::Watchlist, false) => JobAction::MovieUnwatchlisted,
                (MovieFlag::Watched, true) => JobAction::MovieWatched,
                (MovieFlag::Watched, false) => JobAction::MovieUnwatched,
            };
            match flag {
                MovieFlag::Collection => movie.in_collection = value,
                MovieFlag::Watchlist => movie.in_watchlist = value,
                MovieFlag::Watched => {
                    movie.plays = match (value, movie.watched) {
                        (true, true) => movie.plays + 1,
                        (true, false) => 1,
                        (false, _) => 0,
                    };
                    movie.watched = value;
                }
            }
            store_movie(&tx, &movie)?;
            let payload = JobPayload::Movie {
                tmdb_id,
                title: movie.title.clone(),
                plays: movie.plays,
            };
            enqueue_in(&tx, action, &payload, now)?;
            tx.commit()?;
            Ok::<(), rusqlite::Error>(())
        })
        .await?;
    Ok(())
}

fn store_movie(conn: &Connection, movie: &Movie) -> std::result::Result<(), rusqlite::Error> {
    if movie.is_prunable() {
        repository::delete_movie(conn, movie.tmdb_id)?;
    } else {
        repository::upsert_movie(conn, movie)?;
    }
    Ok(())
}

// ── Ratings ────────────────────────────────────────────────────────

/// Rate a show; zero removes the rating.
pub async fn rate_show(db: &Database, show_id: i64, rating: i32) -> Result<()> {
    check_rating(rating)?;
    let now = now_ms();
    db.writer()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let Some(show) = repository::get_show(&tx, show_id)? else {
                return Ok(Err(not_found("show", show_id)));
            };
            repository::set_show_rating(&tx, show_id, rating)?;
            if let Some(show_tmdb_id) = show.tmdb_id {
                let payload = JobPayload::ShowRating {
                    show_tmdb_id,
                    show_title: show.title.clone(),
                    rating,
                };
                enqueue_in(&tx, JobAction::RateShow, &payload, now)?;
            }
            tx.commit()?;
            Ok::<Result<()>, rusqlite::Error>(Ok(()))
        })
        .await?
}

pub async fn rate_episode(db: &Database, episode_id: i64, rating: i32) -> Result<()> {
    check_rating(rating)?;
    let now = now_ms();
    db.writer()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let Some(episode) = repository::get_episode(&tx, episode_id)? else {
                return Ok(Err(not_found("episode", episode_id)));
            };
            let Some(show) = repository::get_show(&tx, episode.show_id)? else {
                return Ok(Err(not_found("show", episode.show_id)));
            };
            repository::set_episode_rating(&tx, episode_id, rating)?;
            if let Some(show_tmdb_id) = show.tmdb_id {
                let payload = JobPayload::EpisodeRating {
                    show_tmdb_id,
                    show_title: show.title.clone(),
                    season: episode.season_number,
                    number: episode.number,
                    rating,
                };
                enqueue_in(&tx, JobAction::RateEpisode, &payload, now)?;
            }
            tx.commit()?;
            Ok::<Result<()>, rusqlite::Error>(Ok(()))
        })
        .await?
}

pub async fn rate_movie(db: &Database, tmdb_id: i32, title: &str, rating: i32) -> Result<()> {
    check_rating(rating)?;
    let now = now_ms();
    let title = title.to_string();
    db.writer()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let mut movie = repository::get_movie(&tx, tmdb_id)?.unwrap_or(Movie {
                tmdb_id,
                title,
                ..Default::default()
            });
            movie.rating = rating;
            store_movie(&tx, &movie)?;
            let payload = JobPayload::MovieRating {
                tmdb_id,
                title: movie.title.clone(),
                rating,
            };
            enqueue_in(&tx, JobAction::RateMovie, &payload, now)?;
            tx.commit()?;
            Ok::<(), rusqlite::Error>(())
        })
        .await?;
    Ok(())
}

// ── Lists ──────────────────────────────────────────────────────────

fn new_list_id() -> String {
    let nanos = Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| Utc::now().timestamp_micros() * 1000);
    format!("{nanos:x}")
}

/// Create a list after the existing ones. Returns its id.
pub async fn create_list(db: &Database, name: &str) -> Result<String> {
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(Error::InvalidInput("list name must not be empty".into()));
    }
    let now = now_ms();
    let list_id = new_list_id();
    db.writer()
        .call({
            let list_id = list_id.clone();
            move |conn| {
                let tx = conn.transaction()?;
                let sort_order = repository::all_lists(&tx)?
                    .iter()
                    .map(|l| l.sort_order + 1)
                    .max()
                    .unwrap_or(0);
                let list = List {
                    list_id: list_id.clone(),
                    name,
                    sort_order,
                };
                repository::insert_list(&tx, &list)?;
                let payload = JobPayload::List {
                    list_id,
                    name: list.name,
                    sort_order,
                };
                enqueue_in(&tx, JobAction::ListSave, &payload, now)?;
                tx.commit()?;
                Ok::<(), rusqlite::Error>(())
            }
        })
        .await?;
    Ok(list_id)
}

pub async fn rename_list(db: &Database, list_id: &str, name: &str) -> Result<()> {
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(Error::InvalidInput("list name must not be empty".into()));
    }
    let now = now_ms();
    let list_id = list_id.to_string();
    db.writer()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let Some(mut list) = repository::get_list(&tx, &list_id)? else {
                return Ok(Err(not_found("list", &list_id)));
            };
            list.name = name;
            repository::update_list(&tx, &list)?;
            let payload = JobPayload::List {
                list_id: list.list_id,
                name: list.name,
                sort_order: list.sort_order,
            };
            enqueue_in(&tx, JobAction::ListSave, &payload, now)?;
            tx.commit()?;
            Ok::<Result<()>, rusqlite::Error>(Ok(()))
        })
        .await?
}

pub async fn remove_list(db: &Database, list_id: &str) -> Result<()> {
    let now = now_ms();
    let list_id = list_id.to_string();
    db.writer()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let Some(list) = repository::get_list(&tx, &list_id)? else {
                return Ok(Err(not_found("list", &list_id)));
            };
            repository::delete_list(&tx, &list_id)?;
            let payload = JobPayload::List {
                list_id: list.list_id,
                name: list.name,
                sort_order: list.sort_order,
            };
            enqueue_in(&tx, JobAction::ListRemove, &payload, now)?;
            tx.commit()?;
            Ok::<Result<()>, rusqlite::Error>(Ok(()))
        })
        .await?
}

/// Returns the composite id of the added item.
pub async fn add_list_item(
    db: &Database,
    list_id: &str,
    item_ref_id: &str,
    item_type: ListItemType,
) -> Result<String> {
    if item_ref_id.is_empty() || item_ref_id.contains('-') {
        return Err(Error::InvalidInput(format!("bad item id {item_ref_id:?}")));
    }
    let now = now_ms();
    let item = ListItem::new(item_ref_id, item_type, list_id);
    let list_item_id = item.list_item_id.clone();
    db.writer()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let Some(list) = repository::get_list(&tx, &item.list_id)? else {
                return Ok(Err(not_found("list", &item.list_id)));
            };
            if repository::insert_list_item(&tx, &item)? {
                let payload = JobPayload::ListItem {
                    list_id: list.list_id,
                    list_name: list.name,
                    item_ref_id: item.item_ref_id,
                    item_type: item.item_type,
                };
                enqueue_in(&tx, JobAction::ListItemAdd, &payload, now)?;
            }
            tx.commit()?;
            Ok::<Result<()>, rusqlite::Error>(Ok(()))
        })
        .await??;
    Ok(list_item_id)
}

pub async fn remove_list_item(db: &Database, list_item_id: &str) -> Result<()> {
    let item = ListItem::parse(list_item_id)
        .ok_or_else(|| Error::InvalidInput(format!("bad list item id {list_item_id:?}")))?;
    let now = now_ms();
    db.writer()
        .call(move |conn| {
            let tx = conn.transaction()?;
            if !repository::delete_list_item(&tx, &item.list_item_id)? {
                return Ok(Err(not_found("list item", &item.list_item_id)));
            }
            let list_name = repository::get_list(&tx, &item.list_id)?
                .map(|l| l.name)
                .unwrap_or_default();
            let payload = JobPayload::ListItem {
                list_id: item.list_id,
                list_name,
                item_ref_id: item.item_ref_id,
                item_type: item.item_type,
            };
            enqueue_in(&tx, JobAction::ListItemRemove, &payload, now)?;
            tx.commit()?;
            Ok::<Result<()>, rusqlite::Error>(Ok(()))
        })
        .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobQueue;

    async fn seed_show(db: &Database, tmdb_id: Option<i32>) -> (i64, i64) {
        db.writer()
            .call(move |conn| {
                let show_id = repository::insert_show(conn, tmdb_id, "Show S", None)?;
                let season_id = repository::insert_season(conn, show_id, 5)?;
                let e1 = repository::insert_episode(conn, show_id, season_id, 5, 1, "")?;
                repository::insert_episode(conn, show_id, season_id, 5, 2, "")?;
                Ok::<(i64, i64), rusqlite::Error>((show_id, e1))
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_watch_updates_local_and_queues_job() {
        let db = Database::open_memory().await.unwrap();
        let (_, episode_id) = seed_show(&db, Some(42)).await;

        set_episode_watched(&db, episode_id, WatchedState::Watched).await.unwrap();
        set_episode_watched(&db, episode_id, WatchedState::Watched).await.unwrap();

        let episode = db
            .reader()
            .call(move |conn| repository::get_episode(conn, episode_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(episode.plays, 2);

        let jobs = JobQueue::new(db).peek_all().await.unwrap();
        assert_eq!(jobs.len(), 2);
        let job = jobs[1].decode().unwrap();
        assert_eq!(job.action, JobAction::EpisodeWatched);
        assert_eq!(job.payload.label(), "Show S 5x01");
        match job.payload {
            JobPayload::Episodes { episodes, .. } => assert_eq!(episodes[0].plays, 2),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unmappable_show_changes_locally_only() {
        let db = Database::open_memory().await.unwrap();
        let (show_id, _) = seed_show(&db, None).await;

        let n = set_season_watched(&db, show_id, 5, WatchedState::Watched)
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert!(JobQueue::new(db).is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_episode_is_not_found() {
        let db = Database::open_memory().await.unwrap();
        let err = set_episode_watched(&db, 99, WatchedState::Watched)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(JobQueue::new(db).is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_movie_flag_creates_and_prunes() {
        let db = Database::open_memory().await.unwrap();

        set_movie_flag(&db, 603, "The Matrix", MovieFlag::Watchlist, true)
            .await
            .unwrap();
        let movie = db
            .reader()
            .call(|conn| repository::get_movie(conn, 603))
            .await
            .unwrap();
        assert!(movie.unwrap().in_watchlist);

        set_movie_flag(&db, 603, "The Matrix", MovieFlag::Watchlist, false)
            .await
            .unwrap();
        let movie = db
            .reader()
            .call(|conn| repository::get_movie(conn, 603))
            .await
            .unwrap();
        assert!(movie.is_none());

        let jobs = JobQueue::new(db).peek_all().await.unwrap();
        let actions: Vec<JobAction> = jobs.iter().map(|j| j.decode().unwrap().action).collect();
        assert_eq!(
            actions,
            vec![JobAction::MovieWatchlisted, JobAction::MovieUnwatchlisted]
        );
    }

    #[tokio::test]
    async fn test_rating_is_validated() {
        let db = Database::open_memory().await.unwrap();
        let (show_id, _) = seed_show(&db, Some(42)).await;
        assert!(matches!(
            rate_show(&db, show_id, 11).await,
            Err(Error::InvalidInput(_))
        ));
        rate_show(&db, show_id, 8).await.unwrap();
        let job = JobQueue::new(db).peek_all().await.unwrap()[0].decode().unwrap();
        assert_eq!(job.action, JobAction::RateShow);
    }

    #[tokio::test]
    async fn test_list_lifecycle_queues_jobs() {
        let db = Database::open_memory().await.unwrap();

        let first = create_list(&db, "Weekend").await.unwrap();
        let item_id = add_list_item(&db, &first, "1399", ListItemType::Show)
            .await
            .unwrap();
        assert_eq!(item_id, format!("1399-1-{first}"));
        // Adding the same item again changes nothing and queues nothing.
        add_list_item(&db, &first, "1399", ListItemType::Show)
            .await
            .unwrap();
        remove_list_item(&db, &item_id).await.unwrap();
        rename_list(&db, &first, "Binge").await.unwrap();
        remove_list(&db, &first).await.unwrap();

        let jobs = JobQueue::new(db).peek_all().await.unwrap();
        let actions: Vec<JobAction> = jobs.iter().map(|j| j.decode().unwrap().action).collect();
        assert_eq!(
            actions,
            vec![
                JobAction::ListSave,
                JobAction::ListItemAdd,
                JobAction::ListItemRemove,
                JobAction::ListSave,
                JobAction::ListRemove,
            ]
        );
    }
}
