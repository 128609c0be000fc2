use std::collections::{HashMap, HashSet};

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::models::{Episode, List, ListItem, ListItemType, Movie, Show, WatchedState};

// ── Shows ──────────────────────────────────────────────────────────

const SHOW_COLUMNS: &str = "show_id, tmdb_id, title, favorite, notify, hidden, language,
    last_updated_ms, last_watched_ms, rating, cloud_merged";

fn show_from_row(row: &Row<'_>) -> Result<Show, rusqlite::Error> {
    Ok(Show {
        show_id: row.get(0)?,
        tmdb_id: row.get(1)?,
        title: row.get(2)?,
        favorite: row.get::<_, i32>(3)? != 0,
        notify: row.get::<_, i32>(4)? != 0,
        hidden: row.get::<_, i32>(5)? != 0,
        language: row.get(6)?,
        last_updated_ms: row.get(7)?,
        last_watched_ms: row.get(8)?,
        rating: row.get(9)?,
        cloud_merged: row.get::<_, i32>(10)? != 0,
    })
}

pub fn insert_show(
    conn: &Connection,
    tmdb_id: Option<i32>,
    title: &str,
    language: Option<&str>,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO shows (tmdb_id, title, language) VALUES (?1, ?2, ?3)",
        params![tmdb_id, title, language],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_show(conn: &Connection, show_id: i64) -> Result<Option<Show>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {SHOW_COLUMNS} FROM shows WHERE show_id = ?1"),
        params![show_id],
        show_from_row,
    )
    .optional()
}

pub fn show_by_tmdb_id(conn: &Connection, tmdb_id: i32) -> Result<Option<Show>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {SHOW_COLUMNS} FROM shows WHERE tmdb_id = ?1"),
        params![tmdb_id],
        show_from_row,
    )
    .optional()
}

pub fn list_shows(conn: &Connection) -> Result<Vec<Show>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!("SELECT {SHOW_COLUMNS} FROM shows ORDER BY show_id"))?;
    let rows = stmt.query_map([], show_from_row)?;
    rows.collect()
}

/// Catalog id → local row id for every show both remotes can address.
pub fn tmdb_id_map(conn: &Connection) -> Result<HashMap<i32, i64>, rusqlite::Error> {
    let mut stmt =
        conn.prepare("SELECT tmdb_id, show_id FROM shows WHERE tmdb_id IS NOT NULL")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

/// Mappable shows whose episode flags were never merged with the Cloud.
pub fn shows_pending_cloud_merge(conn: &Connection) -> Result<Vec<(i64, i32)>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT show_id, tmdb_id FROM shows
         WHERE cloud_merged = 0 AND tmdb_id IS NOT NULL ORDER BY show_id",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

/// Shows whose catalog data is older than `older_than_ms`.
pub fn show_ids_needing_update(
    conn: &Connection,
    older_than_ms: i64,
) -> Result<Vec<i64>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT show_id FROM shows WHERE last_updated_ms < ?1 ORDER BY last_updated_ms",
    )?;
    let rows = stmt.query_map(params![older_than_ms], |row| row.get(0))?;
    rows.collect()
}

pub fn set_show_last_updated(
    conn: &Connection,
    show_id: i64,
    updated_ms: i64,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE shows SET last_updated_ms = ?2 WHERE show_id = ?1",
        params![show_id, updated_ms],
    )?;
    Ok(())
}

pub fn set_show_last_watched(
    conn: &Connection,
    show_id: i64,
    watched_ms: i64,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE shows SET last_watched_ms = MAX(last_watched_ms, ?2) WHERE show_id = ?1",
        params![show_id, watched_ms],
    )?;
    Ok(())
}

pub fn set_show_flags(
    conn: &Connection,
    show_id: i64,
    favorite: Option<bool>,
    notify: Option<bool>,
    hidden: Option<bool>,
) -> Result<bool, rusqlite::Error> {
    let n = conn.execute(
        "UPDATE shows SET
            favorite = COALESCE(?2, favorite),
            notify = COALESCE(?3, notify),
            hidden = COALESCE(?4, hidden)
         WHERE show_id = ?1",
        params![
            show_id,
            favorite.map(|b| b as i32),
            notify.map(|b| b as i32),
            hidden.map(|b| b as i32)
        ],
    )?;
    Ok(n > 0)
}

// ── Seasons & Episodes ─────────────────────────────────────────────

pub fn insert_season(conn: &Connection, show_id: i64, number: i32) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO seasons (show_id, number) VALUES (?1, ?2)
         ON CONFLICT(show_id, number) DO NOTHING",
        params![show_id, number],
    )?;
    conn.query_row(
        "SELECT season_id FROM seasons WHERE show_id = ?1 AND number = ?2",
        params![show_id, number],
        |row| row.get(0),
    )
}

pub fn insert_episode(
    conn: &Connection,
    show_id: i64,
    season_id: i64,
    season_number: i32,
    number: i32,
    title: &str,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO episodes (show_id, season_id, season_number, number, title)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![show_id, season_id, season_number, number, title],
    )?;
    Ok(conn.last_insert_rowid())
}

const EPISODE_COLUMNS: &str =
    "episode_id, show_id, season_id, season_number, number, watched, plays, collected, rating";

fn episode_from_row(row: &Row<'_>) -> Result<Episode, rusqlite::Error> {
    Ok(Episode {
        episode_id: row.get(0)?,
        show_id: row.get(1)?,
        season_id: row.get(2)?,
        season_number: row.get(3)?,
        number: row.get(4)?,
        watched: WatchedState::from_code(row.get(5)?),
        plays: row.get(6)?,
        collected: row.get::<_, i32>(7)? != 0,
        rating: row.get(8)?,
    })
}

/// All episodes of a show ordered by season and number.
pub fn episodes_for_show(conn: &Connection, show_id: i64) -> Result<Vec<Episode>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EPISODE_COLUMNS} FROM episodes WHERE show_id = ?1
         ORDER BY season_number, number"
    ))?;
    let rows = stmt.query_map(params![show_id], episode_from_row)?;
    rows.collect()
}

pub fn find_episode(
    conn: &Connection,
    show_id: i64,
    season_number: i32,
    number: i32,
) -> Result<Option<Episode>, rusqlite::Error> {
    conn.query_row(
        &format!(
            "SELECT {EPISODE_COLUMNS} FROM episodes
             WHERE show_id = ?1 AND season_number = ?2 AND number = ?3"
        ),
        params![show_id, season_number, number],
        episode_from_row,
    )
    .optional()
}

pub fn get_episode(conn: &Connection, episode_id: i64) -> Result<Option<Episode>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {EPISODE_COLUMNS} FROM episodes WHERE episode_id = ?1"),
        params![episode_id],
        episode_from_row,
    )
    .optional()
}

/// (show_id, season_number, number) → (episode_id, rating) for every episode
/// with a user rating.
pub fn rated_episodes(
    conn: &Connection,
) -> Result<HashMap<(i64, i32, i32), (i64, i32)>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT show_id, season_number, number, episode_id, rating FROM episodes WHERE rating > 0",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            (row.get(0)?, row.get(1)?, row.get(2)?),
            (row.get(3)?, row.get(4)?),
        ))
    })?;
    rows.collect()
}

pub fn set_episode_watched(
    conn: &Connection,
    episode_id: i64,
    state: WatchedState,
    plays: i32,
) -> Result<bool, rusqlite::Error> {
    let plays = if state == WatchedState::Watched { plays.max(1) } else { 0 };
    let n = conn.execute(
        "UPDATE episodes SET watched = ?2, plays = ?3 WHERE episode_id = ?1",
        params![episode_id, state.code(), plays],
    )?;
    Ok(n > 0)
}

pub fn set_episode_collected(
    conn: &Connection,
    episode_id: i64,
    collected: bool,
) -> Result<bool, rusqlite::Error> {
    let n = conn.execute(
        "UPDATE episodes SET collected = ?2 WHERE episode_id = ?1",
        params![episode_id, collected as i32],
    )?;
    Ok(n > 0)
}

pub fn set_show_rating(conn: &Connection, show_id: i64, rating: i32) -> Result<bool, rusqlite::Error> {
    let n = conn.execute(
        "UPDATE shows SET rating = ?2 WHERE show_id = ?1",
        params![show_id, rating],
    )?;
    Ok(n > 0)
}

pub fn set_episode_rating(
    conn: &Connection,
    episode_id: i64,
    rating: i32,
) -> Result<bool, rusqlite::Error> {
    let n = conn.execute(
        "UPDATE episodes SET rating = ?2 WHERE episode_id = ?1",
        params![episode_id, rating],
    )?;
    Ok(n > 0)
}

// ── Movies ─────────────────────────────────────────────────────────

fn movie_from_row(row: &Row<'_>) -> Result<Movie, rusqlite::Error> {
    Ok(Movie {
        tmdb_id: row.get(0)?,
        title: row.get(1)?,
        in_collection: row.get::<_, i32>(2)? != 0,
        in_watchlist: row.get::<_, i32>(3)? != 0,
        watched: row.get::<_, i32>(4)? != 0,
        plays: row.get(5)?,
        rating: row.get(6)?,
    })
}

pub fn get_movie(conn: &Connection, tmdb_id: i32) -> Result<Option<Movie>, rusqlite::Error> {
    conn.query_row(
        "SELECT tmdb_id, title, in_collection, in_watchlist, watched, plays, rating
         FROM movies WHERE tmdb_id = ?1",
        params![tmdb_id],
        movie_from_row,
    )
    .optional()
}

pub fn all_movies(conn: &Connection) -> Result<HashMap<i32, Movie>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT tmdb_id, title, in_collection, in_watchlist, watched, plays, rating FROM movies",
    )?;
    let rows = stmt.query_map([], |row| {
        let movie = movie_from_row(row)?;
        Ok((movie.tmdb_id, movie))
    })?;
    rows.collect()
}

/// Insert or update a movie row with the given flags. The title is only
/// written on insert.
pub fn upsert_movie(conn: &Connection, movie: &Movie) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO movies (tmdb_id, title, in_collection, in_watchlist, watched, plays, rating)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(tmdb_id) DO UPDATE SET
            in_collection = excluded.in_collection,
            in_watchlist = excluded.in_watchlist,
            watched = excluded.watched,
            plays = excluded.plays,
            rating = excluded.rating",
        params![
            movie.tmdb_id,
            movie.title,
            movie.in_collection as i32,
            movie.in_watchlist as i32,
            movie.watched as i32,
            if movie.watched { movie.plays.max(1) } else { 0 },
            movie.rating,
        ],
    )?;
    Ok(())
}

pub fn delete_movie(conn: &Connection, tmdb_id: i32) -> Result<bool, rusqlite::Error> {
    let n = conn.execute("DELETE FROM movies WHERE tmdb_id = ?1", params![tmdb_id])?;
    Ok(n > 0)
}

// ── Lists ──────────────────────────────────────────────────────────

pub fn all_lists(conn: &Connection) -> Result<Vec<List>, rusqlite::Error> {
    let mut stmt =
        conn.prepare("SELECT list_id, name, sort_order FROM lists ORDER BY sort_order, name")?;
    let rows = stmt.query_map([], |row| {
        Ok(List {
            list_id: row.get(0)?,
            name: row.get(1)?,
            sort_order: row.get(2)?,
        })
    })?;
    rows.collect()
}

pub fn get_list(conn: &Connection, list_id: &str) -> Result<Option<List>, rusqlite::Error> {
    conn.query_row(
        "SELECT list_id, name, sort_order FROM lists WHERE list_id = ?1",
        params![list_id],
        |row| {
            Ok(List {
                list_id: row.get(0)?,
                name: row.get(1)?,
                sort_order: row.get(2)?,
            })
        },
    )
    .optional()
}

pub fn insert_list(conn: &Connection, list: &List) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO lists (list_id, name, sort_order) VALUES (?1, ?2, ?3)",
        params![list.list_id, list.name, list.sort_order],
    )?;
    Ok(())
}

pub fn update_list(conn: &Connection, list: &List) -> Result<bool, rusqlite::Error> {
    let n = conn.execute(
        "UPDATE lists SET name = ?2, sort_order = ?3 WHERE list_id = ?1",
        params![list.list_id, list.name, list.sort_order],
    )?;
    Ok(n > 0)
}

pub fn delete_list(conn: &Connection, list_id: &str) -> Result<bool, rusqlite::Error> {
    let n = conn.execute("DELETE FROM lists WHERE list_id = ?1", params![list_id])?;
    Ok(n > 0)
}

pub fn list_item_ids(conn: &Connection, list_id: &str) -> Result<HashSet<String>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT list_item_id FROM list_items WHERE list_id = ?1")?;
    let rows = stmt.query_map(params![list_id], |row| row.get(0))?;
    rows.collect()
}

pub fn list_items(conn: &Connection, list_id: &str) -> Result<Vec<ListItem>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT list_item_id, list_id, item_ref_id, item_type FROM list_items
         WHERE list_id = ?1 ORDER BY list_item_id",
    )?;
    let rows = stmt.query_map(params![list_id], |row| {
        let code: i32 = row.get(3)?;
        Ok(ListItem {
            list_item_id: row.get(0)?,
            list_id: row.get(1)?,
            item_ref_id: row.get(2)?,
            item_type: ListItemType::from_code(code).unwrap_or(ListItemType::Show),
        })
    })?;
    rows.collect()
}

pub fn insert_list_item(conn: &Connection, item: &ListItem) -> Result<bool, rusqlite::Error> {
    let n = conn.execute(
        "INSERT INTO list_items (list_item_id, list_id, item_ref_id, item_type)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(list_item_id) DO NOTHING",
        params![item.list_item_id, item.list_id, item.item_ref_id, item.item_type.code()],
    )?;
    Ok(n > 0)
}

pub fn delete_list_item(conn: &Connection, list_item_id: &str) -> Result<bool, rusqlite::Error> {
    let n = conn.execute(
        "DELETE FROM list_items WHERE list_item_id = ?1",
        params![list_item_id],
    )?;
    Ok(n > 0)
}

// ── Jobs ───────────────────────────────────────────────────────────

/// Raw queue row: (job_id, action, payload JSON, created_at_ms).
pub type JobRow = (i64, String, String, i64);

pub fn insert_job(
    conn: &Connection,
    action: &str,
    payload: &str,
    created_at_ms: i64,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO jobs (action, payload, created_at_ms) VALUES (?1, ?2, ?3)",
        params![action, payload, created_at_ms],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Queue contents, oldest first.
pub fn list_jobs(conn: &Connection) -> Result<Vec<JobRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT job_id, action, payload, created_at_ms FROM jobs ORDER BY job_id",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?;
    rows.collect()
}

pub fn delete_job(conn: &Connection, job_id: i64) -> Result<bool, rusqlite::Error> {
    let n = conn.execute("DELETE FROM jobs WHERE job_id = ?1", params![job_id])?;
    Ok(n > 0)
}

pub fn clear_jobs(conn: &Connection) -> Result<usize, rusqlite::Error> {
    conn.execute("DELETE FROM jobs", [])
}

pub fn count_jobs(conn: &Connection) -> Result<i64, rusqlite::Error> {
    conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))
}

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn delete_config(conn: &Connection, key: &str) -> Result<bool, rusqlite::Error> {
    let n = conn.execute("DELETE FROM app_config WHERE key = ?1", params![key])?;
    Ok(n > 0)
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Sync Runs ──────────────────────────────────────────────────────

pub fn insert_sync_run(conn: &Connection, sync_type: &str) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_runs (sync_type, status, started_at)
         VALUES (?1, 'running', datetime('now'))",
        params![sync_type],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn finish_sync_run(
    conn: &Connection,
    run_id: i64,
    status: &str,
    stage_errors: Option<&str>,
    error_message: Option<&str>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE sync_runs SET
            status = ?2, completed_at = datetime('now'),
            stage_errors = ?3, error_message = ?4
         WHERE id = ?1",
        params![run_id, status, stage_errors, error_message],
    )?;
    Ok(())
}

/// (sync_type, status, completed_at, error_message) of the latest finished run.
pub fn last_sync_run(
    conn: &Connection,
) -> Result<Option<(String, String, Option<String>, Option<String>)>, rusqlite::Error> {
    conn.query_row(
        "SELECT sync_type, status, completed_at, error_message FROM sync_runs
         WHERE completed_at IS NOT NULL ORDER BY id DESC LIMIT 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )
    .optional()
}
