//! Sync bookkeeping kept in `app_config`: per-family change cursors and
//! "has merged" flags.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::repository;
use crate::remote::Service;

/// Last applied remote change instant of one (service, family) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cursor {
    CloudEpisodes,
    CloudShows,
    CloudMovies,
    TrackerEpisodesWatched,
    TrackerEpisodesCollected,
    TrackerShowRatings,
    TrackerEpisodeRatings,
    TrackerMovieRatings,
    TrackerMoviesCollection,
    TrackerMoviesWatchlist,
    TrackerMoviesWatched,
}

impl Cursor {
    pub fn key(&self) -> &'static str {
        match self {
            Cursor::CloudEpisodes => "cloud.episodes.cursor",
            Cursor::CloudShows => "cloud.shows.cursor",
            Cursor::CloudMovies => "cloud.movies.cursor",
            Cursor::TrackerEpisodesWatched => "tracker.episodes.watched.cursor",
            Cursor::TrackerEpisodesCollected => "tracker.episodes.collected.cursor",
            Cursor::TrackerShowRatings => "tracker.ratings.shows.cursor",
            Cursor::TrackerEpisodeRatings => "tracker.ratings.episodes.cursor",
            Cursor::TrackerMovieRatings => "tracker.ratings.movies.cursor",
            Cursor::TrackerMoviesCollection => "tracker.movies.collection.cursor",
            Cursor::TrackerMoviesWatchlist => "tracker.movies.watchlist.cursor",
            Cursor::TrackerMoviesWatched => "tracker.movies.watched.cursor",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeFlag {
    CloudShows,
    CloudMovies,
    CloudLists,
    TrackerEpisodes,
    TrackerMovies,
    TrackerRatings,
}

impl MergeFlag {
    pub fn key(&self) -> &'static str {
        match self {
            MergeFlag::CloudShows => "cloud.shows.merged",
            MergeFlag::CloudMovies => "cloud.movies.merged",
            MergeFlag::CloudLists => "cloud.lists.merged",
            MergeFlag::TrackerEpisodes => "tracker.episodes.merged",
            MergeFlag::TrackerMovies => "tracker.movies.merged",
            MergeFlag::TrackerRatings => "tracker.ratings.merged",
        }
    }
}

/// A stored cursor. Unreadable values count as absent, forcing a full fetch.
pub fn get_cursor(conn: &Connection, cursor: Cursor) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    let Some(raw) = repository::get_config(conn, cursor.key())? else {
        return Ok(None);
    };
    match DateTime::parse_from_rfc3339(&raw) {
        Ok(dt) => Ok(Some(dt.with_timezone(&Utc))),
        Err(e) => {
            log::warn!("Ignoring unreadable cursor {}={raw}: {e}", cursor.key());
            Ok(None)
        }
    }
}

/// Move a cursor forward. Older or equal instants are ignored so a cursor
/// never goes back. Returns whether the stored value changed.
pub fn advance_cursor(
    conn: &Connection,
    cursor: Cursor,
    to: DateTime<Utc>,
) -> Result<bool, rusqlite::Error> {
    if let Some(current) = get_cursor(conn, cursor)? {
        if to <= current {
            return Ok(false);
        }
    }
    repository::set_config(conn, cursor.key(), &to.to_rfc3339())?;
    Ok(true)
}

pub fn is_merged(conn: &Connection, flag: MergeFlag) -> Result<bool, rusqlite::Error> {
    Ok(repository::get_config(conn, flag.key())?.as_deref() == Some("true"))
}

pub fn set_merged(conn: &Connection, flag: MergeFlag, merged: bool) -> Result<(), rusqlite::Error> {
    repository::set_config(conn, flag.key(), if merged { "true" } else { "false" })
}

/// Forget every cursor and merge flag of a service so the next run performs
/// the initial merge again. For the Cloud this includes the per-show flags.
pub fn reset_service(conn: &Connection, service: Service) -> Result<(), rusqlite::Error> {
    let prefix = match service {
        Service::Cloud => "cloud.%",
        Service::Tracker => "tracker.%",
    };
    conn.execute("DELETE FROM app_config WHERE key LIKE ?1", params![prefix])?;
    if service == Service::Cloud {
        conn.execute("UPDATE shows SET cloud_merged = 0", [])?;
    }
    log::info!("Reset sync state for {service}");
    Ok(())
}
