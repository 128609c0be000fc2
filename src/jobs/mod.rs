//! Durable outbound queue of user changes.
//!
//! A job is written in the same transaction as the local change it mirrors
//! and is removed only once every relevant configured service has either
//! accepted it or rejected it for good.

pub mod actions;
pub mod processor;
pub mod queue;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::remote::Service;
use crate::storage::models::ListItemType;

pub use processor::JobProcessor;
pub use queue::JobQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobAction {
    EpisodeWatched,
    EpisodeSkipped,
    EpisodeUnwatched,
    EpisodeCollected,
    EpisodeUncollected,
    MovieCollected,
    MovieUncollected,
    MovieWatchlisted,
    MovieUnwatchlisted,
    MovieWatched,
    MovieUnwatched,
    ShowFavorite,
    ShowNotify,
    ShowHidden,
    RateShow,
    RateEpisode,
    RateMovie,
    ListSave,
    ListRemove,
    ListItemAdd,
    ListItemRemove,
}

const ALL_ACTIONS: [JobAction; 21] = [
    JobAction::EpisodeWatched,
    JobAction::EpisodeSkipped,
    JobAction::EpisodeUnwatched,
    JobAction::EpisodeCollected,
    JobAction::EpisodeUncollected,
    JobAction::MovieCollected,
    JobAction::MovieUncollected,
    JobAction::MovieWatchlisted,
    JobAction::MovieUnwatchlisted,
    JobAction::MovieWatched,
    JobAction::MovieUnwatched,
    JobAction::ShowFavorite,
    JobAction::ShowNotify,
    JobAction::ShowHidden,
    JobAction::RateShow,
    JobAction::RateEpisode,
    JobAction::RateMovie,
    JobAction::ListSave,
    JobAction::ListRemove,
    JobAction::ListItemAdd,
    JobAction::ListItemRemove,
];

impl JobAction {
    /// Stored form in the `jobs.action` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobAction::EpisodeWatched => "episode_watched",
            JobAction::EpisodeSkipped => "episode_skipped",
            JobAction::EpisodeUnwatched => "episode_unwatched",
            JobAction::EpisodeCollected => "episode_collected",
            JobAction::EpisodeUncollected => "episode_uncollected",
            JobAction::MovieCollected => "movie_collected",
            JobAction::MovieUncollected => "movie_uncollected",
            JobAction::MovieWatchlisted => "movie_watchlisted",
            JobAction::MovieUnwatchlisted => "movie_unwatchlisted",
            JobAction::MovieWatched => "movie_watched",
            JobAction::MovieUnwatched => "movie_unwatched",
            JobAction::ShowFavorite => "show_favorite",
            JobAction::ShowNotify => "show_notify",
            JobAction::ShowHidden => "show_hidden",
            JobAction::RateShow => "rate_show",
            JobAction::RateEpisode => "rate_episode",
            JobAction::RateMovie => "rate_movie",
            JobAction::ListSave => "list_save",
            JobAction::ListRemove => "list_remove",
            JobAction::ListItemAdd => "list_item_add",
            JobAction::ListItemRemove => "list_item_remove",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        ALL_ACTIONS.iter().copied().find(|a| a.as_str() == s)
    }

    /// Human readable name used in failure notifications.
    pub fn display_name(&self) -> &'static str {
        match self {
            JobAction::EpisodeWatched | JobAction::MovieWatched => "Set watched",
            JobAction::EpisodeSkipped => "Skip",
            JobAction::EpisodeUnwatched | JobAction::MovieUnwatched => "Set not watched",
            JobAction::EpisodeCollected | JobAction::MovieCollected => "Add to collection",
            JobAction::EpisodeUncollected | JobAction::MovieUncollected => {
                "Remove from collection"
            }
            JobAction::MovieWatchlisted => "Add to watchlist",
            JobAction::MovieUnwatchlisted => "Remove from watchlist",
            JobAction::ShowFavorite => "Change favorite",
            JobAction::ShowNotify => "Change notifications",
            JobAction::ShowHidden => "Change hidden",
            JobAction::RateShow | JobAction::RateEpisode | JobAction::RateMovie => "Rate",
            JobAction::ListSave => "Save list",
            JobAction::ListRemove => "Remove list",
            JobAction::ListItemAdd => "Add to list",
            JobAction::ListItemRemove => "Remove from list",
        }
    }

    /// Whether `service` models the data this action changes.
    pub fn is_relevant_to(&self, service: Service) -> bool {
        match service {
            Service::Cloud => !matches!(
                self,
                JobAction::RateShow | JobAction::RateEpisode | JobAction::RateMovie
            ),
            Service::Tracker => !matches!(
                self,
                JobAction::ShowFavorite
                    | JobAction::ShowNotify
                    | JobAction::ShowHidden
                    | JobAction::ListSave
                    | JobAction::ListRemove
                    | JobAction::ListItemAdd
                    | JobAction::ListItemRemove
            ),
        }
    }
}

/// Episode addressed by its catalog coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeRef {
    pub season: i32,
    pub number: i32,
    /// Play count after the change. Zero unless watched.
    #[serde(default)]
    pub plays: i32,
}

/// Target ids and data of a job. Everything a service needs is captured at
/// enqueue time so later local edits never change what is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Episodes {
        show_tmdb_id: i32,
        show_title: String,
        episodes: Vec<EpisodeRef>,
    },
    Movie {
        tmdb_id: i32,
        title: String,
        #[serde(default)]
        plays: i32,
    },
    ShowFlag {
        show_tmdb_id: i32,
        show_title: String,
        value: bool,
    },
    ShowRating {
        show_tmdb_id: i32,
        show_title: String,
        rating: i32,
    },
    EpisodeRating {
        show_tmdb_id: i32,
        show_title: String,
        season: i32,
        number: i32,
        rating: i32,
    },
    MovieRating {
        tmdb_id: i32,
        title: String,
        rating: i32,
    },
    List {
        list_id: String,
        name: String,
        sort_order: i32,
    },
    ListItem {
        list_id: String,
        list_name: String,
        item_ref_id: String,
        item_type: ListItemType,
    },
}

impl JobPayload {
    /// Short description of the affected item, e.g. `Show S 5x01`.
    pub fn label(&self) -> String {
        match self {
            JobPayload::Episodes {
                show_title,
                episodes,
                ..
            } => match episodes.as_slice() {
                [] => show_title.clone(),
                [ep] => format!("{show_title} {}x{:02}", ep.season, ep.number),
                [first, rest @ ..] => format!(
                    "{show_title} {}x{:02} (+{})",
                    first.season,
                    first.number,
                    rest.len()
                ),
            },
            JobPayload::EpisodeRating {
                show_title,
                season,
                number,
                ..
            } => format!("{show_title} {season}x{number:02}"),
            JobPayload::Movie { title, .. } | JobPayload::MovieRating { title, .. } => {
                title.clone()
            }
            JobPayload::ShowFlag { show_title, .. } | JobPayload::ShowRating { show_title, .. } => {
                show_title.clone()
            }
            JobPayload::List { name, .. } => name.clone(),
            JobPayload::ListItem {
                list_name,
                item_ref_id,
                ..
            } => format!("{item_ref_id} in {list_name}"),
        }
    }
}

/// A decoded queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub job_id: i64,
    pub action: JobAction,
    pub payload: JobPayload,
    pub created_at_ms: i64,
}

impl Job {
    pub fn created_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.created_at_ms)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// A queue row as stored. Decoding can fail for rows written by a newer
/// version; such rows can never be sent and are dropped by the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawJob {
    pub job_id: i64,
    pub action: String,
    pub payload: String,
    pub created_at_ms: i64,
}

impl RawJob {
    pub fn decode(&self) -> Result<Job> {
        let action = JobAction::parse(&self.action)
            .ok_or_else(|| Error::JobPayload(format!("unknown action {}", self.action)))?;
        let payload: JobPayload = serde_json::from_str(&self.payload)?;
        Ok(Job {
            job_id: self.job_id,
            action,
            payload,
            created_at_ms: self.created_at_ms,
        })
    }
}

/// What the user is told when a job is dropped after a terminal failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub action: String,
    pub item: String,
    pub error: String,
}

/// Receives user-visible job failures.
pub trait Notifier: Send + Sync {
    fn job_failed(&self, failure: &JobFailure);
}

/// Writes failures to the log only.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn job_failed(&self, failure: &JobFailure) {
        log::warn!(
            "{} failed for {}: {}",
            failure.action,
            failure.item,
            failure.error
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_round_trip_and_relevance() {
        for action in ALL_ACTIONS {
            assert_eq!(JobAction::parse(action.as_str()), Some(action));
            // Every action goes somewhere.
            assert!(
                action.is_relevant_to(Service::Cloud) || action.is_relevant_to(Service::Tracker)
            );
        }
        assert!(!JobAction::RateEpisode.is_relevant_to(Service::Cloud));
        assert!(!JobAction::ShowFavorite.is_relevant_to(Service::Tracker));
        assert!(JobAction::MovieWatchlisted.is_relevant_to(Service::Tracker));
        assert_eq!(JobAction::parse("nope"), None);
    }

    #[test]
    fn test_episode_label() {
        let payload = JobPayload::Episodes {
            show_tmdb_id: 1,
            show_title: "Show S".into(),
            episodes: vec![EpisodeRef {
                season: 5,
                number: 1,
                plays: 1,
            }],
        };
        assert_eq!(payload.label(), "Show S 5x01");
    }

    #[test]
    fn test_payload_json_is_tagged() {
        let payload = JobPayload::ShowFlag {
            show_tmdb_id: 7,
            show_title: "X".into(),
            value: true,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "show_flag");
        assert_eq!(json["value"], true);
    }

    #[test]
    fn test_decode_rejects_unknown_action() {
        let raw = RawJob {
            job_id: 1,
            action: "teleport".into(),
            payload: "{}".into(),
            created_at_ms: 0,
        };
        assert!(matches!(raw.decode(), Err(Error::JobPayload(_))));
    }
}
