use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::{EpisodeRef, Job, JobAction, JobFailure, JobPayload, JobQueue, RawJob};
use crate::error::{Error, Result};
use crate::remote::cloud::{CloudEpisode, CloudList, CloudListItem, CloudMovie, CloudShow, MAX_BATCH_SIZE};
use crate::remote::tracker::{
    SyncEndpoint, SyncEpisode, SyncItems, SyncMovie, SyncSeason, SyncShow, TrackerIds,
};
use crate::remote::{CloudClient, RemoteError, Service, TrackerClient};
use crate::storage::models::{ListItem, WatchedState};
use crate::sync::rate_limit::retry_remote;
use crate::sync::SyncContext;

/// Drains the job queue in insertion order.
pub struct JobProcessor<'a> {
    ctx: &'a SyncContext,
    queue: JobQueue,
}

/// Result of sending one job everywhere it is relevant.
enum Delivery {
    Delivered,
    /// Rejected for good by at least one service; carries the first error.
    Rejected(String),
    /// Will succeed later, maybe. Processing stops here.
    Retry(Error),
}

impl<'a> JobProcessor<'a> {
    pub fn new(ctx: &'a SyncContext) -> Self {
        Self {
            queue: JobQueue::new(ctx.db.clone()),
            ctx,
        }
    }

    /// Send queued jobs, oldest first.
    ///
    /// Returns `Ok(false)` when processing stopped at a retryable failure;
    /// that job and all later ones stay queued. Offline and unauthorized
    /// failures are returned as errors.
    pub async fn process(&self) -> Result<bool> {
        if self.ctx.cloud.is_none() && self.ctx.tracker.is_none() {
            let purged = self.queue.clear().await?;
            if purged > 0 {
                log::info!("No service configured, dropped {purged} queued jobs");
            }
            return Ok(true);
        }

        let jobs = self.queue.peek_all().await?;
        if jobs.is_empty() {
            return Ok(true);
        }
        log::info!("Processing {} queued jobs", jobs.len());

        let mut sent = 0usize;
        for raw in jobs {
            self.ctx.check_continue()?;

            let job = match raw.decode() {
                Ok(job) => job,
                Err(e) => {
                    self.drop_undecodable(&raw, &e).await?;
                    continue;
                }
            };

            match self.deliver(&job).await? {
                Delivery::Delivered => {
                    log::debug!("Job {} ({}) delivered", job.job_id, job.action.as_str());
                }
                Delivery::Rejected(error) => {
                    let failure = JobFailure {
                        action: job.action.display_name().to_string(),
                        item: job.payload.label(),
                        error,
                    };
                    log::warn!(
                        "Job {} dropped: {} {} ({})",
                        job.job_id,
                        failure.action,
                        failure.item,
                        failure.error
                    );
                    self.ctx.notifier.job_failed(&failure);
                }
                Delivery::Retry(e) => {
                    log::warn!(
                        "Job {} ({}) will be retried: {e}",
                        job.job_id,
                        job.action.as_str()
                    );
                    return Ok(false);
                }
            }
            self.queue.remove(job.job_id).await?;
            sent += 1;
        }
        log::info!("Processed {sent} jobs");
        Ok(true)
    }

    async fn drop_undecodable(&self, raw: &RawJob, e: &Error) -> Result<()> {
        log::warn!("Dropping unreadable job {} ({}): {e}", raw.job_id, raw.action);
        self.ctx.notifier.job_failed(&JobFailure {
            action: raw.action.clone(),
            item: format!("job {}", raw.job_id),
            error: e.to_string(),
        });
        self.queue.remove(raw.job_id).await?;
        Ok(())
    }

    async fn deliver(&self, job: &Job) -> Result<Delivery> {
        let mut rejected: Option<String> = None;

        // Cloud before Tracker.
        if let Some(cloud) = self.ctx.cloud.as_deref() {
            if job.action.is_relevant_to(Service::Cloud) {
                match send_to_cloud(cloud, job).await {
                    Ok(()) => {}
                    Err(e) if e.is_fatal_to_run() => return Err(e),
                    Err(e) if is_terminal(&e) => {
                        rejected.get_or_insert_with(|| e.to_string());
                    }
                    Err(e) => return Ok(Delivery::Retry(e)),
                }
            }
        }

        if let Some(tracker) = self.ctx.tracker.as_deref() {
            if job.action.is_relevant_to(Service::Tracker) {
                match send_to_tracker(tracker, job).await {
                    Ok(()) => {}
                    Err(e) if e.is_fatal_to_run() => return Err(e),
                    Err(e) if is_terminal(&e) => {
                        rejected.get_or_insert_with(|| e.to_string());
                    }
                    Err(e) => return Ok(Delivery::Retry(e)),
                }
            }
        }

        Ok(match rejected {
            Some(error) => Delivery::Rejected(error),
            None => Delivery::Delivered,
        })
    }
}

/// Failures that retrying can never fix.
fn is_terminal(e: &Error) -> bool {
    match e {
        Error::Remote { source, .. } => source.is_terminal(),
        Error::JobPayload(_) => true,
        _ => false,
    }
}

fn mismatch(job: &Job) -> Error {
    Error::JobPayload(format!(
        "action {} cannot carry this payload",
        job.action.as_str()
    ))
}

// ── Cloud ──────────────────────────────────────────────────────────

async fn send_to_cloud(cloud: &dyn CloudClient, job: &Job) -> Result<()> {
    match (&job.action, &job.payload) {
        (
            JobAction::EpisodeWatched
            | JobAction::EpisodeSkipped
            | JobAction::EpisodeUnwatched
            | JobAction::EpisodeCollected
            | JobAction::EpisodeUncollected,
            JobPayload::Episodes {
                show_tmdb_id,
                episodes,
                ..
            },
        ) => {
            let flags: Vec<CloudEpisode> = episodes
                .iter()
                .map(|ep| cloud_episode(job.action, *show_tmdb_id, ep))
                .collect();
            for chunk in flags.chunks(MAX_BATCH_SIZE) {
                retry_remote!(Service::Cloud, cloud.save_episodes(chunk.to_vec()))?;
            }
            Ok(())
        }
        (
            JobAction::MovieCollected
            | JobAction::MovieUncollected
            | JobAction::MovieWatchlisted
            | JobAction::MovieUnwatchlisted
            | JobAction::MovieWatched
            | JobAction::MovieUnwatched,
            JobPayload::Movie { tmdb_id, plays, .. },
        ) => {
            let mut movie = CloudMovie {
                tmdb_id: *tmdb_id,
                ..Default::default()
            };
            match job.action {
                JobAction::MovieCollected => movie.is_in_collection = Some(true),
                JobAction::MovieUncollected => movie.is_in_collection = Some(false),
                JobAction::MovieWatchlisted => movie.is_in_watchlist = Some(true),
                JobAction::MovieUnwatchlisted => movie.is_in_watchlist = Some(false),
                JobAction::MovieWatched => {
                    movie.is_watched = Some(true);
                    movie.plays = Some((*plays).max(1));
                }
                _ => {
                    movie.is_watched = Some(false);
                    movie.plays = Some(0);
                }
            }
            retry_remote!(Service::Cloud, cloud.save_movies(vec![movie.clone()]))?;
            Ok(())
        }
        (
            JobAction::ShowFavorite | JobAction::ShowNotify | JobAction::ShowHidden,
            JobPayload::ShowFlag {
                show_tmdb_id,
                value,
                ..
            },
        ) => {
            let mut show = CloudShow {
                tmdb_id: *show_tmdb_id,
                ..Default::default()
            };
            match job.action {
                JobAction::ShowFavorite => show.is_favorite = Some(*value),
                JobAction::ShowNotify => show.notify = Some(*value),
                _ => show.is_hidden = Some(*value),
            }
            retry_remote!(Service::Cloud, cloud.save_shows(vec![show.clone()]))?;
            Ok(())
        }
        (
            JobAction::ListSave,
            JobPayload::List {
                list_id,
                name,
                sort_order,
            },
        ) => {
            let list = CloudList {
                list_id: list_id.clone(),
                name: name.clone(),
                order: Some(*sort_order),
                items: Vec::new(),
            };
            retry_remote!(Service::Cloud, cloud.save_lists(vec![list.clone()]))?;
            Ok(())
        }
        (JobAction::ListRemove, JobPayload::List { list_id, .. }) => {
            retry_remote!(Service::Cloud, cloud.remove_list(list_id.clone()))?;
            Ok(())
        }
        (
            JobAction::ListItemAdd,
            JobPayload::ListItem {
                list_id,
                list_name,
                item_ref_id,
                item_type,
            },
        ) => {
            let list = CloudList {
                list_id: list_id.clone(),
                name: list_name.clone(),
                order: None,
                items: vec![CloudListItem {
                    list_item_id: ListItem::composite_id(item_ref_id, *item_type, list_id),
                }],
            };
            retry_remote!(Service::Cloud, cloud.save_lists(vec![list.clone()]))?;
            Ok(())
        }
        (
            JobAction::ListItemRemove,
            JobPayload::ListItem {
                list_id,
                item_ref_id,
                item_type,
                ..
            },
        ) => {
            let item_id = ListItem::composite_id(item_ref_id, *item_type, list_id);
            retry_remote!(
                Service::Cloud,
                cloud.remove_list_items(list_id.clone(), vec![item_id.clone()])
            )?;
            Ok(())
        }
        _ => Err(mismatch(job)),
    }
}

fn cloud_episode(action: JobAction, show_tmdb_id: i32, ep: &EpisodeRef) -> CloudEpisode {
    let mut flags = CloudEpisode {
        show_tmdb_id,
        season_number: ep.season,
        episode_number: ep.number,
        ..Default::default()
    };
    match action {
        JobAction::EpisodeWatched => {
            flags.watched_flag = Some(WatchedState::Watched.code());
            flags.plays = Some(ep.plays.max(1));
        }
        JobAction::EpisodeSkipped => {
            flags.watched_flag = Some(WatchedState::Skipped.code());
            flags.plays = Some(0);
        }
        JobAction::EpisodeUnwatched => {
            flags.watched_flag = Some(WatchedState::Unwatched.code());
            flags.plays = Some(0);
        }
        JobAction::EpisodeCollected => flags.is_in_collection = Some(true),
        _ => flags.is_in_collection = Some(false),
    }
    flags
}

// ── Tracker ────────────────────────────────────────────────────────

async fn send_to_tracker(tracker: &dyn TrackerClient, job: &Job) -> Result<()> {
    let Some((endpoint, items)) = tracker_request(job)? else {
        return Ok(());
    };
    let response = retry_remote!(Service::Tracker, tracker.post(endpoint, items.clone()))?;
    if !response.not_found.is_empty() {
        return Err(Error::remote(
            Service::Tracker,
            RemoteError::NotFound(job.payload.label()),
        ));
    }
    Ok(())
}

/// The Tracker call for a job, or `None` if the Tracker has nothing to
/// store for it.
fn tracker_request(job: &Job) -> Result<Option<(SyncEndpoint, SyncItems)>> {
    let request = match (&job.action, &job.payload) {
        (JobAction::EpisodeSkipped, JobPayload::Episodes { .. }) => None,
        (
            JobAction::EpisodeWatched
            | JobAction::EpisodeUnwatched
            | JobAction::EpisodeCollected
            | JobAction::EpisodeUncollected,
            JobPayload::Episodes {
                show_tmdb_id,
                episodes,
                ..
            },
        ) => {
            let (endpoint, watched_at) = match job.action {
                JobAction::EpisodeWatched => (SyncEndpoint::HistoryAdd, Some(job.created_at())),
                JobAction::EpisodeUnwatched => (SyncEndpoint::HistoryRemove, None),
                JobAction::EpisodeCollected => (SyncEndpoint::CollectionAdd, None),
                _ => (SyncEndpoint::CollectionRemove, None),
            };
            let show = nested_show(*show_tmdb_id, episodes, watched_at);
            Some((
                endpoint,
                SyncItems {
                    shows: vec![show],
                    movies: Vec::new(),
                },
            ))
        }
        (
            JobAction::MovieCollected
            | JobAction::MovieUncollected
            | JobAction::MovieWatchlisted
            | JobAction::MovieUnwatchlisted
            | JobAction::MovieWatched
            | JobAction::MovieUnwatched,
            JobPayload::Movie { tmdb_id, .. },
        ) => {
            let endpoint = match job.action {
                JobAction::MovieCollected => SyncEndpoint::CollectionAdd,
                JobAction::MovieUncollected => SyncEndpoint::CollectionRemove,
                JobAction::MovieWatchlisted => SyncEndpoint::WatchlistAdd,
                JobAction::MovieUnwatchlisted => SyncEndpoint::WatchlistRemove,
                JobAction::MovieWatched => SyncEndpoint::HistoryAdd,
                _ => SyncEndpoint::HistoryRemove,
            };
            let watched_at = (job.action == JobAction::MovieWatched).then(|| job.created_at());
            Some((
                endpoint,
                SyncItems {
                    shows: Vec::new(),
                    movies: vec![SyncMovie {
                        ids: TrackerIds::tmdb(*tmdb_id),
                        watched_at,
                        rating: None,
                    }],
                },
            ))
        }
        (
            JobAction::RateShow,
            JobPayload::ShowRating {
                show_tmdb_id,
                rating,
                ..
            },
        ) => Some((
            rating_endpoint(*rating),
            SyncItems {
                shows: vec![SyncShow {
                    ids: TrackerIds::tmdb(*show_tmdb_id),
                    rating: rating_value(*rating),
                    seasons: Vec::new(),
                }],
                movies: Vec::new(),
            },
        )),
        (
            JobAction::RateEpisode,
            JobPayload::EpisodeRating {
                show_tmdb_id,
                season,
                number,
                rating,
                ..
            },
        ) => Some((
            rating_endpoint(*rating),
            SyncItems {
                shows: vec![SyncShow {
                    ids: TrackerIds::tmdb(*show_tmdb_id),
                    rating: None,
                    seasons: vec![SyncSeason {
                        number: *season,
                        episodes: vec![SyncEpisode {
                            number: *number,
                            watched_at: None,
                            rating: rating_value(*rating),
                        }],
                    }],
                }],
                movies: Vec::new(),
            },
        )),
        (JobAction::RateMovie, JobPayload::MovieRating { tmdb_id, rating, .. }) => Some((
            rating_endpoint(*rating),
            SyncItems {
                shows: Vec::new(),
                movies: vec![SyncMovie {
                    ids: TrackerIds::tmdb(*tmdb_id),
                    watched_at: None,
                    rating: rating_value(*rating),
                }],
            },
        )),
        _ => return Err(mismatch(job)),
    };
    Ok(request)
}

/// Zero clears a rating.
fn rating_endpoint(rating: i32) -> SyncEndpoint {
    if rating > 0 {
        SyncEndpoint::RatingsAdd
    } else {
        SyncEndpoint::RatingsRemove
    }
}

fn rating_value(rating: i32) -> Option<i32> {
    (rating > 0).then_some(rating)
}

/// One show with its episodes grouped by season. A job sends one entry per
/// episode: the play it records.
fn nested_show(
    show_tmdb_id: i32,
    episodes: &[EpisodeRef],
    watched_at: Option<DateTime<Utc>>,
) -> SyncShow {
    let mut seasons: BTreeMap<i32, Vec<SyncEpisode>> = BTreeMap::new();
    for ep in episodes {
        seasons.entry(ep.season).or_default().push(SyncEpisode {
            number: ep.number,
            watched_at,
            rating: None,
        });
    }
    SyncShow {
        ids: TrackerIds::tmdb(show_tmdb_id),
        rating: None,
        seasons: seasons
            .into_iter()
            .map(|(number, episodes)| SyncSeason { number, episodes })
            .collect(),
    }
}
