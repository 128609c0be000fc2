//! Reconcilers for the watch tracker. The tracker only offers full
//! snapshots, so each family is fetched when its last-activity instant has
//! moved past the stored cursor, or when the family is merged for the
//! first time.

pub mod episodes;
pub mod movies;
pub mod ratings;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::remote::tracker::{SyncEndpoint, SyncItems};
use crate::remote::{Service, TrackerClient};
use crate::sync::rate_limit::retry_remote;

pub use episodes::TrackerEpisodeSync;
pub use movies::TrackerMovieSync;
pub use ratings::TrackerRatingSync;

/// Whether a snapshot has to be fetched.
pub fn needs_fetch(
    cursor: Option<DateTime<Utc>>,
    remote_changed_at: Option<DateTime<Utc>>,
    is_initial_merge: bool,
) -> bool {
    if is_initial_merge {
        return true;
    }
    match (cursor, remote_changed_at) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(cursor), Some(changed)) => changed > cursor,
    }
}

/// Send one add/remove request. Items the tracker cannot resolve are
/// logged and otherwise ignored.
pub(crate) async fn send(
    tracker: &dyn TrackerClient,
    endpoint: SyncEndpoint,
    items: SyncItems,
) -> Result<()> {
    if items.is_empty() {
        return Ok(());
    }
    let response = retry_remote!(Service::Tracker, tracker.post(endpoint, items.clone()))?;
    if !response.not_found.is_empty() {
        log::warn!(
            "Tracker did not find {} shows, {} episodes and {} movies sent to {endpoint:?}",
            response.not_found.shows.len(),
            response.not_found.episodes.len(),
            response.not_found.movies.len()
        );
    }
    Ok(())
}
