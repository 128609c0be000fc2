use std::fmt;

use serde::Serialize;
use tokio::sync::watch;

/// Stages of a sync run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Stage {
    Idle,
    Jobs,
    CloudEpisodes,
    CloudShows,
    CloudMovies,
    CloudLists,
    Metadata,
    Tracker,
    TrackerEpisodes,
    TrackerRatings,
    TrackerMovies,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Jobs => "jobs",
            Stage::CloudEpisodes => "cloud_episodes",
            Stage::CloudShows => "cloud_shows",
            Stage::CloudMovies => "cloud_movies",
            Stage::CloudLists => "cloud_lists",
            Stage::Metadata => "metadata",
            Stage::Tracker => "tracker",
            Stage::TrackerEpisodes => "tracker_episodes",
            Stage::TrackerRatings => "tracker_ratings",
            Stage::TrackerMovies => "tracker_movies",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageError {
    pub stage: Option<Stage>,
    pub message: String,
}

/// What observers see of a running sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub stage: Stage,
    pub stage_errors: Vec<StageError>,
    /// First error worth surfacing to the user.
    pub important_error: Option<String>,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            stage: Stage::Idle,
            stage_errors: Vec::new(),
            important_error: None,
        }
    }
}

impl ProgressSnapshot {
    pub fn has_errors(&self) -> bool {
        !self.stage_errors.is_empty()
    }
}

/// Publisher side of the progress channel.
pub struct SyncProgress {
    tx: watch::Sender<ProgressSnapshot>,
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncProgress {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ProgressSnapshot::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.tx.borrow().clone()
    }

    /// Clear errors from a previous run.
    pub fn reset(&self) {
        self.tx.send_replace(ProgressSnapshot::default());
    }

    pub fn enter(&self, stage: Stage) {
        log::info!("Sync stage: {stage}");
        self.tx.send_modify(|s| s.stage = stage);
    }

    /// Record a failed stage. The current stage is attached to the error.
    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_modify(|s| {
            log::warn!("Stage {} failed: {message}", s.stage);
            s.stage_errors.push(StageError {
                stage: Some(s.stage),
                message,
            });
        });
    }

    /// Set the user facing error unless one is already set.
    pub fn set_important_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_modify(|s| {
            if s.important_error.is_none() {
                s.important_error = Some(message);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_important_error_wins() {
        let progress = SyncProgress::new();
        progress.set_important_error("Cloud: unauthorized");
        progress.set_important_error("Tracker: timeout");
        assert_eq!(
            progress.snapshot().important_error.as_deref(),
            Some("Cloud: unauthorized")
        );
    }

    #[tokio::test]
    async fn test_subscribers_see_stage_changes() {
        let progress = SyncProgress::new();
        let mut rx = progress.subscribe();

        progress.enter(Stage::CloudShows);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().stage, Stage::CloudShows);

        progress.record_error("boom");
        rx.changed().await.unwrap();
        let snap = rx.borrow().clone();
        assert_eq!(snap.stage_errors.len(), 1);
        assert_eq!(snap.stage_errors[0].stage, Some(Stage::CloudShows));
    }

    #[test]
    fn test_stage_order() {
        assert!(Stage::Jobs < Stage::CloudEpisodes);
        assert!(Stage::Metadata < Stage::Tracker);
        assert!(Stage::TrackerMovies < Stage::Done);
    }
}
