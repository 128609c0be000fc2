use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::remote::cloud::{CloudEpisode, MAX_BATCH_SIZE};
use crate::remote::{CloudClient, Service};
use crate::storage::models::{Episode, WatchedState};
use crate::storage::settings::Cursor;
use crate::storage::{repository, BatchOp};
use crate::sync::rate_limit::retry_remote;
use crate::sync::{apply_ops, family_failed, read_cursor, store_cursor, ShowMap, SyncContext};

const FAMILY: &str = "Cloud episodes";

/// Episode flags against the Cloud. Each show is merged once on its own;
/// after that only changes are downloaded.
pub struct CloudEpisodeSync<'a> {
    ctx: &'a SyncContext,
    cloud: &'a dyn CloudClient,
}

impl<'a> CloudEpisodeSync<'a> {
    pub fn new(ctx: &'a SyncContext, cloud: &'a dyn CloudClient) -> Self {
        Self { ctx, cloud }
    }

    /// Merge shows that were never merged, then download changes.
    pub async fn sync(&self, show_map: &ShowMap) -> Result<bool> {
        let pending = self
            .ctx
            .db
            .reader()
            .call(|conn| repository::shows_pending_cloud_merge(conn))
            .await?;
        if !pending.is_empty() {
            log::info!("Merging episode flags of {} shows with the Cloud", pending.len());
        }
        for (show_id, tmdb_id) in pending {
            self.ctx.check_continue()?;
            if !self.download_flags(show_id, tmdb_id).await? {
                return Ok(false);
            }
            if !self.upload_flags(show_id, tmdb_id).await? {
                return Ok(false);
            }
            apply_ops(
                &self.ctx.db,
                FAMILY,
                vec![BatchOp::SetShowCloudMerged {
                    show_id,
                    merged: true,
                }],
            )
            .await?;
        }

        self.download_changed_flags(show_map).await
    }

    /// Apply every episode change since the cursor, mirroring the Cloud.
    /// The cursor moves only after the last page.
    pub async fn download_changed_flags(&self, show_map: &ShowMap) -> Result<bool> {
        let since = read_cursor(&self.ctx.db, Cursor::CloudEpisodes).await?;

        let mut local: HashMap<i64, HashMap<(i32, i32), Episode>> = HashMap::new();
        let mut newest: Option<DateTime<Utc>> = None;
        let mut page_cursor: Option<String> = None;
        loop {
            self.ctx.check_continue()?;
            let page = match retry_remote!(
                Service::Cloud,
                self.cloud.episodes_changed(since, page_cursor.clone())
            ) {
                Ok(page) => page,
                Err(e) => return family_failed(self.ctx, FAMILY, e),
            };

            let mut ops = Vec::new();
            for remote in &page.items {
                newest = newest.max(remote.updated_at);
                let Some(&show_id) = show_map.get(&remote.show_tmdb_id) else {
                    continue;
                };
                if !local.contains_key(&show_id) {
                    local.insert(show_id, self.load_episodes(show_id).await?);
                }
                let episode = local
                    .get_mut(&show_id)
                    .and_then(|eps| eps.get_mut(&(remote.season_number, remote.episode_number)));
                if let Some(episode) = episode {
                    mirror_flags(episode, remote, &mut ops);
                }
            }

            apply_ops(&self.ctx.db, FAMILY, ops).await?;

            match page.next_cursor {
                Some(next) => page_cursor = Some(next),
                None => break,
            }
        }
        store_cursor(&self.ctx.db, Cursor::CloudEpisodes, newest).await?;
        Ok(true)
    }

    /// Initial merge, download half: only ever sets flags.
    pub async fn download_flags(&self, show_id: i64, tmdb_id: i32) -> Result<bool> {
        let mut local = self.load_episodes(show_id).await?;
        let mut ops = Vec::new();
        let mut page_cursor: Option<String> = None;
        loop {
            self.ctx.check_continue()?;
            let page = match retry_remote!(
                Service::Cloud,
                self.cloud.show_episodes(tmdb_id, page_cursor.clone())
            ) {
                Ok(page) => page,
                Err(e) => return family_failed(self.ctx, FAMILY, e),
            };
            for remote in &page.items {
                if let Some(episode) =
                    local.get_mut(&(remote.season_number, remote.episode_number))
                {
                    merge_flags(episode, remote, &mut ops);
                }
            }
            match page.next_cursor {
                Some(next) => page_cursor = Some(next),
                None => break,
            }
        }
        apply_ops(&self.ctx.db, FAMILY, ops).await?;
        Ok(true)
    }

    /// Initial merge, upload half: every flagged local episode.
    pub async fn upload_flags(&self, show_id: i64, tmdb_id: i32) -> Result<bool> {
        let episodes = self
            .ctx
            .db
            .reader()
            .call(move |conn| repository::episodes_for_show(conn, show_id))
            .await?;
        let flags: Vec<CloudEpisode> = episodes
            .iter()
            .filter(|e| e.has_flags())
            .map(|e| upload_flags_of(tmdb_id, e))
            .collect();

        for chunk in flags.chunks(MAX_BATCH_SIZE) {
            self.ctx.check_continue()?;
            if let Err(e) = retry_remote!(Service::Cloud, self.cloud.save_episodes(chunk.to_vec())) {
                return family_failed(self.ctx, FAMILY, e);
            }
        }
        log::debug!("Uploaded {} flagged episodes of show {show_id}", flags.len());
        Ok(true)
    }

    async fn load_episodes(&self, show_id: i64) -> Result<HashMap<(i32, i32), Episode>> {
        let episodes = self
            .ctx
            .db
            .reader()
            .call(move |conn| repository::episodes_for_show(conn, show_id))
            .await?;
        Ok(episodes
            .into_iter()
            .map(|e| ((e.season_number, e.number), e))
            .collect())
    }
}

fn remote_state(remote: &CloudEpisode) -> Option<(WatchedState, i32)> {
    let state = WatchedState::from_code(remote.watched_flag?);
    let plays = match state {
        WatchedState::Watched => remote.plays.unwrap_or(1).max(1),
        _ => 0,
    };
    Some((state, plays))
}

/// Steady state: the Cloud value replaces the local one. `episode` is
/// updated so later pages compare against the new value.
fn mirror_flags(episode: &mut Episode, remote: &CloudEpisode, ops: &mut Vec<BatchOp>) {
    if let Some((state, plays)) = remote_state(remote) {
        if episode.watched != state || episode.plays != plays {
            ops.push(BatchOp::SetEpisodeWatched {
                episode_id: episode.episode_id,
                state,
                plays,
            });
            episode.watched = state;
            episode.plays = plays;
        }
    }
    if let Some(collected) = remote.is_in_collection {
        if episode.collected != collected {
            ops.push(BatchOp::SetEpisodeCollected {
                episode_id: episode.episode_id,
                collected,
            });
            episode.collected = collected;
        }
    }
}

/// Initial merge: remote flags are added to local ones, never removed.
fn merge_flags(episode: &mut Episode, remote: &CloudEpisode, ops: &mut Vec<BatchOp>) {
    match remote_state(remote) {
        Some((WatchedState::Watched, plays)) if !episode.is_watched() || episode.plays < plays => {
            ops.push(BatchOp::SetEpisodeWatched {
                episode_id: episode.episode_id,
                state: WatchedState::Watched,
                plays,
            });
            episode.watched = WatchedState::Watched;
            episode.plays = plays;
        }
        Some((WatchedState::Skipped, _)) if episode.watched == WatchedState::Unwatched => {
            ops.push(BatchOp::SetEpisodeWatched {
                episode_id: episode.episode_id,
                state: WatchedState::Skipped,
                plays: 0,
            });
            episode.watched = WatchedState::Skipped;
        }
        _ => {}
    }
    if remote.is_in_collection == Some(true) && !episode.collected {
        ops.push(BatchOp::SetEpisodeCollected {
            episode_id: episode.episode_id,
            collected: true,
        });
        episode.collected = true;
    }
}

fn upload_flags_of(show_tmdb_id: i32, episode: &Episode) -> CloudEpisode {
    let watched = episode.watched != WatchedState::Unwatched;
    CloudEpisode {
        show_tmdb_id,
        season_number: episode.season_number,
        episode_number: episode.number,
        watched_flag: watched.then(|| episode.watched.code()),
        plays: watched.then_some(episode.plays),
        is_in_collection: episode.collected.then_some(true),
        updated_at: None,
    }
}
