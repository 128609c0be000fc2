//! In-memory remotes for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::jobs::{JobFailure, Notifier};
use crate::remote::cloud::{CloudEpisode, CloudList, CloudMovie, CloudShow};
use crate::remote::tracker::{
    LastActivity, MovieSnapshot, RatedItem, RatingKind, ShowSnapshot, SyncEndpoint, SyncItems,
    SyncResponse, TrackerMovieEntry, TrackerShowEntry,
};
use crate::remote::{CloudClient, Page, RemoteError, RemoteResult, TrackerClient};
use crate::sync::Catalog;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Cut `items` into pages; the cursor is the offset of the next page.
fn paginate<T: Clone>(items: Vec<T>, cursor: Option<String>, page_size: usize) -> Page<T> {
    let start: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
    let end = (start + page_size).min(items.len());
    let page = items.get(start..end).map(<[T]>::to_vec).unwrap_or_default();
    Page {
        items: page,
        next_cursor: (end < items.len()).then(|| end.to_string()),
    }
}

fn changed_since(updated_at: Option<DateTime<Utc>>, since: Option<DateTime<Utc>>) -> bool {
    match (updated_at, since) {
        (Some(updated_at), Some(since)) => updated_at > since,
        _ => true,
    }
}

// ── Cloud ──────────────────────────────────────────────────────────

#[derive(Default)]
struct CloudState {
    episodes: Vec<CloudEpisode>,
    shows: Vec<CloudShow>,
    movies: Vec<CloudMovie>,
    lists: Vec<CloudList>,
    page_size: Option<usize>,
    /// Listings succeeding before `read_error` kicks in.
    reads_left: Option<usize>,
    read_error: Option<RemoteError>,
    /// Saves succeeding before `save_error` kicks in.
    saves_left: Option<usize>,
    save_error: Option<RemoteError>,
    saved_episodes: Vec<CloudEpisode>,
    saved_shows: Vec<CloudShow>,
    saved_movies: Vec<CloudMovie>,
    saved_lists: Vec<CloudList>,
    removed_lists: Vec<String>,
    removed_list_items: Vec<(String, Vec<String>)>,
}

#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
}

impl FakeCloud {
    pub fn set_episodes(&self, episodes: Vec<CloudEpisode>) {
        lock(&self.state).episodes = episodes;
    }

    pub fn set_shows(&self, shows: Vec<CloudShow>) {
        lock(&self.state).shows = shows;
    }

    pub fn set_movies(&self, movies: Vec<CloudMovie>) {
        lock(&self.state).movies = movies;
    }

    pub fn set_lists(&self, lists: Vec<CloudList>) {
        lock(&self.state).lists = lists;
    }

    pub fn set_page_size(&self, page_size: usize) {
        lock(&self.state).page_size = Some(page_size.max(1));
    }

    /// Every listing fails with `error`.
    pub fn fail_reads(&self, error: RemoteError) {
        let mut state = lock(&self.state);
        state.reads_left = None;
        state.read_error = Some(error);
    }

    /// The first `n` listed pages are served, all later ones fail with
    /// `error`.
    pub fn fail_read_after(&self, n: usize, error: RemoteError) {
        let mut state = lock(&self.state);
        state.reads_left = Some(n);
        state.read_error = Some(error);
    }

    /// Listings succeed again.
    pub fn restore_reads(&self) {
        let mut state = lock(&self.state);
        state.reads_left = None;
        state.read_error = None;
    }

    /// The first `n` saves succeed, all later ones fail with `error`.
    pub fn fail_save_after(&self, n: usize, error: RemoteError) {
        let mut state = lock(&self.state);
        state.saves_left = Some(n);
        state.save_error = Some(error);
    }

    pub fn saved_episodes(&self) -> Vec<CloudEpisode> {
        lock(&self.state).saved_episodes.clone()
    }

    pub fn saved_shows(&self) -> Vec<CloudShow> {
        lock(&self.state).saved_shows.clone()
    }

    pub fn saved_movies(&self) -> Vec<CloudMovie> {
        lock(&self.state).saved_movies.clone()
    }

    pub fn saved_lists(&self) -> Vec<CloudList> {
        lock(&self.state).saved_lists.clone()
    }

    pub fn removed_lists(&self) -> Vec<String> {
        lock(&self.state).removed_lists.clone()
    }

    pub fn removed_list_items(&self) -> Vec<(String, Vec<String>)> {
        lock(&self.state).removed_list_items.clone()
    }

    fn read<T: Clone>(
        &self,
        select: impl FnOnce(&CloudState) -> Vec<T>,
        cursor: Option<String>,
    ) -> RemoteResult<Page<T>> {
        let mut state = lock(&self.state);
        if let Some(e) = state.read_error.clone() {
            match state.reads_left {
                Some(left) if left > 0 => state.reads_left = Some(left - 1),
                _ => return Err(e),
            }
        }
        let page_size = state.page_size.unwrap_or(usize::MAX);
        Ok(paginate(select(&state), cursor, page_size))
    }

    fn write(&self, record: impl FnOnce(&mut CloudState)) -> RemoteResult<()> {
        let mut state = lock(&self.state);
        if let Some(left) = state.saves_left {
            if left == 0 {
                if let Some(e) = &state.save_error {
                    return Err(e.clone());
                }
            }
            state.saves_left = Some(left.saturating_sub(1));
        }
        record(&mut state);
        Ok(())
    }
}

#[async_trait]
impl CloudClient for FakeCloud {
    async fn episodes_changed(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<String>,
    ) -> RemoteResult<Page<CloudEpisode>> {
        self.read(
            |s| {
                s.episodes
                    .iter()
                    .filter(|e| changed_since(e.updated_at, since))
                    .cloned()
                    .collect()
            },
            cursor,
        )
    }

    async fn show_episodes(
        &self,
        show_tmdb_id: i32,
        cursor: Option<String>,
    ) -> RemoteResult<Page<CloudEpisode>> {
        self.read(
            |s| {
                s.episodes
                    .iter()
                    .filter(|e| e.show_tmdb_id == show_tmdb_id)
                    .cloned()
                    .collect()
            },
            cursor,
        )
    }

    async fn save_episodes(&self, episodes: Vec<CloudEpisode>) -> RemoteResult<()> {
        self.write(|s| s.saved_episodes.extend(episodes))
    }

    async fn shows_changed(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<String>,
    ) -> RemoteResult<Page<CloudShow>> {
        self.read(
            |s| {
                s.shows
                    .iter()
                    .filter(|e| changed_since(e.updated_at, since))
                    .cloned()
                    .collect()
            },
            cursor,
        )
    }

    async fn save_shows(&self, shows: Vec<CloudShow>) -> RemoteResult<()> {
        self.write(|s| s.saved_shows.extend(shows))
    }

    async fn movies_changed(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<String>,
    ) -> RemoteResult<Page<CloudMovie>> {
        self.read(
            |s| {
                s.movies
                    .iter()
                    .filter(|e| changed_since(e.updated_at, since))
                    .cloned()
                    .collect()
            },
            cursor,
        )
    }

    async fn save_movies(&self, movies: Vec<CloudMovie>) -> RemoteResult<()> {
        self.write(|s| s.saved_movies.extend(movies))
    }

    async fn lists(&self, cursor: Option<String>) -> RemoteResult<Page<CloudList>> {
        self.read(|s| s.lists.clone(), cursor)
    }

    async fn list_ids(&self, cursor: Option<String>) -> RemoteResult<Page<String>> {
        self.read(|s| s.lists.iter().map(|l| l.list_id.clone()).collect(), cursor)
    }

    async fn save_lists(&self, lists: Vec<CloudList>) -> RemoteResult<()> {
        self.write(|s| s.saved_lists.extend(lists))
    }

    async fn remove_list(&self, list_id: String) -> RemoteResult<()> {
        self.write(|s| s.removed_lists.push(list_id))
    }

    async fn remove_list_items(&self, list_id: String, item_ids: Vec<String>) -> RemoteResult<()> {
        self.write(|s| s.removed_list_items.push((list_id, item_ids)))
    }
}

// ── Tracker ────────────────────────────────────────────────────────

#[derive(Default)]
struct TrackerState {
    activity: LastActivity,
    shows: HashMap<ShowSnapshot, Vec<TrackerShowEntry>>,
    movies: HashMap<MovieSnapshot, Vec<TrackerMovieEntry>>,
    ratings: HashMap<RatingKind, Vec<RatedItem>>,
    read_error: Option<RemoteError>,
    post_error: Option<RemoteError>,
    post_response: SyncResponse,
    posts: Vec<(SyncEndpoint, SyncItems)>,
    show_fetches: usize,
    movie_fetches: usize,
}

#[derive(Default)]
pub struct FakeTracker {
    state: Mutex<TrackerState>,
}

impl FakeTracker {
    pub fn set_last_activity(&self, activity: LastActivity) {
        lock(&self.state).activity = activity;
    }

    pub fn set_shows(&self, kind: ShowSnapshot, shows: Vec<TrackerShowEntry>) {
        lock(&self.state).shows.insert(kind, shows);
    }

    pub fn set_movies(&self, kind: MovieSnapshot, movies: Vec<TrackerMovieEntry>) {
        lock(&self.state).movies.insert(kind, movies);
    }

    pub fn set_ratings(&self, kind: RatingKind, items: Vec<RatedItem>) {
        lock(&self.state).ratings.insert(kind, items);
    }

    pub fn set_post_response(&self, response: SyncResponse) {
        lock(&self.state).post_response = response;
    }

    pub fn fail_posts(&self, error: RemoteError) {
        lock(&self.state).post_error = Some(error);
    }

    pub fn fail_reads(&self, error: RemoteError) {
        lock(&self.state).read_error = Some(error);
    }

    pub fn posts(&self) -> Vec<(SyncEndpoint, SyncItems)> {
        lock(&self.state).posts.clone()
    }

    /// Number of show snapshot requests.
    pub fn show_fetches(&self) -> usize {
        lock(&self.state).show_fetches
    }

    pub fn movie_fetches(&self) -> usize {
        lock(&self.state).movie_fetches
    }

    fn check_read(state: &TrackerState) -> RemoteResult<()> {
        match &state.read_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TrackerClient for FakeTracker {
    async fn last_activity(&self) -> RemoteResult<LastActivity> {
        let state = lock(&self.state);
        Self::check_read(&state)?;
        Ok(state.activity.clone())
    }

    async fn shows(&self, kind: ShowSnapshot) -> RemoteResult<Vec<TrackerShowEntry>> {
        let mut state = lock(&self.state);
        Self::check_read(&state)?;
        state.show_fetches += 1;
        Ok(state.shows.get(&kind).cloned().unwrap_or_default())
    }

    async fn movies(&self, kind: MovieSnapshot) -> RemoteResult<Vec<TrackerMovieEntry>> {
        let mut state = lock(&self.state);
        Self::check_read(&state)?;
        state.movie_fetches += 1;
        Ok(state.movies.get(&kind).cloned().unwrap_or_default())
    }

    async fn ratings(&self, kind: RatingKind) -> RemoteResult<Vec<RatedItem>> {
        let state = lock(&self.state);
        Self::check_read(&state)?;
        Ok(state.ratings.get(&kind).cloned().unwrap_or_default())
    }

    async fn post(&self, endpoint: SyncEndpoint, items: SyncItems) -> RemoteResult<SyncResponse> {
        let mut state = lock(&self.state);
        if let Some(e) = &state.post_error {
            return Err(e.clone());
        }
        state.posts.push((endpoint, items));
        Ok(state.post_response.clone())
    }
}

// ── Catalog and notifier ───────────────────────────────────────────

#[derive(Default)]
struct CatalogState {
    next_show_id: i64,
    added: Vec<(i32, Option<String>)>,
    update_results: VecDeque<RemoteResult<()>>,
    update_calls: usize,
}

/// Catalog that records calls. Scripted update results are consumed in
/// order; once they run out every update succeeds.
#[derive(Default)]
pub struct FakeCatalog {
    state: Mutex<CatalogState>,
}

impl FakeCatalog {
    pub fn script_updates(&self, results: Vec<RemoteResult<()>>) {
        lock(&self.state).update_results = results.into();
    }

    pub fn added(&self) -> Vec<(i32, Option<String>)> {
        lock(&self.state).added.clone()
    }

    pub fn update_calls(&self) -> usize {
        lock(&self.state).update_calls
    }
}

#[async_trait]
impl Catalog for FakeCatalog {
    async fn add_show(&self, tmdb_id: i32, language: Option<String>) -> RemoteResult<i64> {
        let mut state = lock(&self.state);
        state.added.push((tmdb_id, language));
        state.next_show_id += 1;
        Ok(state.next_show_id)
    }

    async fn update_show(&self, _show_id: i64) -> RemoteResult<()> {
        let mut state = lock(&self.state);
        state.update_calls += 1;
        state.update_results.pop_front().unwrap_or(Ok(()))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    failures: Mutex<Vec<JobFailure>>,
}

impl RecordingNotifier {
    pub fn failures(&self) -> Vec<JobFailure> {
        lock(&self.failures).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn job_failed(&self, failure: &JobFailure) {
        lock(&self.failures).push(failure.clone());
    }
}
