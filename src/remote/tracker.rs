use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{endpoint, parse_base_url, read_json, RemoteResult};

const API_VERSION: &str = "2";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trakt: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmdb: Option<i32>,
}

impl TrackerIds {
    pub fn tmdb(id: i32) -> Self {
        Self {
            trakt: None,
            tmdb: Some(id),
        }
    }
}

// ── Last activity ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeActivity {
    pub watched_at: Option<DateTime<Utc>>,
    pub collected_at: Option<DateTime<Utc>>,
    pub rated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShowActivity {
    pub rated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovieActivity {
    pub watched_at: Option<DateTime<Utc>>,
    pub collected_at: Option<DateTime<Utc>>,
    pub watchlisted_at: Option<DateTime<Utc>>,
    pub rated_at: Option<DateTime<Utc>>,
}

/// Per-family instants of the latest change on the account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastActivity {
    #[serde(default)]
    pub episodes: EpisodeActivity,
    #[serde(default)]
    pub shows: ShowActivity,
    #[serde(default)]
    pub movies: MovieActivity,
}

// ── Snapshots ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerShowRef {
    #[serde(default)]
    pub title: Option<String>,
    pub ids: TrackerIds,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerEpisode {
    pub number: i32,
    /// Present on watched snapshots, absent on collection snapshots.
    #[serde(default)]
    pub plays: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerSeason {
    pub number: i32,
    #[serde(default)]
    pub episodes: Vec<TrackerEpisode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerShowEntry {
    pub show: TrackerShowRef,
    #[serde(default)]
    pub seasons: Vec<TrackerSeason>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerMovieRef {
    #[serde(default)]
    pub title: Option<String>,
    pub ids: TrackerIds,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerMovieEntry {
    pub movie: TrackerMovieRef,
    #[serde(default)]
    pub plays: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeKey {
    pub season: i32,
    pub number: i32,
}

/// One rated item; which reference is set depends on the listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatedItem {
    pub rating: i32,
    #[serde(default)]
    pub show: Option<TrackerShowRef>,
    #[serde(default)]
    pub episode: Option<EpisodeKey>,
    #[serde(default)]
    pub movie: Option<TrackerMovieRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShowSnapshot {
    Watched,
    Collected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MovieSnapshot {
    Collection,
    Watchlist,
    Watched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RatingKind {
    Shows,
    Episodes,
    Movies,
}

// ── Sync payloads ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEpisode {
    pub number: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watched_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSeason {
    pub number: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub episodes: Vec<SyncEpisode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncShow {
    pub ids: TrackerIds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seasons: Vec<SyncSeason>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMovie {
    pub ids: TrackerIds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watched_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<i32>,
}

/// Body of every add/remove call. A show nests seasons and episodes; one
/// episode entry is one play.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncItems {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shows: Vec<SyncShow>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub movies: Vec<SyncMovie>,
}

impl SyncItems {
    pub fn is_empty(&self) -> bool {
        self.shows.is_empty() && self.movies.is_empty()
    }

    /// Total number of episode entries across all shows.
    pub fn episode_count(&self) -> usize {
        self.shows
            .iter()
            .flat_map(|s| &s.seasons)
            .map(|s| s.episodes.len())
            .sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotFound {
    #[serde(default)]
    pub shows: Vec<SyncShow>,
    #[serde(default)]
    pub seasons: Vec<SyncSeason>,
    #[serde(default)]
    pub episodes: Vec<SyncEpisode>,
    #[serde(default)]
    pub movies: Vec<SyncMovie>,
}

impl NotFound {
    pub fn is_empty(&self) -> bool {
        self.shows.is_empty()
            && self.seasons.is_empty()
            && self.episodes.is_empty()
            && self.movies.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(default)]
    pub not_found: NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncEndpoint {
    HistoryAdd,
    HistoryRemove,
    CollectionAdd,
    CollectionRemove,
    WatchlistAdd,
    WatchlistRemove,
    RatingsAdd,
    RatingsRemove,
}

impl SyncEndpoint {
    fn path(&self) -> &'static str {
        match self {
            SyncEndpoint::HistoryAdd => "sync/history",
            SyncEndpoint::HistoryRemove => "sync/history/remove",
            SyncEndpoint::CollectionAdd => "sync/collection",
            SyncEndpoint::CollectionRemove => "sync/collection/remove",
            SyncEndpoint::WatchlistAdd => "sync/watchlist",
            SyncEndpoint::WatchlistRemove => "sync/watchlist/remove",
            SyncEndpoint::RatingsAdd => "sync/ratings",
            SyncEndpoint::RatingsRemove => "sync/ratings/remove",
        }
    }
}

/// The watch tracking service.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    async fn last_activity(&self) -> RemoteResult<LastActivity>;

    async fn shows(&self, kind: ShowSnapshot) -> RemoteResult<Vec<TrackerShowEntry>>;

    async fn movies(&self, kind: MovieSnapshot) -> RemoteResult<Vec<TrackerMovieEntry>>;

    async fn ratings(&self, kind: RatingKind) -> RemoteResult<Vec<RatedItem>>;

    async fn post(&self, endpoint: SyncEndpoint, items: SyncItems) -> RemoteResult<SyncResponse>;
}

// ── HTTP implementation ────────────────────────────────────────────

/// JSON-over-HTTP Tracker client using an OAuth access token.
pub struct HttpTrackerClient {
    client: reqwest::Client,
    base: url::Url,
    client_id: String,
    token: String,
}

impl HttpTrackerClient {
    pub fn new(
        base_url: &str,
        client_id: impl Into<String>,
        token: impl Into<String>,
    ) -> crate::Result<Self> {
        let base = parse_base_url(base_url)
            .map_err(|e| crate::Error::Config(format!("invalid Tracker URL {base_url}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(super::REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        Ok(Self {
            client,
            base,
            client_id: client_id.into(),
            token: token.into(),
        })
    }

    /// Build from `SHOWSYNC_TRACKER_URL`, `SHOWSYNC_TRACKER_CLIENT_ID` and
    /// `SHOWSYNC_TRACKER_TOKEN`. Returns `Ok(None)` when not configured.
    pub fn from_env() -> crate::Result<Option<Self>> {
        let vars = (
            std::env::var("SHOWSYNC_TRACKER_URL").ok(),
            std::env::var("SHOWSYNC_TRACKER_CLIENT_ID").ok(),
            std::env::var("SHOWSYNC_TRACKER_TOKEN").ok(),
        );
        match vars {
            (Some(url), Some(client_id), Some(token))
                if !url.is_empty() && !client_id.is_empty() && !token.is_empty() =>
            {
                Self::new(&url, client_id, token).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn request(&self, method: reqwest::Method, url: url::Url) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.token)
            .header("trakt-api-version", API_VERSION)
            .header("trakt-api-key", &self.client_id)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> RemoteResult<T> {
        let url = endpoint(&self.base, path)?;
        log::debug!("GET {url}");
        let resp = self.request(reqwest::Method::GET, url).send().await?;
        read_json(resp).await
    }
}

#[async_trait]
impl TrackerClient for HttpTrackerClient {
    async fn last_activity(&self) -> RemoteResult<LastActivity> {
        self.get("sync/last_activities").await
    }

    async fn shows(&self, kind: ShowSnapshot) -> RemoteResult<Vec<TrackerShowEntry>> {
        match kind {
            ShowSnapshot::Watched => self.get("sync/watched/shows").await,
            ShowSnapshot::Collected => self.get("sync/collection/shows").await,
        }
    }

    async fn movies(&self, kind: MovieSnapshot) -> RemoteResult<Vec<TrackerMovieEntry>> {
        match kind {
            MovieSnapshot::Collection => self.get("sync/collection/movies").await,
            MovieSnapshot::Watchlist => self.get("sync/watchlist/movies").await,
            MovieSnapshot::Watched => self.get("sync/watched/movies").await,
        }
    }

    async fn ratings(&self, kind: RatingKind) -> RemoteResult<Vec<RatedItem>> {
        match kind {
            RatingKind::Shows => self.get("sync/ratings/shows").await,
            RatingKind::Episodes => self.get("sync/ratings/episodes").await,
            RatingKind::Movies => self.get("sync/ratings/movies").await,
        }
    }

    async fn post(&self, endpoint_kind: SyncEndpoint, items: SyncItems) -> RemoteResult<SyncResponse> {
        let url = endpoint(&self.base, endpoint_kind.path())?;
        log::debug!("POST {url}");
        let resp = self
            .request(reqwest::Method::POST, url)
            .json(&items)
            .send()
            .await?;
        read_json(resp).await
    }
}
