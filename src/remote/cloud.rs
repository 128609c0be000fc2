use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{endpoint, parse_base_url, read_empty, read_json, Page, RemoteError, RemoteResult};

/// Largest batch the Cloud accepts in a single save request.
pub const MAX_BATCH_SIZE: usize = 500;

/// Episode flags as stored by the Cloud.
///
/// Only fields that are `Some` are meaningful; a save request leaves absent
/// fields untouched on the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudEpisode {
    pub show_tmdb_id: i32,
    pub season_number: i32,
    pub episode_number: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watched_flag: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plays: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_in_collection: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudShow {
    pub tmdb_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_favorite: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_hidden: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_removed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudMovie {
    pub tmdb_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_in_collection: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_in_watchlist: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_watched: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plays: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudListItem {
    pub list_item_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudList {
    pub list_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i32>,
    #[serde(default)]
    pub items: Vec<CloudListItem>,
}

/// The account backend.
///
/// Listings are cursor-paginated; `since = None` lists everything.
#[async_trait]
pub trait CloudClient: Send + Sync {
    async fn episodes_changed(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<String>,
    ) -> RemoteResult<Page<CloudEpisode>>;

    /// All flagged episodes of one show.
    async fn show_episodes(
        &self,
        show_tmdb_id: i32,
        cursor: Option<String>,
    ) -> RemoteResult<Page<CloudEpisode>>;

    /// At most [`MAX_BATCH_SIZE`] episodes per call.
    async fn save_episodes(&self, episodes: Vec<CloudEpisode>) -> RemoteResult<()>;

    async fn shows_changed(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<String>,
    ) -> RemoteResult<Page<CloudShow>>;

    async fn save_shows(&self, shows: Vec<CloudShow>) -> RemoteResult<()>;

    async fn movies_changed(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<String>,
    ) -> RemoteResult<Page<CloudMovie>>;

    async fn save_movies(&self, movies: Vec<CloudMovie>) -> RemoteResult<()>;

    /// Lists including their items.
    async fn lists(&self, cursor: Option<String>) -> RemoteResult<Page<CloudList>>;

    async fn list_ids(&self, cursor: Option<String>) -> RemoteResult<Page<String>>;

    async fn save_lists(&self, lists: Vec<CloudList>) -> RemoteResult<()>;

    async fn remove_list(&self, list_id: String) -> RemoteResult<()>;

    async fn remove_list_items(&self, list_id: String, item_ids: Vec<String>)
        -> RemoteResult<()>;
}

// ── HTTP implementation ────────────────────────────────────────────

#[derive(Serialize)]
struct ItemsBody<T> {
    items: Vec<T>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RemoveItemsBody {
    item_ids: Vec<String>,
}

/// JSON-over-HTTP Cloud client authenticated with a bearer token.
pub struct HttpCloudClient {
    client: reqwest::Client,
    base: url::Url,
    token: String,
}

impl HttpCloudClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> crate::Result<Self> {
        let base = parse_base_url(base_url)
            .map_err(|e| crate::Error::Config(format!("invalid Cloud URL {base_url}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(super::REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        Ok(Self {
            client,
            base,
            token: token.into(),
        })
    }

    /// Build from `SHOWSYNC_CLOUD_URL` and `SHOWSYNC_CLOUD_TOKEN`.
    /// Returns `Ok(None)` when the Cloud is not configured.
    pub fn from_env() -> crate::Result<Option<Self>> {
        let url = std::env::var("SHOWSYNC_CLOUD_URL").ok();
        let token = std::env::var("SHOWSYNC_CLOUD_TOKEN").ok();
        match (url, token) {
            (Some(url), Some(token)) if !url.is_empty() && !token.is_empty() => {
                Self::new(&url, token).map(Some)
            }
            _ => Ok(None),
        }
    }

    async fn get_page<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> RemoteResult<Page<T>> {
        let url = endpoint(&self.base, path)?;
        log::debug!("GET {url}");
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await?;
        read_json(resp).await
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> RemoteResult<()> {
        let url = endpoint(&self.base, path)?;
        log::debug!("POST {url}");
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        read_empty(resp).await
    }
}

fn changed_query(since: Option<DateTime<Utc>>, cursor: Option<String>) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if let Some(since) = since {
        query.push(("updatedSince", since.timestamp_millis().to_string()));
    }
    if let Some(cursor) = cursor {
        query.push(("cursor", cursor));
    }
    query
}

#[async_trait]
impl CloudClient for HttpCloudClient {
    async fn episodes_changed(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<String>,
    ) -> RemoteResult<Page<CloudEpisode>> {
        self.get_page("episodes", &changed_query(since, cursor)).await
    }

    async fn show_episodes(
        &self,
        show_tmdb_id: i32,
        cursor: Option<String>,
    ) -> RemoteResult<Page<CloudEpisode>> {
        let mut query = changed_query(None, cursor);
        query.push(("showTmdbId", show_tmdb_id.to_string()));
        query.push(("limit", MAX_BATCH_SIZE.to_string()));
        self.get_page("episodes", &query).await
    }

    async fn save_episodes(&self, episodes: Vec<CloudEpisode>) -> RemoteResult<()> {
        if episodes.len() > MAX_BATCH_SIZE {
            return Err(RemoteError::Rejected {
                status: 413,
                message: format!("{} episodes exceed the batch limit", episodes.len()),
            });
        }
        self.post("episodes", &ItemsBody { items: episodes }).await
    }

    async fn shows_changed(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<String>,
    ) -> RemoteResult<Page<CloudShow>> {
        self.get_page("shows", &changed_query(since, cursor)).await
    }

    async fn save_shows(&self, shows: Vec<CloudShow>) -> RemoteResult<()> {
        self.post("shows", &ItemsBody { items: shows }).await
    }

    async fn movies_changed(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<String>,
    ) -> RemoteResult<Page<CloudMovie>> {
        self.get_page("movies", &changed_query(since, cursor)).await
    }

    async fn save_movies(&self, movies: Vec<CloudMovie>) -> RemoteResult<()> {
        self.post("movies", &ItemsBody { items: movies }).await
    }

    async fn lists(&self, cursor: Option<String>) -> RemoteResult<Page<CloudList>> {
        self.get_page("lists", &changed_query(None, cursor)).await
    }

    async fn list_ids(&self, cursor: Option<String>) -> RemoteResult<Page<String>> {
        self.get_page("lists/ids", &changed_query(None, cursor)).await
    }

    async fn save_lists(&self, lists: Vec<CloudList>) -> RemoteResult<()> {
        self.post("lists", &ItemsBody { items: lists }).await
    }

    async fn remove_list(&self, list_id: String) -> RemoteResult<()> {
        let url = endpoint(&self.base, &format!("lists/{list_id}"))?;
        log::debug!("DELETE {url}");
        let resp = self
            .client
            .delete(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        read_empty(resp).await
    }

    async fn remove_list_items(
        &self,
        list_id: String,
        item_ids: Vec<String>,
    ) -> RemoteResult<()> {
        self.post(
            &format!("lists/{list_id}/items/remove"),
            &RemoveItemsBody { item_ids },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_episode_json_shape() {
        let ep = CloudEpisode {
            show_tmdb_id: 1399,
            season_number: 1,
            episode_number: 2,
            watched_flag: Some(1),
            plays: Some(2),
            ..Default::default()
        };
        let json = serde_json::to_value(&ep).unwrap();
        assert_eq!(json["showTmdbId"], 1399);
        assert_eq!(json["watchedFlag"], 1);
        assert!(json.get("isInCollection").is_none());
    }

    #[test]
    fn test_changed_query() {
        let since = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let q = changed_query(Some(since), Some("next".into()));
        assert_eq!(
            q,
            vec![
                ("updatedSince", "1700000000000".to_string()),
                ("cursor", "next".to_string())
            ]
        );
        assert!(changed_query(None, None).is_empty());
    }

    #[test]
    fn test_new_rejects_bad_url() {
        assert!(HttpCloudClient::new("not a url", "t").is_err());
        assert!(HttpCloudClient::new("https://cloud.example.com/v1", "t").is_ok());
    }
}
