//! Clients for the two remote services the library is reconciled against.
//!
//! Both services sit behind object-safe traits so the sync engine can be
//! driven by the HTTP implementations in production and by fakes in tests.

pub mod cloud;
pub mod error;
pub mod tracker;

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use cloud::{CloudClient, HttpCloudClient};
pub use error::RemoteError;
pub use tracker::{HttpTrackerClient, TrackerClient};

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Request timeout applied by both HTTP clients.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Service {
    Cloud,
    Tracker,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Cloud => "Cloud",
            Service::Tracker => "Tracker",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default, rename = "cursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }
}

/// Turn a finished response into a typed body or a classified error.
pub(crate) async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> RemoteResult<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(RemoteError::from_status(status.as_u16(), body));
    }
    resp.json::<T>()
        .await
        .map_err(|e| RemoteError::Decode(e.to_string()))
}

/// Like [`read_json`] for endpoints whose body is irrelevant.
pub(crate) async fn read_empty(resp: reqwest::Response) -> RemoteResult<()> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(RemoteError::from_status(status.as_u16(), body))
}

/// Join an endpoint path onto a configured base URL.
pub(crate) fn endpoint(base: &url::Url, path: &str) -> RemoteResult<url::Url> {
    base.join(path.trim_start_matches('/'))
        .map_err(|e| RemoteError::Transport(format!("bad endpoint {path}: {e}")))
}

/// Parse a base URL, ensuring a trailing slash so relative joins append.
pub(crate) fn parse_base_url(raw: &str) -> std::result::Result<url::Url, url::ParseError> {
    if raw.ends_with('/') {
        url::Url::parse(raw)
    } else {
        url::Url::parse(&format!("{raw}/"))
    }
}
