use thiserror::Error;

/// Classified failure of a single remote request.
///
/// The classification decides what the caller does next: retryable failures
/// leave work for the next run, terminal failures drop it, and
/// `Unauthorized`/`Offline` end the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("no network connection")]
    Offline,

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited")]
    RateLimited,

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("request rejected {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Map a non-success HTTP status to a classification.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => RemoteError::Unauthorized,
            404 => RemoteError::NotFound(message),
            408 => RemoteError::Timeout,
            429 => RemoteError::RateLimited,
            500..=599 => RemoteError::Server { status, message },
            _ => RemoteError::Rejected { status, message },
        }
    }

    /// Worth trying again on a later run.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Offline
                | RemoteError::RateLimited
                | RemoteError::Timeout
                | RemoteError::Transport(_)
                | RemoteError::Server { .. }
        )
    }

    /// The request can never succeed as sent.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RemoteError::NotFound(_) | RemoteError::Rejected { .. } | RemoteError::Decode(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RemoteError::Timeout)
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteError::Timeout
        } else if e.is_decode() {
            RemoteError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            RemoteError::from_status(status.as_u16(), e.to_string())
        } else {
            RemoteError::Transport(e.to_string())
        }
    }
}
