use std::fmt;
use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{service} error: {source}")]
    Remote {
        service: crate::remote::Service,
        #[source]
        source: RemoteError,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Invalid job payload: {0}")]
    JobPayload(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No network connection")]
    Offline,

    #[error("Sync cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn remote(service: crate::remote::Service, source: RemoteError) -> Self {
        Error::Remote { service, source }
    }

    /// Errors that end the whole sync run rather than a single family.
    pub fn is_fatal_to_run(&self) -> bool {
        match self {
            Error::Offline | Error::Cancelled => true,
            Error::Remote { source, .. } => {
                matches!(source, RemoteError::Offline | RemoteError::Unauthorized)
            }
            _ => false,
        }
    }

    pub fn is_offline(&self) -> bool {
        matches!(
            self,
            Error::Offline
                | Error::Remote {
                    source: RemoteError::Offline,
                    ..
                }
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for Error {
    fn from(e: rusqlite_migration::Error) -> Self {
        Error::Migration(e.to_string())
    }
}

impl<E: fmt::Display> From<tokio_rusqlite::Error<E>> for Error {
    fn from(e: tokio_rusqlite::Error<E>) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::JobPayload(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
