use crate::config::DownloadConfigError;
use reqwest::header::ToStrError;
use std::error::Error as StdError;
use std::io;
use std::num::ParseIntError;
use thiserror::Error;
use tokio::task::JoinError;

/// Error kinds are cloneable because they travel inside broadcast events.
#[derive(Debug, Error, Clone)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {text}")]
    Http { status: u16, text: String },

    #[error("server does not support byte ranges")]
    UnsupportedServer,

    #[error("assembly failed: {0}")]
    Assembly(String),

    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("task {0} not found")]
    TaskNotFound(u32),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(String),
}

impl DownloadError {
    /// Errors handled inside the task with backoff rather than surfaced.
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Network(_) => true,
            DownloadError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<sqlx::Error> for DownloadError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            // SQLITE_FULL: primary result code 13, also the prefix of its
            // extended codes.
            let code = db.code();
            if code.as_deref() == Some("13") || db.message().contains("database or disk is full") {
                return DownloadError::QuotaExceeded;
            }
        }
        DownloadError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        DownloadError::Network(err.to_string())
    }
}

impl From<io::Error> for DownloadError {
    fn from(err: io::Error) -> Self {
        DownloadError::Io(err.to_string())
    }
}

impl From<url::ParseError> for DownloadError {
    fn from(err: url::ParseError) -> Self {
        DownloadError::InvalidUrl(err.to_string())
    }
}

impl From<JoinError> for DownloadError {
    fn from(err: JoinError) -> Self {
        DownloadError::Other(err.to_string())
    }
}

impl From<DownloadConfigError> for DownloadError {
    fn from(err: DownloadConfigError) -> Self {
        DownloadError::ConfigError(err.to_string())
    }
}

impl From<ParseIntError> for DownloadError {
    fn from(err: ParseIntError) -> Self {
        DownloadError::Parse(err.to_string())
    }
}

impl From<ToStrError> for DownloadError {
    fn from(err: ToStrError) -> Self {
        DownloadError::Parse(err.to_string())
    }
}

impl From<Box<dyn StdError>> for DownloadError {
    fn from(err: Box<dyn StdError>) -> Self {
        DownloadError::Other(err.to_string())
    }
}

impl From<String> for DownloadError {
    fn from(s: String) -> Self {
        DownloadError::Other(s)
    }
}

impl From<&str> for DownloadError {
    fn from(s: &str) -> Self {
        DownloadError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_and_5xx_are_retryable() {
        assert!(DownloadError::Network("reset".into()).is_retryable());
        assert!(
            DownloadError::Http {
                status: 503,
                text: "Service Unavailable".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn client_errors_and_storage_are_terminal() {
        assert!(
            !DownloadError::Http {
                status: 404,
                text: "Not Found".into()
            }
            .is_retryable()
        );
        assert!(!DownloadError::UnsupportedServer.is_retryable());
        assert!(!DownloadError::QuotaExceeded.is_retryable());
        assert!(!DownloadError::Assembly("size mismatch".into()).is_retryable());
    }
}
