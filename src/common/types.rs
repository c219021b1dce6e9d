use chrono::Utc;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Closed set of failures reported by the Dropbox and Garmin clients.
///
/// Classification happens once at the HTTP boundary so callers can branch on
/// the variant instead of inspecting error text.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Authentication error: {0}")]
    Auth(String),
    #[error("Network error: {0}")]
    Transient(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

impl RemoteError {
    /// Maps a non-success HTTP status to an error variant.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let detail = if body.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {body}")
        };

        match status {
            StatusCode::NOT_FOUND => RemoteError::NotFound(detail),
            StatusCode::CONFLICT => RemoteError::Conflict(detail),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Auth(detail),
            StatusCode::TOO_MANY_REQUESTS => RemoteError::Transient(detail),
            s if s.is_server_error() => RemoteError::Transient(detail),
            _ => RemoteError::Other(detail),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RemoteError::Conflict(_))
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return RemoteError::Other(format!("Invalid response: {err}"));
        }
        match err.status() {
            Some(status) => RemoteError::from_status(status, ""),
            None => RemoteError::Transient(err.to_string()),
        }
    }
}

impl From<reqwest_middleware::Error> for RemoteError {
    fn from(err: reqwest_middleware::Error) -> Self {
        match err {
            reqwest_middleware::Error::Reqwest(e) => e.into(),
            reqwest_middleware::Error::Middleware(e) => RemoteError::Transient(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        RemoteError::Other(format!("Invalid response: {err}"))
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Fatal failures while establishing a session with either service.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),
    #[error("No authorization code entered")]
    EmptyAuthCode,
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Folder,
}

/// One entry of a remote folder listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Lower-cased remote path, unique within the account
    pub path: String,
    /// Display name, used for the local file and the archive destination
    pub name: String,
    pub kind: EntryKind,
}

impl FileEntry {
    pub fn file(path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            kind: EntryKind::File,
        }
    }

    pub fn folder(path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            kind: EntryKind::Folder,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// What happens to a source file once its upload is confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Disposition {
    Move,
    #[default]
    Delete,
    Unknown(String),
}

impl Disposition {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "move" => Disposition::Move,
            "delete" => Disposition::Delete,
            _ => Disposition::Unknown(value.to_string()),
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Move => write!(f, "move"),
            Disposition::Delete => write!(f, "delete"),
            Disposition::Unknown(value) => write!(f, "{value}"),
        }
    }
}

/// Dropbox OAuth token pair as persisted in the token file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix timestamp (seconds) at which `access_token` expires
    pub expires_at: i64,
}

impl TokenSet {
    pub fn from_expires_in(access_token: String, refresh_token: String, expires_in: i64) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at: Utc::now().timestamp() + expires_in,
        }
    }

    /// True when the access token expires within `leeway_secs`.
    pub fn expires_within(&self, leeway_secs: i64) -> bool {
        self.expires_at - leeway_secs <= Utc::now().timestamp()
    }
}
