//! Error types for shardplace

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Caller-facing classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    Timeout,
    ServerError,
}

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Request Errors ===
    #[error("{0}")]
    BadRequest(String),

    // === Placement Errors ===
    #[error("Placement failed: {0}")]
    Placement(String),

    // === State Store Errors ===
    #[error("State store error: {0}")]
    StateStore(String),

    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Mutation log corrupted: {0}")]
    MetadataCorrupted(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // === Provisioning Errors ===
    /// A node-level create instruction failed. `state_recorded` tells the caller
    /// whether cluster state already carries the replica record.
    #[error("Failed to create replica {core}: {detail}")]
    Dispatch {
        core: String,
        detail: String,
        state_recorded: bool,
    },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadRequest(_) | Error::Placement(_) => ErrorKind::BadRequest,
            Error::Timeout(_) => ErrorKind::Timeout,
            _ => ErrorKind::ServerError,
        }
    }

    /// Is this a retryable error?
    ///
    /// Only transport-level failures qualify; a failed enqueue requires the
    /// caller to retry the whole operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConnectionFailed(_) | Error::NotLeader(_))
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::BadRequest(_) | Error::Placement(_) => StatusCode::BAD_REQUEST,
            Error::NotLeader(_) => StatusCode::TEMPORARY_REDIRECT,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Error::ConnectionFailed(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::MetadataCorrupted(e.to_string())
    }
}
