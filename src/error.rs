use thiserror::Error;

#[derive(Error, Debug)]
pub enum NexError {
    #[error("Object store unavailable: {0}")]
    Connection(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Binary verification failed: {0}")]
    Verification(String),

    #[error("Cache write failed for {identity}: {reason}")]
    CacheWrite { identity: String, reason: String },

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl NexError {
    /// True for the not-found class of failures, regardless of which store raised it.
    pub fn is_not_found(&self) -> bool {
        matches!(self, NexError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, NexError>;
