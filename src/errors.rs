use std::time::Duration;

/// Error taxonomy shared by the document store, version control,
/// credibility and retrieval layers.
///
/// `Validation` is a caller bug and is never retried. `Transient` is only
/// produced internally; the retry policy turns an exhausted `Transient`
/// into `BackendUnavailable`. `Permanent` covers backend refusals such as
/// auth, quota or corrupted state, which are never retried.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("backend unavailable after {attempts} attempts: {last_error}")]
    BackendUnavailable { attempts: u32, last_error: String },

    #[error("backend rejected the request: {0}")]
    Permanent(String),

    #[error("version {0} not found")]
    VersionNotFound(String),

    #[error("timed out waiting for the {lock} lock after {waited:?}")]
    ConcurrencyTimeout { lock: &'static str, waited: Duration },

    #[error("version history is unreadable: {0}")]
    HistoryRead(String),

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether the retry policy may try the failed call again.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        StoreError::Validation(msg.into())
    }

    pub fn poisoned(name: &str) -> Self {
        StoreError::Internal(format!("{name} lock poisoned"))
    }
}
