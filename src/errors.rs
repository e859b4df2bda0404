//! Error taxonomy for sync operations.
//!
//! Collaborator failures (remote store, filesystem, installer) are converted
//! into one of these kinds at the orchestrator boundary; callers match on the
//! kind to decide whether to reset credentials, reset the stored collection
//! id, or stay silent (a declined confirmation is not an error toast).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Connectivity or timeout talking to the remote store.
    #[error("network error: {0}")]
    Network(String),

    /// HTTP 401. The stored token is bad; callers should clear it and ask
    /// the user to re-enter the credential.
    #[error("unauthorized: the remote token was rejected")]
    Unauthorized,

    /// HTTP 404. The stored collection id points nowhere; callers should
    /// clear it.
    #[error("remote collection not found: {0}")]
    NotFound(String),

    /// The user declined the poka-yoke confirmation. Terminates the attempt
    /// as `Aborted`, never surfaced as a failure.
    #[error("confirmation declined")]
    ConfirmationDeclined,

    /// A local file could not be read. The item is skipped and accumulated;
    /// the batch continues.
    #[error("failed to load {name}: {source}")]
    ContentLoad {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A per-extension install/update/remove failure. Isolated per item
    /// inside the reconciler phases.
    #[error("extension {id}: {reason}")]
    Install { id: String, reason: String },

    /// A staged file could not be written during download; aborts the
    /// remaining save loop, naming the failing remote file.
    #[error("failed to save {name}: {reason}")]
    Save { name: String, reason: String },

    #[error("malformed document: {0}")]
    Document(String),
}

impl SyncError {
    /// Classify a reqwest failure or HTTP status into the taxonomy.
    pub fn from_status(status: reqwest::StatusCode, what: &str) -> Self {
        match status.as_u16() {
            401 => SyncError::Unauthorized,
            404 => SyncError::NotFound(what.to_string()),
            _ => SyncError::Network(format!("{} returned HTTP {}", what, status)),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            SyncError::from_status(status, "remote store")
        } else {
            SyncError::Network(e.to_string())
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
