use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FerryError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Request to {address} timed out after {timeout:?}")]
    RequestTimeout { address: String, timeout: Duration },

    #[error("Transfer of {uid} refused by {address}: {reason}")]
    Refused {
        uid: String,
        address: String,
        reason: String,
    },

    #[error("Transfer of {uid} cancelled")]
    Cancelled { uid: String },

    #[error("No request address for {uid} and no default configured")]
    NoRequestAddress { uid: String },

    #[error("Unsupported file location: {0}")]
    UnsupportedUri(String),

    #[error("Listener for {address} is already running")]
    AlreadyRunning { address: String },

    #[error("Subscription to {address} closed")]
    SubscriptionClosed { address: String },

    #[error("Config watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Callback failed: {0}")]
    Callback(#[source] anyhow::Error),
}

impl FerryError {
    /// Errors that a later redelivery of the same `push` may clear up.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FerryError::RequestTimeout { .. }
                | FerryError::Refused { .. }
                | FerryError::Cancelled { .. }
                | FerryError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FerryError>;
