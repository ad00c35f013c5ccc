//! Proxmox VE client errors

use thiserror::Error;

/// Errors that can occur when interacting with the Proxmox VE API
#[derive(Debug, Error)]
pub enum PveError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Proxmox VE API returned a non-success status
    #[error("Proxmox API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Authentication failed (invalid token, missing privileges, etc.)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request (e.g., malformed parameters)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A platform task (UPID) finished with a non-OK exit status
    #[error("Task {upid} failed: {exit_status}")]
    Task { upid: String, exit_status: String },
}

impl PveError {
    /// True when the platform reported that the addressed object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PveError::NotFound(_))
    }
}
