use thiserror::Error;

/// Failures surfaced by the bridge, grouped the way callers react to them.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("device at {host} is unreachable: {source}")]
    Unreachable {
        host: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("malformed response from {host}: {reason}")]
    MalformedResponse { host: String, reason: String },

    #[error("unsupported device {name}: {reason}")]
    UnsupportedDevice { name: String, reason: String },

    #[error("device {name} disappeared")]
    SessionLost { name: String },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("publish sink failed: {0}")]
    Sink(String),

    #[error(transparent)]
    PathTree(#[from] PathTreeError),
}

/// Misuse of a [`crate::path_tree::PathTree`]. These indicate bugs, not runtime conditions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathTreeError {
    #[error("path {0} was never declared")]
    Undeclared(String),

    #[error("path {path} already declared with formatter {existing:?}, got {requested:?}")]
    ConflictingFormatter {
        path: String,
        existing: Option<crate::path_tree::Formatter>,
        requested: Option<crate::path_tree::Formatter>,
    },
}

impl BridgeError {
    /// Tick failures that leave the session alive and retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::Unreachable { .. } | BridgeError::MalformedResponse { .. }
        )
    }
}
