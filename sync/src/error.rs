//! Unified error handling for sync sessions.

/// Sync error type.
///
/// Cloneable so one failure can be reported to every caller awaiting the
/// same save, and to the session's state node.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    // Local persistence errors
    #[error("failed to load local table `{table}`: {message}")]
    LocalLoad { table: String, message: String },

    #[error("failed to save local table `{table}`: {message}")]
    LocalSave { table: String, message: String },

    // Remote errors
    #[error("remote listen failed: {0}")]
    RemoteListen(String),

    #[error("remote save failed after {attempts} attempt(s): {message}")]
    RemoteSave { attempts: u32, message: String },

    #[error("engine error: {0}")]
    Engine(#[from] tether_engine::Error),

    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("sync session is closed")]
    Closed,
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Json(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

impl SyncError {
    pub(crate) fn local_load(table: &str, err: impl std::fmt::Display) -> Self {
        SyncError::LocalLoad {
            table: table.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn local_save(table: &str, err: impl std::fmt::Display) -> Self {
        SyncError::LocalSave {
            table: table.to_string(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
