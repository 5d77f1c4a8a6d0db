use std::path::PathBuf;

use thiserror::Error;

use crate::permissions::Action;

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("User does not have permission to {action}")]
    PermissionDenied { action: Action },

    #[error("Invalid {kind} ID: {id}")]
    NotFound { kind: &'static str, id: i64 },

    #[error("{0}")]
    ValidationFailed(String),

    /// Raised by the catalog when a uniqueness constraint rejects a write.
    /// The engine resolves it with a suffix and never hands it to callers.
    #[error("'{name}' already exists")]
    DatabaseConflict { name: String },

    #[error("Gave up finding a free name for '{name}' after {attempts} attempts")]
    TooManyConflicts { name: String, attempts: u32 },

    /// Disk and catalog disagree after a failed compensating action.
    #[error("Disk and catalog diverged moving {from:?} -> {to:?}: {reason}")]
    PartialMoveFailure {
        from: PathBuf,
        to: PathBuf,
        reason: String,
    },

    #[error("Catalog lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = LibraryError> = std::result::Result<T, E>;

impl LibraryError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailed(message.into())
    }

    /// HTTP-equivalent status used by the JSON layer.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ValidationFailed(_) => 400,
            Self::PermissionDenied { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::DatabaseConflict { .. } | Self::TooManyConflicts { .. } => 409,
            Self::PartialMoveFailure { .. }
            | Self::LockPoisoned
            | Self::Database(_)
            | Self::Io(_)
            | Self::Json(_) => 500,
        }
    }
}
