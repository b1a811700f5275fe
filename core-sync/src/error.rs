use bridge_traits::error::BridgeError;
use core_pipeline::PipelineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Sync already in progress")]
    SyncInProgress,

    #[error("Sync is paused")]
    Paused,

    #[error("Sync lock {name} is held by another replica")]
    LockUnavailable { name: String },

    #[error("Sync lock {name} could not be renewed")]
    LeaseLost { name: String },

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("No unresolved conflict for {path}")]
    ConflictNotFound { path: String },

    #[error("Conflicts can only be resolved manually with keep-local or keep-remote, got {strategy}")]
    UnsupportedResolution { strategy: String },

    #[error("Invalid sync state: {0}")]
    InvalidState(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid pattern: {0}")]
    Pattern(String),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::Database(err.to_string())
    }
}

impl From<glob::PatternError> for SyncError {
    fn from(err: glob::PatternError) -> Self {
        SyncError::Pattern(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
