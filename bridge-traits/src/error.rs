use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    /// Missing credentials or endpoint. Never retried.
    #[error("Collaborator not configured: {0}")]
    NotConfigured(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The supplied revision token no longer matches the remote file.
    #[error("Stale revision token for {path}")]
    StaleRevision { path: String },

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BridgeError::Transient(_) | BridgeError::RateLimited(_) => true,
            BridgeError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    pub fn is_stale_revision(&self) -> bool {
        matches!(self, BridgeError::StaleRevision { .. })
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
