use bridge_traits::error::BridgeError;
use thiserror::Error;

/// Session store failures.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session update for {originator_id} lost {attempts} compare-and-set races")]
    Contention { originator_id: String, attempts: u32 },

    #[error("Session storage error: {0}")]
    Storage(#[from] BridgeError),

    #[error("Session encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Unsupported payload format for {name}")]
    InvalidFormat { name: String },

    #[error("Payload {name} is {size} bytes, limit is {limit}")]
    PayloadTooLarge { name: String, size: usize, limit: usize },

    #[error("Payload {name} is empty")]
    EmptyPayload { name: String },

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<PipelineError>,
    },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal pipeline error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Errors produced by the quality gate.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidFormat { .. } | Self::PayloadTooLarge { .. } | Self::EmptyPayload { .. }
        )
    }

    /// The innermost bridge error, looking through retry wrappers.
    pub fn bridge_cause(&self) -> Option<&BridgeError> {
        match self {
            Self::Bridge(err) => Some(err),
            Self::RetriesExhausted { source, .. } => source.bridge_cause(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
