use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Service initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Configuration error: {0}")]
    Config(#[from] core_runtime::Error),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] core_pipeline::PipelineError),

    #[error("Sync error: {0}")]
    Sync(#[from] core_sync::SyncError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] bridge_traits::BridgeError),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
