//! Handwriting Recognition Abstraction

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedText {
    pub text: String,
    /// Service-reported confidence in `0.0..=1.0`, when available
    pub confidence: Option<f32>,
}

/// Recognition service trait
///
/// Best-effort: callers substitute a placeholder when a call fails, so
/// implementations should not retry internally.
#[async_trait]
pub trait RecognitionService: Send + Sync {
    /// Recognize the text on the images behind `blob_urls`
    async fn recognize(&self, blob_urls: &[String]) -> Result<RecognizedText>;
}
