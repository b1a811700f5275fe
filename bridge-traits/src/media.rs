//! Media Transcoding Abstraction
//!
//! Image optimization (resize, recompress, format conversion) is delegated to
//! the host. The pipeline only calls through this trait.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Return an optimized version of `data`; `mime_type` is a hint
    async fn transcode(&self, data: Bytes, mime_type: &str) -> Result<Bytes>;
}
