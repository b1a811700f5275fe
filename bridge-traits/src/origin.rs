//! Origin Transport Abstraction
//!
//! Whatever delivers photographed pages to the core: a chat bot, an upload
//! endpoint, a batch import. The core only sees items and end-of-session
//! signals.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// One inbound page
#[derive(Debug, Clone)]
pub struct InboundItem {
    /// Stable identity of the sender (chat id, account id)
    pub originator_id: String,
    pub name: String,
    pub payload: Bytes,
    pub mime_type: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum OriginEvent {
    Item(InboundItem),
    /// Explicit "done" from the originator
    SessionEnd { originator_id: String },
}

#[async_trait]
pub trait OriginTransport: Send + Sync {
    /// Wait for the next event; `None` once the transport is closed
    async fn next_event(&self) -> Result<Option<OriginEvent>>;

    /// Report an outcome back to the originator
    async fn acknowledge(&self, _originator_id: &str, _message: &str) -> Result<()> {
        Ok(())
    }
}
