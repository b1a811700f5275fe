//! # Core Pipeline
//!
//! Turns bursts of photographed handwritten pages into published Markdown
//! notes.
//!
//! ## Overview
//!
//! - [`session`]: time-windowed aggregation of units per originator
//! - [`retry`]: bounded retry with exponential backoff for collaborator calls
//! - [`quality`]: format signature and size checks before upload
//! - [`stages`]: upload, backup, recognition and publish stages
//! - [`assembly`]: Markdown rendering of recognized pages
//! - [`coordinator`]: drives sessions and batches through the stages
//!
//! ## Usage
//!
//! ```ignore
//! use core_pipeline::{select_session_store, PipelineCoordinator, Unit};
//! use core_runtime::events::EventBus;
//! use std::sync::Arc;
//!
//! let coordinator = PipelineCoordinator::new(&config, Arc::new(EventBus::new(100)));
//! let sessions = select_session_store(
//!     config.key_value_store.clone(),
//!     config.session_window,
//!     config.clock.clone(),
//! );
//!
//! sessions.add(&unit.originator_id.clone(), unit).await?;
//! if let Some(session) = sessions.end_session("ana").await? {
//!     let result = coordinator.process_session(session).await;
//!     println!("published {:?}", result.note_path);
//! }
//! ```

pub mod assembly;
pub mod coordinator;
pub mod error;
pub mod quality;
pub mod retry;
pub mod session;
pub mod stages;

pub use coordinator::{BatchResult, PipelineCoordinator, ProcessingResult, StageFailure, StageTiming};
pub use error::{PipelineError, Result, SessionError};
pub use retry::{RetryPolicy, Retryable};
pub use session::{
    select_session_store, InMemorySessionStore, KvSessionStore, Session, SessionStore,
    SessionUpdate, Unit, UnitId,
};
pub use stages::Stage;
