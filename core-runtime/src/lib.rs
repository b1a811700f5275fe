//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the notes platform core:
//! - Logging and tracing infrastructure
//! - Configuration management with capability injection
//! - Event bus system for session, pipeline and sync notifications
//!
//! ## Overview
//!
//! This crate contains the runtime utilities that the pipeline, sync and
//! service crates depend on. It establishes the logging conventions, the
//! fail-fast configuration rules and the event broadcasting mechanism used
//! throughout the system.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
