//! Workspace umbrella crate.
//!
//! Exposes the `desktop-shims` feature, which pulls in `core-service` with the
//! desktop bridge implementations wired as configuration defaults. Host
//! applications can depend on `notes-workspace` instead of wiring each crate
//! individually.

#[cfg(feature = "desktop-shims")]
pub use core_service::*;
