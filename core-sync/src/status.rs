//! # Sync Status State Machine
//!
//! Lifecycle, history and counters of the reconciler.
//!
//! ## State Machine
//!
//! ```text
//!          tick/manual            completion
//!   Idle ─────────────> Syncing ─────────────> Idle
//!    ↑                   │   ↑
//!    │ resume            │   │ next tick
//!    │          failure  ↓   │
//! Paused <─── (any) ──  Error
//! ```
//!
//! Every state may move to `Paused`; `Paused` only leaves through resume.
//! The reconciler owns the only mutable [`SyncStatus`]; callers receive
//! clones.

use crate::{Result, SyncError};
use chrono::{DateTime, Utc};
use core_runtime::config::ConflictStrategy;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Syncing,
    Error,
    Paused,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Error => "error",
            SyncState::Paused => "paused",
        }
    }

    /// States from which a new run may start
    pub fn can_start_run(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Error)
    }

    fn validate_transition(self, to: SyncState) -> Result<()> {
        let valid = match (self, to) {
            (SyncState::Idle, SyncState::Syncing) => true,
            (SyncState::Error, SyncState::Syncing) => true,
            (SyncState::Syncing, SyncState::Idle) => true,
            (SyncState::Syncing, SyncState::Error) => true,
            (SyncState::Paused, SyncState::Idle) => true,
            (SyncState::Paused, SyncState::Paused) => false,
            (_, SyncState::Paused) => true,
            _ => false,
        };

        if !valid {
            return Err(SyncError::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: to.as_str().to_string(),
                reason: format!("Cannot transition from {} to {}", self, to),
            });
        }

        Ok(())
    }
}

impl FromStr for SyncState {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(SyncState::Idle),
            "syncing" => Ok(SyncState::Syncing),
            "error" => Ok(SyncState::Error),
            "paused" => Ok(SyncState::Paused),
            _ => Err(SyncError::InvalidState(s.to_string())),
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// History entries
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncErrorEntry {
    pub at: DateTime<Utc>,
    /// File the error belongs to; `None` for run-level failures
    pub path: Option<String>,
    pub message: String,
}

/// A path that changed on both sides and was left unresolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub path: String,
    /// `None` when the local file was deleted
    pub local_fingerprint: Option<String>,
    pub remote_fingerprint: String,
    pub strategy: ConflictStrategy,
    pub detected_at: DateTime<Utc>,
}

/// Cumulative counters since the reconciler was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounters {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub files_pushed: u64,
    pub files_pulled: u64,
    pub files_deleted: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
}

// ============================================================================
// SyncStatus
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub last_sync: Option<DateTime<Utc>>,
    /// Only set while automatic sync is armed
    pub next_sync: Option<DateTime<Utc>>,
    pub last_run_id: Option<String>,
    /// Oldest first
    pub errors: VecDeque<SyncErrorEntry>,
    /// Unresolved conflicts, oldest first
    pub conflicts: VecDeque<ConflictRecord>,
    pub counters: SyncCounters,
    max_errors: usize,
    max_conflicts: usize,
}

impl SyncStatus {
    pub fn new(max_errors: usize, max_conflicts: usize) -> Self {
        Self {
            state: SyncState::Idle,
            last_sync: None,
            next_sync: None,
            last_run_id: None,
            errors: VecDeque::new(),
            conflicts: VecDeque::new(),
            counters: SyncCounters::default(),
            max_errors: max_errors.max(1),
            max_conflicts: max_conflicts.max(1),
        }
    }

    /// Moves to `to`, returning the previous state.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidStateTransition`] for moves the lifecycle
    /// does not allow.
    pub fn transition(&mut self, to: SyncState) -> Result<SyncState> {
        self.state.validate_transition(to)?;
        let from = self.state;
        self.state = to;
        Ok(from)
    }

    pub fn push_error(&mut self, at: DateTime<Utc>, path: Option<String>, message: String) {
        if self.errors.len() >= self.max_errors {
            self.errors.pop_front();
        }
        self.errors.push_back(SyncErrorEntry { at, path, message });
    }

    /// Records an unresolved conflict.
    ///
    /// Returns `true` when the path was not already listed. An existing entry
    /// for the same path is refreshed in place.
    pub fn record_conflict(&mut self, conflict: ConflictRecord) -> bool {
        if let Some(existing) = self.conflicts.iter_mut().find(|c| c.path == conflict.path) {
            existing.local_fingerprint = conflict.local_fingerprint;
            existing.remote_fingerprint = conflict.remote_fingerprint;
            existing.strategy = conflict.strategy;
            return false;
        }

        if self.conflicts.len() >= self.max_conflicts {
            self.conflicts.pop_front();
        }
        self.conflicts.push_back(conflict);
        true
    }

    pub fn conflict(&self, path: &str) -> Option<&ConflictRecord> {
        self.conflicts.iter().find(|c| c.path == path)
    }

    pub fn remove_conflict(&mut self, path: &str) -> Option<ConflictRecord> {
        let index = self.conflicts.iter().position(|c| c.path == path)?;
        self.conflicts.remove(index)
    }

    pub fn is_syncing(&self) -> bool {
        self.state == SyncState::Syncing
    }

    pub fn is_paused(&self) -> bool {
        self.state == SyncState::Paused
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn conflict(path: &str) -> ConflictRecord {
        ConflictRecord {
            path: path.to_string(),
            local_fingerprint: Some("l".to_string()),
            remote_fingerprint: "r".to_string(),
            strategy: ConflictStrategy::Prompt,
            detected_at: at(0),
        }
    }

    #[test]
    fn test_state_parsing() {
        assert_eq!("idle".parse::<SyncState>().unwrap(), SyncState::Idle);
        assert_eq!("SYNCING".parse::<SyncState>().unwrap(), SyncState::Syncing);
        assert_eq!("paused".parse::<SyncState>().unwrap(), SyncState::Paused);
        assert!("running".parse::<SyncState>().is_err());
        assert_eq!(SyncState::Error.to_string(), "error");
    }

    #[test]
    fn test_valid_lifecycle() {
        let mut status = SyncStatus::new(5, 5);
        assert_eq!(status.transition(SyncState::Syncing).unwrap(), SyncState::Idle);
        assert_eq!(status.transition(SyncState::Error).unwrap(), SyncState::Syncing);
        assert_eq!(status.transition(SyncState::Syncing).unwrap(), SyncState::Error);
        assert_eq!(status.transition(SyncState::Idle).unwrap(), SyncState::Syncing);
        assert_eq!(status.transition(SyncState::Paused).unwrap(), SyncState::Idle);
        assert_eq!(status.transition(SyncState::Idle).unwrap(), SyncState::Paused);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut status = SyncStatus::new(5, 5);
        assert!(matches!(
            status.transition(SyncState::Error),
            Err(SyncError::InvalidStateTransition { .. })
        ));
        assert!(status.transition(SyncState::Idle).is_err());

        status.transition(SyncState::Paused).unwrap();
        assert!(status.transition(SyncState::Syncing).is_err());
        assert!(status.transition(SyncState::Paused).is_err());
        assert_eq!(status.state, SyncState::Paused);
    }

    #[test]
    fn test_every_state_can_pause() {
        for from in [SyncState::Idle, SyncState::Syncing, SyncState::Error] {
            assert!(from.validate_transition(SyncState::Paused).is_ok(), "{}", from);
        }
    }

    #[test]
    fn test_error_history_is_bounded() {
        let mut status = SyncStatus::new(2, 5);
        for i in 0..3 {
            status.push_error(at(i), None, format!("e{}", i));
        }

        let messages: Vec<_> = status.errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["e1", "e2"]);
    }

    #[test]
    fn test_conflict_list_bounded_and_deduplicated() {
        let mut status = SyncStatus::new(5, 2);
        assert!(status.record_conflict(conflict("a.md")));
        assert!(status.record_conflict(conflict("b.md")));

        let mut refreshed = conflict("a.md");
        refreshed.remote_fingerprint = "r2".to_string();
        assert!(!status.record_conflict(refreshed));
        assert_eq!(status.conflict("a.md").unwrap().remote_fingerprint, "r2");

        assert!(status.record_conflict(conflict("c.md")));
        let paths: Vec<_> = status.conflicts.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["b.md", "c.md"]);

        assert!(status.remove_conflict("b.md").is_some());
        assert!(status.remove_conflict("b.md").is_none());
        assert_eq!(status.conflicts.len(), 1);
    }
}
