//! The sync engine: pull UI output directories over rsync-over-SSH.
//!
//! ## Module Map
//!
//! | Module     | Responsibility                                            |
//! |------------|-----------------------------------------------------------|
//! | `rsync`    | `RsyncCommand` - argument vector for one pull            |
//! | `progress` | rsync output parsing, `SyncProgress`, `ProgressStore`    |
//! | `lock`     | `TargetLock` - one rsync per target across processes     |
//! | `runner`   | `SyncRunner` - spawn, stream, log, cancel                |
//! | `service`  | `SyncService` - target → endpoint → run record → runner  |
//!
//! A run is visible three ways while it executes: its row in the history
//! database, its JSON progress file under `<state_dir>/progress/`, and its raw
//! rsync log under `<state_dir>/logs/`.

pub mod lock;
pub mod progress;
pub mod rsync;
pub mod runner;
pub mod service;

use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub use progress::{ProgressStore, SyncProgress};
pub use runner::{NoopObserver, SyncJob, SyncObserver, SyncOutcome, SyncRunner};
pub use service::SyncService;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid sync status: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            SyncStatus::Queued,
            SyncStatus::Running,
            SyncStatus::Completed,
            SyncStatus::Failed,
            SyncStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
        }
        assert!("paused".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SyncStatus::Running.is_terminal());
        assert!(SyncStatus::Cancelled.is_terminal());
    }
}
