//! Typed error hierarchy for media-sync.
//!
//! Four top-level enums cover the subsystems:
//! - `SyncError` - rsync runs and target locking
//! - `RemoteError` - commands executed over SSH
//! - `VastError` - the VastAI REST API
//! - `ServiceError` - run bookkeeping behind the HTTP API

use thiserror::Error;

/// Errors from the rsync sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Unknown sync target '{0}'")]
    UnknownTarget(String),

    #[error("Target '{target}' is already being synced")]
    TargetBusy { target: String },

    #[error("Failed to spawn rsync ({binary}): {source}")]
    SpawnFailed {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("rsync exited with code {code}: {message}")]
    RsyncFailed { code: i32, message: String },

    #[error("Sync run {run_id} was cancelled")]
    Cancelled { run_id: i64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from commands executed on a remote host over SSH.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Failed to spawn ssh: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Remote command timed out after {secs}s on {host}")]
    Timeout { host: String, secs: u64 },

    #[error("Remote command failed on {host} (exit {code}): {stderr}")]
    CommandFailed {
        host: String,
        code: i32,
        stderr: String,
    },

    #[error("Could not locate a UI install (UI_HOME) on {host}")]
    UiHomeNotFound { host: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the VastAI API client.
#[derive(Debug, Error)]
pub enum VastError {
    #[error("No VastAI API key configured (set VAST_API_KEY or [vast] api_key)")]
    MissingApiKey,

    #[error("VastAI API returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("VastAI API rejected the request: {0}")]
    Rejected(String),

    #[error("Instance {id} has no SSH endpoint yet")]
    NoSshEndpoint { id: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from sync-run bookkeeping.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Sync run {id} not found")]
    RunNotFound { id: i64 },

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Vast(#[from] VastError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_error_target_busy_names_target() {
        let err = SyncError::TargetBusy {
            target: "comfy".into(),
        };
        assert!(err.to_string().contains("comfy"));
        assert!(matches!(err, SyncError::TargetBusy { .. }));
    }

    #[test]
    fn sync_error_spawn_failed_carries_io_kind() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "rsync not found");
        let err = SyncError::SpawnFailed {
            binary: "rsync".into(),
            source: io_err,
        };
        match &err {
            SyncError::SpawnFailed { binary, source } => {
                assert_eq!(binary, "rsync");
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected SpawnFailed"),
        }
    }

    #[test]
    fn remote_error_command_failed_includes_stderr() {
        let err = RemoteError::CommandFailed {
            host: "10.0.0.2".into(),
            code: 255,
            stderr: "Permission denied (publickey)".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("255"));
        assert!(msg.contains("publickey"));
    }

    #[test]
    fn vast_error_http_carries_status() {
        let err = VastError::Http {
            status: 401,
            body: "unauthorized".into(),
        };
        assert!(err.to_string().contains("401"));
    }

    #[test]
    fn service_error_converts_from_sync_error() {
        let inner = SyncError::UnknownTarget("nope".into());
        let err: ServiceError = inner.into();
        match &err {
            ServiceError::Sync(SyncError::UnknownTarget(name)) => assert_eq!(name, "nope"),
            _ => panic!("Expected ServiceError::Sync(UnknownTarget)"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&SyncError::Cancelled { run_id: 1 });
        assert_std_error(&RemoteError::UiHomeNotFound { host: "h".into() });
        assert_std_error(&VastError::MissingApiKey);
        assert_std_error(&ServiceError::LockPoisoned);
    }
}
