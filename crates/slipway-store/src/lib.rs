//! Filesystem-backed state for Slipway deployments.
//!
//! This crate owns everything a deployment persists on disk: the `SiteLayout`
//! describing where the repository, web root, ledger, and lock files live, the
//! cross-process `OperationLock` built on exclusive lock-file creation, and the
//! `DeploymentStatusLedger` that records every deployment attempt durably.

pub mod layout;
pub mod ledger;
pub mod lock;
pub mod log;
pub mod record;

pub use layout::SiteLayout;
pub use ledger::DeploymentStatusLedger;
pub use lock::{process_alive, LockError, LockGuard, LockInfo, OperationLock};
pub use log::{LedgerLogger, Logger};
pub use record::{
    generate_id, validate_deployment_id, DeploymentRecord, DeploymentStatus, FailureKind,
    LogEntry, LogKind,
};

use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` into it is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Replace `dest` with `content` via temp file, fsync, rename, and dir fsync.
///
/// Readers see either the old or the new file, never a torn write.
pub fn write_atomic(dest: &Path, content: &[u8]) -> Result<(), StoreError> {
    let dir = dest
        .parent()
        .ok_or_else(|| StoreError::Io(std::io::Error::other("destination has no parent")))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),
    #[error("invalid deployment id: {0}")]
    InvalidId(String),
    #[error("integrity check failed for deployment '{id}': expected {expected}, got {actual}")]
    IntegrityFailure {
        id: String,
        expected: String,
        actual: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("file.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn store_error_display_not_found() {
        let e = StoreError::DeploymentNotFound("abc123".to_owned());
        assert!(e.to_string().contains("abc123"));
    }

    #[test]
    fn store_error_display_integrity_failure() {
        let e = StoreError::IntegrityFailure {
            id: "dep".to_owned(),
            expected: "exp".to_owned(),
            actual: "act".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("exp"));
        assert!(msg.contains("act"));
    }
}
