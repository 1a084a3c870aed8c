//! Deployment pipeline for Slipway.
//!
//! This crate ties together the repository backends, builders, status ledger,
//! and hooks into the `DeploymentManager`: the driver that takes one pushed
//! changeset from `Pending` through build and activation to a final status.
//! It also provides the lifecycle transition rules, the filesystem capability
//! used for activation, auto-swap evaluation, site settings, and the loggers
//! a deployment writes through.

pub mod activation;
pub mod autoswap;
pub mod concurrency;
pub mod deployment;
pub mod lifecycle;
pub mod logger;
pub mod settings;

pub use activation::{LocalFs, SiteFs};
pub use autoswap::{AutoSwapHandler, SwapOutcome};
pub use concurrency::{install_signal_handler, shutdown_requested};
pub use deployment::{DeployReport, DeploymentManager};
pub use lifecycle::validate_transition;
pub use logger::{CascadeLogger, ConsoleLogger, TraceFileLogger};
pub use settings::DeploySettings;

use slipway_store::FailureKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("store error: {0}")]
    Store(#[from] slipway_store::StoreError),
    #[error("lock error: {0}")]
    Lock(#[from] slipway_store::LockError),
    #[error("repository error: {0}")]
    Repository(#[from] slipway_source::RepositoryError),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("deployment lock is held by another process: {0}")]
    LockContended(String),
    #[error("invalid settings: {0}")]
    Settings(String),
    #[error("settings parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// The ledger classification for a deployment that ended with this error.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            CoreError::Repository(_) => FailureKind::Repository,
            CoreError::LockContended(_) | CoreError::Lock(_) => FailureKind::Contention,
            _ => FailureKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slipway_source::RepositoryError;

    #[test]
    fn failure_kind_classification() {
        let repo: CoreError = RepositoryError::NoChanges("empty".to_owned()).into();
        assert_eq!(repo.failure_kind(), FailureKind::Repository);
        let lock: CoreError = slipway_store::LockError::Timeout {
            name: "deployment".to_owned(),
            waited: std::time::Duration::ZERO,
        }
        .into();
        assert_eq!(lock.failure_kind(), FailureKind::Contention);
        assert_eq!(
            CoreError::LockContended("pid 1".to_owned()).failure_kind(),
            FailureKind::Contention
        );
        assert_eq!(
            CoreError::Settings("bad".to_owned()).failure_kind(),
            FailureKind::Internal
        );
    }
}
