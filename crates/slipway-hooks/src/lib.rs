//! Post-deployment web hooks.
//!
//! Registrations live in the site's hooks file and are only read or rewritten
//! while holding the hooks lock. Delivery is synchronous and best-effort: each
//! subscriber gets a bounded number of attempts, after which the failure is
//! logged and dropped.

pub mod http;
pub mod registry;

pub use http::{signature, DeliveryPolicy, NotifyReport, WebHooksManager};
pub use registry::{HookRegistration, HookRegistry};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const EVENT_HEADER: &str = "X-Slipway-Event";
pub const SIGNATURE_HEADER: &str = "X-Slipway-Signature";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum HookEvent {
    #[serde(rename = "deployment.succeeded")]
    DeploymentSucceeded,
    #[serde(rename = "deployment.failed")]
    DeploymentFailed,
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookEvent::DeploymentSucceeded => write!(f, "deployment.succeeded"),
            HookEvent::DeploymentFailed => write!(f, "deployment.failed"),
        }
    }
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("hooks I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("hooks serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("hooks store error: {0}")]
    Store(#[from] slipway_store::StoreError),
    #[error("hooks lock error: {0}")]
    Lock(#[from] slipway_store::LockError),
    #[error("invalid hook url '{0}': must start with http:// or https://")]
    InvalidUrl(String),
    #[error("hook delivery failed: {0}")]
    Http(String),
}
