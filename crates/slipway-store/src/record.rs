use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a deployment attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Building,
    Deploying,
    Success,
    Failed,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentStatus::Success | DeploymentStatus::Failed)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentStatus::Pending => write!(f, "pending"),
            DeploymentStatus::Building => write!(f, "building"),
            DeploymentStatus::Deploying => write!(f, "deploying"),
            DeploymentStatus::Success => write!(f, "success"),
            DeploymentStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Why a deployment ended in `Failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Contention,
    Repository,
    Build,
    Activation,
    /// The environment cannot be written to (read-only filesystem, permissions).
    Unavailable,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Contention => write!(f, "contention"),
            FailureKind::Repository => write!(f, "repository"),
            FailureKind::Build => write!(f, "build"),
            FailureKind::Activation => write!(f, "activation"),
            FailureKind::Unavailable => write!(f, "unavailable"),
            FailureKind::Internal => write!(f, "internal"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Message,
    Warning,
    Error,
}

/// One line of a deployment log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub time: String,
    pub kind: LogKind,
    pub message: String,
}

impl LogEntry {
    pub fn new(kind: LogKind, message: impl Into<String>) -> Self {
        Self {
            time: chrono::Utc::now().to_rfc3339(),
            kind,
            message: message.into(),
        }
    }
}

/// Persisted state of one deployment attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentRecord {
    pub id: String,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub author_email: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub deployer: Option<String>,
    #[serde(default)]
    pub progress: String,
    pub received_time: String,
    pub start_time: String,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub last_success_end_time: Option<String>,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub is_temporary: bool,
    #[serde(default)]
    pub is_read_only: bool,
    #[serde(default)]
    pub current: bool,
    #[serde(default)]
    pub failure: Option<FailureKind>,
    #[serde(default)]
    pub failure_detail: Option<String>,
    /// blake3 checksum of the record with this field cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl DeploymentRecord {
    pub fn new(id: impl Into<String>, deployer: Option<&str>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: id.into(),
            status: DeploymentStatus::Pending,
            status_text: String::new(),
            author: None,
            author_email: None,
            message: None,
            deployer: deployer.map(str::to_owned),
            progress: String::new(),
            received_time: now.clone(),
            start_time: now,
            end_time: None,
            last_success_end_time: None,
            complete: false,
            is_temporary: false,
            is_read_only: false,
            current: false,
            failure: None,
            failure_detail: None,
            checksum: None,
        }
    }

    pub(crate) fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

/// Generate an id for a deployment whose changeset is not yet known.
pub fn generate_id() -> String {
    let seed = format!(
        "{}:{}",
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    );
    blake3::hash(seed.as_bytes()).to_hex()[..40].to_owned()
}

/// Deployment ids name directories in the ledger, so they are restricted to
/// `[A-Za-z0-9._-]`, at most 128 characters, and may not start with a dot.
pub fn validate_deployment_id(id: &str) -> Result<(), StoreError> {
    if id.is_empty() || id.len() > 128 {
        return Err(StoreError::InvalidId(format!(
            "'{id}': must be 1-128 characters"
        )));
    }
    if id.starts_with('.') {
        return Err(StoreError::InvalidId(format!(
            "'{id}': must not start with '.'"
        )));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.')
    {
        return Err(StoreError::InvalidId(format!(
            "'{id}': must match [A-Za-z0-9._-]"
        )));
    }
    Ok(())
}
