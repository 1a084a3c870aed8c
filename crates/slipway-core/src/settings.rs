use crate::CoreError;
use serde::{Deserialize, Serialize};
use slipway_build::BuildSettings;
use slipway_source::RepositoryKind;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_DISABLE_DEPLOYMENT: &str = "SCM_DISABLE_DEPLOYMENT_ON_PUSH";
pub const ENV_USE_LIBGIT2: &str = "SCM_USE_LIBGIT2";
pub const ENV_TRACE_LEVEL: &str = "SCM_TRACE_LEVEL";
pub const ENV_REPOSITORY_PATH: &str = "SCM_REPOSITORY_PATH";
pub const ENV_TRACE_FILE: &str = "SCM_TRACE_FILE";

pub const MAX_TRACE_LEVEL: u8 = 4;

/// Site deployment settings, read from `deployments/settings.toml`.
///
/// Every field is optional in the file. Environment switches are layered on
/// top with [`DeploySettings::apply_env`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeploySettings {
    pub disable_deployment: bool,
    pub repository: RepositoryKind,
    pub git_executable: Option<PathBuf>,
    /// Repository location, relative to the site root.
    pub repository_path: Option<PathBuf>,
    /// Branch or ref deployed when no changeset is requested. `HEAD` when unset.
    pub branch: Option<String>,
    /// 0 (errors only) through 4 (everything).
    pub trace_level: u8,
    /// File name under `deployments/trace/` receiving a copy of the deployment log.
    pub trace_file: Option<String>,
    /// How long to wait for a deployment lock that is already held at startup.
    pub lock_wait_secs: u64,
    pub build: BuildSettings,
    pub build_properties: BTreeMap<String, String>,
    pub auto_swap_slot: Option<String>,
    pub auto_swap_command: Option<String>,
    pub hook_attempts: u32,
    pub hook_timeout_secs: u64,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            disable_deployment: false,
            repository: RepositoryKind::default(),
            git_executable: None,
            repository_path: None,
            branch: None,
            trace_level: 1,
            trace_file: None,
            lock_wait_secs: 60,
            build: BuildSettings::default(),
            build_properties: BTreeMap::new(),
            auto_swap_slot: None,
            auto_swap_command: None,
            hook_attempts: 3,
            hook_timeout_secs: 10,
        }
    }
}

fn truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

impl DeploySettings {
    pub fn parse(content: &str) -> Result<Self, CoreError> {
        let settings: Self = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.trace_level > MAX_TRACE_LEVEL {
            return Err(CoreError::Settings(format!(
                "trace_level must be 0-{MAX_TRACE_LEVEL}, got {}",
                self.trace_level
            )));
        }
        if self.hook_attempts == 0 {
            return Err(CoreError::Settings("hook_attempts must be at least 1".to_owned()));
        }
        Ok(())
    }

    /// Apply the `SCM_*` environment switches. `lookup` is usually
    /// `|k| std::env::var(k).ok()`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), CoreError> {
        if let Some(v) = lookup(ENV_DISABLE_DEPLOYMENT) {
            self.disable_deployment = truthy(&v);
        }
        if let Some(v) = lookup(ENV_USE_LIBGIT2) {
            self.repository = if truthy(&v) {
                RepositoryKind::LibGit2
            } else {
                RepositoryKind::GitExe
            };
        }
        if let Some(v) = lookup(ENV_TRACE_LEVEL) {
            self.trace_level = v
                .trim()
                .parse()
                .map_err(|_| CoreError::Settings(format!("{ENV_TRACE_LEVEL}: not a number: '{v}'")))?;
        }
        if let Some(v) = lookup(ENV_REPOSITORY_PATH).filter(|v| !v.trim().is_empty()) {
            self.repository_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup(ENV_TRACE_FILE).filter(|v| !v.trim().is_empty()) {
            self.trace_file = Some(v);
        }
        self.validate()
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }
}
