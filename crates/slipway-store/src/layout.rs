use crate::StoreError;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_REPOSITORY_DIR: &str = "repository";

/// Directory layout of a hosted site.
///
/// All paths hang off the site root. The repository path can be moved with
/// [`with_repository_path`](Self::with_repository_path); everything else is fixed.
#[derive(Debug, Clone)]
pub struct SiteLayout {
    root: PathBuf,
    repository: PathBuf,
}

impl SiteLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let repository = root.join(DEFAULT_REPOSITORY_DIR);
        Self { root, repository }
    }

    /// Relocate the repository. Relative paths are resolved against the site root.
    #[must_use]
    pub fn with_repository_path(mut self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        self.repository = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        self
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn repository_dir(&self) -> &Path {
        &self.repository
    }

    /// The directory the hosting runtime serves as the live application.
    #[inline]
    pub fn web_root(&self) -> PathBuf {
        self.root.join("wwwroot")
    }

    #[inline]
    pub fn deployments_dir(&self) -> PathBuf {
        self.root.join("deployments")
    }

    #[inline]
    pub fn deployment_dir(&self, id: &str) -> PathBuf {
        self.deployments_dir().join(id)
    }

    /// Holds the id of the current deployment.
    #[inline]
    pub fn active_file(&self) -> PathBuf {
        self.deployments_dir().join("active")
    }

    #[inline]
    pub fn settings_file(&self) -> PathBuf {
        self.deployments_dir().join("settings.toml")
    }

    #[inline]
    pub fn hooks_file(&self) -> PathBuf {
        self.deployments_dir().join("hooks.json")
    }

    /// Scratch area where builders write artifact trees before activation.
    #[inline]
    pub fn staging_dir(&self) -> PathBuf {
        self.deployments_dir().join("staging")
    }

    /// Where the outgoing web root is parked while a new one is swapped in.
    #[inline]
    pub fn previous_web_root(&self) -> PathBuf {
        self.deployments_dir().join("previous-wwwroot")
    }

    #[inline]
    pub fn autoswap_dir(&self) -> PathBuf {
        self.deployments_dir().join("autoswap")
    }

    #[inline]
    pub fn trace_dir(&self) -> PathBuf {
        self.deployments_dir().join("trace")
    }

    #[inline]
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    #[inline]
    pub fn deployment_lock(&self) -> PathBuf {
        self.locks_dir().join("deployment.lock")
    }

    #[inline]
    pub fn status_lock(&self) -> PathBuf {
        self.locks_dir().join("status.lock")
    }

    #[inline]
    pub fn hooks_lock(&self) -> PathBuf {
        self.locks_dir().join("hooks.lock")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.deployments_dir())?;
        fs::create_dir_all(self.staging_dir())?;
        fs::create_dir_all(self.locks_dir())?;
        fs::create_dir_all(self.web_root())?;
        Ok(())
    }
}
