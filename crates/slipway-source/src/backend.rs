use crate::RepositoryError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// A resolved point in source history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeSet {
    pub id: String,
    pub author_name: String,
    pub author_email: String,
    pub message: String,
    pub timestamp: String,
    /// Content address of the source tree; equal trees mean no source changes.
    pub tree_id: String,
}

pub trait Repository: Send + Sync {
    fn name(&self) -> &'static str;

    fn repository_path(&self) -> &Path;

    fn is_repository(&self) -> bool {
        self.repository_path().join(".git").exists()
    }

    /// Resolve `id` (or `HEAD` when `None`) to a changeset.
    fn get_change_set(&self, id: Option<&str>) -> Result<ChangeSet, RepositoryError>;

    /// The branch pushes are deployed from.
    ///
    /// This is the branch `HEAD` is attached to. With a detached `HEAD` it is
    /// the only local branch, or else `master` or `main` when present.
    fn deployment_branch(&self) -> Result<Option<String>, RepositoryError>;

    /// Make the working copy match `id` (or `HEAD`) exactly and return the
    /// applied changeset id. On failure the previous checkout is restored.
    ///
    /// When the target is the tip of the deployment branch, `HEAD` is left
    /// attached to that branch so later pushes to it are seen.
    fn update(&self, id: Option<&str>) -> Result<String, RepositoryError>;

    /// Discard local modifications and untracked or ignored files.
    fn clean(&self) -> Result<(), RepositoryError>;

    /// Whether `target` carries a different source tree than `since`.
    fn has_changes(&self, since: &str, target: &str) -> Result<bool, RepositoryError> {
        let before = self.get_change_set(Some(since))?;
        let after = self.get_change_set(Some(target))?;
        Ok(before.tree_id != after.tree_id)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RepositoryKind {
    #[default]
    GitExe,
    #[serde(rename = "libgit2")]
    LibGit2,
}

impl fmt::Display for RepositoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryKind::GitExe => write!(f, "git-exe"),
            RepositoryKind::LibGit2 => write!(f, "libgit2"),
        }
    }
}

impl FromStr for RepositoryKind {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git-exe" | "git" => Ok(RepositoryKind::GitExe),
            "libgit2" => Ok(RepositoryKind::LibGit2),
            other => Err(RepositoryError::UnknownBackend(other.to_owned())),
        }
    }
}

/// Pick the deployment branch among local branches when `HEAD` is detached.
pub(crate) fn fallback_branch(names: &[String]) -> Option<String> {
    if let [only] = names {
        return Some(only.clone());
    }
    ["master", "main"]
        .into_iter()
        .find(|wanted| names.iter().any(|n| n == wanted))
        .map(str::to_owned)
}

pub fn select_repository(
    kind: RepositoryKind,
    path: &Path,
    git_executable: Option<PathBuf>,
) -> Box<dyn Repository> {
    match kind {
        RepositoryKind::GitExe => {
            let repo = crate::git_exe::GitExeRepository::new(path);
            Box::new(match git_executable {
                Some(exe) => repo.with_executable(exe),
                None => repo,
            })
        }
        RepositoryKind::LibGit2 => Box::new(crate::libgit::LibGit2Repository::new(path)),
    }
}
