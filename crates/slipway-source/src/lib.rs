//! Source repository access for Slipway deployments.
//!
//! A deployment needs three things from source control: resolve a changeset,
//! materialize it as a clean working copy, and tell whether it differs from what
//! is already live. The [`Repository`] trait captures exactly that. Two
//! interchangeable variants implement it: [`GitExeRepository`] drives the `git`
//! executable, [`LibGit2Repository`] embeds libgit2.

pub mod backend;
pub mod git_exe;
pub mod libgit;

pub use backend::{select_repository, ChangeSet, Repository, RepositoryKind};
pub use git_exe::GitExeRepository;
pub use libgit::LibGit2Repository;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("not a repository: {}", .0.display())]
    NotARepository(PathBuf),
    #[error("no changes to deploy: {0}")]
    NoChanges(String),
    #[error("unknown changeset: {0}")]
    UnknownChangeSet(String),
    #[error("'{command}' exited with code {}: {stderr}", code.map_or_else(|| "?".to_owned(), |c| c.to_string()))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("transient repository failure: {0}")]
    Transient(String),
    #[error("libgit2 error: {0}")]
    Library(String),
    #[error("unknown repository backend '{0}'")]
    UnknownBackend(String),
    #[error("repository I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RepositoryError {
    /// Failures worth retrying later: I/O, network, spawn errors.
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Transient(_) | RepositoryError::Io(_))
    }
}

impl From<git2::Error> for RepositoryError {
    fn from(e: git2::Error) -> Self {
        match e.class() {
            git2::ErrorClass::Net | git2::ErrorClass::Os | git2::ErrorClass::Ssl => {
                RepositoryError::Transient(e.message().to_owned())
            }
            _ => RepositoryError::Library(e.message().to_owned()),
        }
    }
}
