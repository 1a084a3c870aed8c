use crate::backend::{fallback_branch, ChangeSet, Repository};
use crate::RepositoryError;
use chrono::{DateTime, Utc};
use git2::build::CheckoutBuilder;
use git2::{BranchType, ErrorCode, Oid};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Repository backend embedding libgit2.
pub struct LibGit2Repository {
    path: PathBuf,
}

impl LibGit2Repository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn open(&self) -> Result<git2::Repository, RepositoryError> {
        if !self.is_repository() {
            return Err(RepositoryError::NotARepository(self.path.clone()));
        }
        Ok(git2::Repository::open(&self.path)?)
    }

    fn resolve<'r>(
        &self,
        repo: &'r git2::Repository,
        id: Option<&str>,
    ) -> Result<git2::Commit<'r>, RepositoryError> {
        let rev = id.unwrap_or("HEAD");
        match repo.revparse_single(rev).and_then(|o| o.peel_to_commit()) {
            Ok(commit) => Ok(commit),
            Err(e)
                if id.is_none()
                    && matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) =>
            {
                Err(RepositoryError::NoChanges(format!(
                    "{} has no commits",
                    self.path.display()
                )))
            }
            Err(e)
                if matches!(
                    e.code(),
                    ErrorCode::NotFound | ErrorCode::Ambiguous | ErrorCode::InvalidSpec
                ) || e.class() == git2::ErrorClass::Object =>
            {
                Err(RepositoryError::UnknownChangeSet(rev.to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn branch_of(repo: &git2::Repository) -> Result<Option<String>, RepositoryError> {
        let head = repo.find_reference("HEAD")?;
        if let Some(name) = head
            .symbolic_target()
            .and_then(|t| t.strip_prefix("refs/heads/"))
        {
            return Ok(Some(name.to_owned()));
        }
        let mut names = Vec::new();
        for branch in repo.branches(Some(BranchType::Local))? {
            let (branch, _) = branch?;
            if let Some(name) = branch.name()? {
                names.push(name.to_owned());
            }
        }
        Ok(fallback_branch(&names))
    }

    /// The deployment branch, if `target` is its tip.
    fn branch_at(repo: &git2::Repository, target: Oid) -> Result<Option<String>, RepositoryError> {
        let Some(name) = Self::branch_of(repo)? else {
            return Ok(None);
        };
        let tip = repo
            .find_branch(&name, BranchType::Local)
            .ok()
            .and_then(|b| b.get().target());
        Ok((tip == Some(target)).then_some(name))
    }

    fn checkout(
        repo: &git2::Repository,
        commit: &git2::Commit<'_>,
        attach: Option<&str>,
        detach: bool,
    ) -> Result<(), RepositoryError> {
        let mut opts = CheckoutBuilder::new();
        opts.force().remove_untracked(true);
        repo.checkout_tree(commit.as_object(), Some(&mut opts))?;
        match attach {
            Some(branch) => repo.set_head(&format!("refs/heads/{branch}"))?,
            None if detach => repo.set_head_detached(commit.id())?,
            None => {}
        }
        Ok(())
    }

    fn restore(repo: &git2::Repository, previous: Option<Oid>) {
        let Some(prev) = previous else { return };
        warn!("restoring working copy to {prev}");
        let result = repo.find_commit(prev).and_then(|commit| {
            let mut opts = CheckoutBuilder::new();
            opts.force().remove_untracked(true);
            repo.checkout_tree(commit.as_object(), Some(&mut opts))?;
            repo.set_head_detached(prev)
        });
        if let Err(e) = result {
            warn!("failed to restore {prev}: {}", e.message());
        }
    }
}

fn to_change_set(commit: &git2::Commit<'_>) -> ChangeSet {
    let author = commit.author();
    let timestamp = DateTime::<Utc>::from_timestamp(commit.time().seconds(), 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();
    ChangeSet {
        id: commit.id().to_string(),
        author_name: String::from_utf8_lossy(author.name_bytes()).into_owned(),
        author_email: String::from_utf8_lossy(author.email_bytes()).into_owned(),
        message: String::from_utf8_lossy(commit.message_bytes())
            .trim()
            .to_owned(),
        timestamp,
        tree_id: commit.tree_id().to_string(),
    }
}

impl Repository for LibGit2Repository {
    fn name(&self) -> &'static str {
        "libgit2"
    }

    fn repository_path(&self) -> &Path {
        &self.path
    }

    fn get_change_set(&self, id: Option<&str>) -> Result<ChangeSet, RepositoryError> {
        let repo = self.open()?;
        let commit = self.resolve(&repo, id)?;
        Ok(to_change_set(&commit))
    }

    fn deployment_branch(&self) -> Result<Option<String>, RepositoryError> {
        let repo = self.open()?;
        Self::branch_of(&repo)
    }

    fn update(&self, id: Option<&str>) -> Result<String, RepositoryError> {
        let repo = self.open()?;
        let target = self.resolve(&repo, id)?;
        let previous = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .map(|c| c.id());

        let attach = Self::branch_at(&repo, target.id())?;

        if let Err(e) = Self::checkout(&repo, &target, attach.as_deref(), id.is_some()) {
            Self::restore(&repo, previous);
            return Err(e);
        }
        debug!("working copy at {}", target.id());
        Ok(target.id().to_string())
    }

    fn clean(&self) -> Result<(), RepositoryError> {
        let repo = self.open()?;
        let mut opts = CheckoutBuilder::new();
        opts.force().remove_untracked(true).remove_ignored(true);
        repo.checkout_head(Some(&mut opts))?;
        Ok(())
    }
}
