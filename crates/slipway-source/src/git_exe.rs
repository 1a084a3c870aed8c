use crate::backend::{fallback_branch, ChangeSet, Repository};
use crate::RepositoryError;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

/// `%x00`-separated fields: commit, tree, author name, author email, date, body.
const LOG_FORMAT: &str = "--format=%H%x00%T%x00%an%x00%ae%x00%aI%x00%B";

/// Repository backend driving the `git` executable.
pub struct GitExeRepository {
    path: PathBuf,
    executable: PathBuf,
}

impl GitExeRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            executable: PathBuf::from("git"),
        }
    }

    #[must_use]
    pub fn with_executable(mut self, exe: impl Into<PathBuf>) -> Self {
        self.executable = exe.into();
        self
    }

    /// Whether the configured executable can be run at all.
    pub fn available(&self) -> bool {
        Command::new(&self.executable)
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    fn git(&self, args: &[&str]) -> Result<String, RepositoryError> {
        debug!("git {}", args.join(" "));
        // A GIT_DIR inherited from a hook would point git at the wrong repository.
        let output = Command::new(&self.executable)
            .args(args)
            .current_dir(&self.path)
            .env_remove("GIT_DIR")
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .map_err(|e| {
                RepositoryError::Transient(format!(
                    "failed to run {}: {e}",
                    self.executable.display()
                ))
            })?;

        if !output.status.success() {
            return Err(RepositoryError::CommandFailed {
                command: format!("git {}", args.join(" ")),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_owned())
    }

    fn resolve(&self, id: Option<&str>) -> Result<String, RepositoryError> {
        if !self.is_repository() {
            return Err(RepositoryError::NotARepository(self.path.clone()));
        }
        let rev = id.unwrap_or("HEAD");
        let spec = format!("{rev}^{{commit}}");
        match self.git(&["rev-parse", "--verify", "--quiet", &spec]) {
            Ok(sha) => Ok(sha),
            Err(RepositoryError::CommandFailed { .. }) if id.is_none() => Err(
                RepositoryError::NoChanges(format!("{} has no commits", self.path.display())),
            ),
            Err(RepositoryError::CommandFailed { .. }) => {
                Err(RepositoryError::UnknownChangeSet(rev.to_owned()))
            }
            Err(e) => Err(e),
        }
    }

    /// The deployment branch, if `target` is its tip.
    fn branch_at(&self, target: &str) -> Result<Option<String>, RepositoryError> {
        let Some(branch) = self.deployment_branch()? else {
            return Ok(None);
        };
        let tip = self
            .git(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .ok();
        Ok((tip.as_deref() == Some(target)).then_some(branch))
    }

    fn restore(&self, previous: Option<&str>) {
        let Some(prev) = previous else { return };
        warn!("restoring working copy to {prev}");
        if let Err(e) = self.git(&["checkout", "--force", prev]) {
            warn!("failed to restore {prev}: {e}");
        }
        if let Err(e) = self.git(&["clean", "-fd"]) {
            warn!("failed to clean after restore: {e}");
        }
    }
}

fn parse_log(raw: &str) -> Result<ChangeSet, RepositoryError> {
    let mut fields = raw.splitn(6, '\0');
    let mut next = || {
        fields
            .next()
            .map(str::to_owned)
            .ok_or_else(|| RepositoryError::Transient(format!("malformed git log output: {raw:?}")))
    };
    Ok(ChangeSet {
        id: next()?,
        tree_id: next()?,
        author_name: next()?,
        author_email: next()?,
        timestamp: next()?,
        message: next()?.trim().to_owned(),
    })
}

impl Repository for GitExeRepository {
    fn name(&self) -> &'static str {
        "git-exe"
    }

    fn repository_path(&self) -> &Path {
        &self.path
    }

    fn get_change_set(&self, id: Option<&str>) -> Result<ChangeSet, RepositoryError> {
        let sha = self.resolve(id)?;
        let raw = self.git(&["log", "-1", LOG_FORMAT, &sha])?;
        parse_log(&raw)
    }

    fn deployment_branch(&self) -> Result<Option<String>, RepositoryError> {
        if !self.is_repository() {
            return Err(RepositoryError::NotARepository(self.path.clone()));
        }
        // Exits 1 when HEAD is detached.
        match self.git(&["symbolic-ref", "--quiet", "--short", "HEAD"]) {
            Ok(name) if !name.is_empty() => return Ok(Some(name)),
            Ok(_) | Err(RepositoryError::CommandFailed { .. }) => {}
            Err(e) => return Err(e),
        }
        let raw = self.git(&["for-each-ref", "--format=%(refname:short)", "refs/heads/"])?;
        let names: Vec<String> = raw
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect();
        Ok(fallback_branch(&names))
    }

    fn update(&self, id: Option<&str>) -> Result<String, RepositoryError> {
        let target = self.resolve(id)?;
        let previous = self.git(&["rev-parse", "--verify", "--quiet", "HEAD"]).ok();
        let attach = self.branch_at(&target)?;

        let apply = || -> Result<(), RepositoryError> {
            match (attach.as_deref(), id) {
                (Some(branch), _) => self.git(&["checkout", "--force", branch])?,
                (None, Some(_)) => self.git(&["checkout", "--force", "--detach", &target])?,
                (None, None) => self.git(&["reset", "--hard", "HEAD"])?,
            };
            self.git(&["clean", "-fd"])?;
            if self.path.join(".gitmodules").exists() {
                self.git(&["submodule", "update", "--init", "--recursive"])?;
            }
            Ok(())
        };

        if let Err(e) = apply() {
            self.restore(previous.as_deref());
            return Err(e);
        }
        debug!("working copy at {target}");
        Ok(target)
    }

    fn clean(&self) -> Result<(), RepositoryError> {
        if !self.is_repository() {
            return Err(RepositoryError::NotARepository(self.path.clone()));
        }
        self.git(&["reset", "--hard", "HEAD"])?;
        self.git(&["clean", "-xdf"])?;
        Ok(())
    }
}
