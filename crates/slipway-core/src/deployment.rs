use crate::activation::{self, is_unavailable, LocalFs, SiteFs};
use crate::autoswap::{AutoSwapHandler, SwapOutcome};
use crate::lifecycle::validate_transition;
use crate::logger::CascadeLogger;
use crate::settings::DeploySettings;
use crate::CoreError;
use slipway_build::{select_builder, BuildProperties, BUILD_TARGETS_PATH, COMMIT_ID, DEPLOYER};
use slipway_hooks::{DeliveryPolicy, HookEvent, HookRegistry, WebHooksManager};
use slipway_source::{ChangeSet, Repository, RepositoryError};
use slipway_store::{
    generate_id, DeploymentRecord, DeploymentStatus, DeploymentStatusLedger, FailureKind,
    LedgerLogger, LockError, LogKind, Logger, OperationLock, SiteLayout,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn};

/// Final result of one `deploy` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployReport {
    /// Deployment id; empty when deployment is disabled.
    pub id: String,
    pub status: DeploymentStatus,
    pub failure: Option<FailureKind>,
    pub failure_detail: Option<String>,
    /// Completed without building because nothing changed.
    pub no_op: bool,
    pub swap: SwapOutcome,
}

impl DeployReport {
    fn disabled() -> Self {
        Self {
            id: String::new(),
            status: DeploymentStatus::Success,
            failure: None,
            failure_detail: None,
            no_op: true,
            swap: SwapOutcome::Skipped {
                reason: "deployment is disabled".to_owned(),
            },
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == DeploymentStatus::Success
    }
}

/// A failure inside the pipeline, before it is written to the ledger.
struct StepFailure {
    kind: FailureKind,
    detail: String,
}

impl StepFailure {
    fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    fn io(context: &str, e: &std::io::Error, otherwise: FailureKind) -> Self {
        let kind = if is_unavailable(e) {
            FailureKind::Unavailable
        } else {
            otherwise
        };
        Self::new(kind, format!("{context}: {e}"))
    }
}

/// Drives a deployment from a pushed changeset to an activated web root.
///
/// One pipeline runs at a time per site: `deploy` holds the deployment lock for
/// its whole duration. Every status change is validated against the lifecycle
/// rules and persisted in the ledger before the next step starts.
pub struct DeploymentManager {
    layout: SiteLayout,
    settings: DeploySettings,
    ledger: DeploymentStatusLedger,
    lock: OperationLock,
    lock_timeout: Duration,
    fs: Arc<dyn SiteFs>,
    hooks: WebHooksManager,
    autoswap: AutoSwapHandler,
    logger: Arc<dyn Logger>,
    build_targets: Option<PathBuf>,
}

impl DeploymentManager {
    pub fn new(layout: SiteLayout, settings: DeploySettings, logger: Arc<dyn Logger>) -> Self {
        let policy = DeliveryPolicy {
            attempts: settings.hook_attempts,
            timeout: settings.hook_timeout(),
            ..DeliveryPolicy::default()
        };
        let hooks = WebHooksManager::with_policy(HookRegistry::new(&layout), policy);
        let autoswap = AutoSwapHandler::new(
            layout.clone(),
            settings.auto_swap_slot.clone(),
            settings.auto_swap_command.clone(),
        );
        Self {
            ledger: DeploymentStatusLedger::new(layout.clone()),
            lock: OperationLock::new(layout.deployment_lock()),
            lock_timeout: Duration::ZERO,
            fs: Arc::new(LocalFs),
            hooks,
            autoswap,
            logger,
            build_targets: None,
            layout,
            settings,
        }
    }

    #[must_use]
    pub fn with_fs(mut self, fs: Arc<dyn SiteFs>) -> Self {
        self.fs = fs;
        self
    }

    /// How long `deploy` waits for the deployment lock. Zero makes one attempt.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_build_targets(mut self, path: impl Into<PathBuf>) -> Self {
        self.build_targets = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_hook_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.hooks = WebHooksManager::with_policy(HookRegistry::new(&self.layout), policy);
        self
    }

    pub fn ledger(&self) -> &DeploymentStatusLedger {
        &self.ledger
    }

    pub fn layout(&self) -> &SiteLayout {
        &self.layout
    }

    fn logger_for(&self, id: &str) -> CascadeLogger {
        let ledger: Arc<dyn Logger> = Arc::new(LedgerLogger::new(self.ledger.clone(), id));
        CascadeLogger::new(vec![Arc::clone(&self.logger), ledger])
    }

    /// Deploy `change_set` (or the configured branch, or `HEAD`) from `repo`.
    ///
    /// Component failures end as a `Failed` report recorded in the ledger.
    /// `Err` means the pipeline could not run or could not record its outcome:
    /// the lock was contended, or the ledger itself failed.
    pub fn deploy(
        &self,
        repo: &dyn Repository,
        change_set: Option<&str>,
        deployer: Option<&str>,
        clean: bool,
    ) -> Result<DeployReport, CoreError> {
        if self.settings.disable_deployment {
            info!("deployment is disabled for this site");
            return Ok(DeployReport::disabled());
        }

        let _guard = self
            .lock
            .acquire_with_timeout(self.lock_timeout)
            .map_err(|e| {
                if matches!(e, LockError::Timeout { .. }) {
                    let holder = self.lock.holder().map_or_else(
                        || e.to_string(),
                        |h| format!("pid {} on {}", h.pid, h.hostname),
                    );
                    CoreError::LockContended(holder)
                } else {
                    CoreError::Lock(e)
                }
            })?;
        self.layout.initialize()?;

        let span = info_span!("deployment", repository = repo.name());
        let _entered = span.enter();

        // Failures before the changeset is known are recorded under a temporary id.
        let temp_id = generate_id();
        let mut temp = DeploymentRecord::new(&temp_id, deployer);
        temp.is_temporary = true;
        temp.status_text = "Receiving changes".to_owned();
        self.ledger.create(&temp)?;

        let resolved = {
            let _step = info_span!("resolve").entered();
            self.resolve(repo, change_set, clean)
        };
        let cs = match resolved {
            Ok(cs) => cs,
            Err(e) => {
                let logger = self.logger_for(&temp_id);
                let failure = StepFailure::new(FailureKind::Repository, e.to_string());
                return self.fail(&temp_id, DeploymentStatus::Pending, failure, &logger);
            }
        };

        let unchanged = match self.unchanged(repo, &cs) {
            Ok(unchanged) => unchanged,
            Err(e) => {
                let logger = self.logger_for(&temp_id);
                let failure = StepFailure::new(e.failure_kind(), e.to_string());
                return self.fail(&temp_id, DeploymentStatus::Pending, failure, &logger);
            }
        };
        // Pushing the already-current commit again must not reset its record.
        if unchanged && self.ledger.current_id()?.as_deref() == Some(cs.id.as_str()) {
            let logger = self.logger_for(&temp_id);
            return self.finish_no_op(&temp_id, &logger);
        }

        let mut record = DeploymentRecord::new(&cs.id, deployer);
        record.author = Some(cs.author_name.clone());
        record.author_email = Some(cs.author_email.clone());
        record.message = Some(cs.message.clone());
        record.status_text = "Receiving changes".to_owned();
        self.ledger.create(&record)?;
        if let Err(e) = self.ledger.remove(&temp_id) {
            warn!("failed to discard temporary record {temp_id}: {e}");
        }

        let logger = self.logger_for(&cs.id);
        logger.log(
            LogKind::Message,
            &format!(
                "Deploying {} by {}: {}",
                short(&cs.id),
                cs.author_name,
                first_line(&cs.message)
            ),
        );
        if unchanged {
            return self.finish_no_op(&cs.id, &logger);
        }

        match self.run_pipeline(repo, &cs, deployer, &logger) {
            Ok(()) => self.finish_success(&cs.id, &logger),
            Err((from, failure)) => self.fail(&cs.id, from, failure, &logger),
        }
    }

    /// An explicit changeset wins; otherwise the tip of the configured branch,
    /// else of the repository's deployment branch, so a push that only moved a
    /// branch ref is still picked up when `HEAD` is detached.
    fn resolve(
        &self,
        repo: &dyn Repository,
        change_set: Option<&str>,
        clean: bool,
    ) -> Result<ChangeSet, RepositoryError> {
        if !repo.is_repository() {
            return Err(RepositoryError::NotARepository(repo.repository_path().to_path_buf()));
        }
        if clean {
            repo.clean()?;
        }
        let target = match (change_set, &self.settings.branch) {
            (Some(id), _) => Some(id.to_owned()),
            (None, Some(branch)) => Some(branch.clone()),
            (None, None) => repo.deployment_branch()?,
        };
        debug!("resolving {}", target.as_deref().unwrap_or("HEAD"));
        match repo.get_change_set(target.as_deref()) {
            // A deployment branch with no commits yet reads as an empty repository.
            Err(RepositoryError::UnknownChangeSet(_))
                if change_set.is_none() && self.settings.branch.is_none() =>
            {
                repo.get_change_set(None)
            }
            other => other,
        }
    }

    /// Whether `cs` carries the same tree as the current deployment.
    fn unchanged(&self, repo: &dyn Repository, cs: &ChangeSet) -> Result<bool, CoreError> {
        let Some(current) = self.ledger.current_id()? else {
            return Ok(false);
        };
        match repo.has_changes(&current, &cs.id) {
            Ok(changed) => Ok(!changed),
            // The current deployment's commit is gone from history; treat as changed.
            Err(RepositoryError::UnknownChangeSet(id)) => {
                warn!("current deployment {id} is not in the repository; redeploying");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn transition(
        &self,
        id: &str,
        from: DeploymentStatus,
        to: DeploymentStatus,
        text: &str,
    ) -> Result<(), CoreError> {
        validate_transition(from, to)?;
        self.ledger.update(id, |r| {
            r.status = to;
            r.status_text = text.to_owned();
        })?;
        debug!("{id}: {from} -> {to}");
        Ok(())
    }

    fn build_properties(&self, cs: &ChangeSet, deployer: Option<&str>) -> BuildProperties {
        let mut props = self.settings.build_properties.clone();
        if let Some(ref targets) = self.build_targets {
            props.insert(BUILD_TARGETS_PATH.to_owned(), targets.to_string_lossy().into_owned());
        }
        props.insert(COMMIT_ID.to_owned(), cs.id.clone());
        props.insert(DEPLOYER.to_owned(), deployer.unwrap_or_default().to_owned());
        props
    }

    /// Sync, build, activate. On failure returns the status the record was in.
    fn run_pipeline(
        &self,
        repo: &dyn Repository,
        cs: &ChangeSet,
        deployer: Option<&str>,
        logger: &dyn Logger,
    ) -> Result<(), (DeploymentStatus, StepFailure)> {
        use DeploymentStatus::{Building, Deploying, Pending, Success};

        {
            let _step = info_span!("sync").entered();
            logger.log(LogKind::Message, &format!("Updating working copy to {}", short(&cs.id)));
            repo.update(Some(cs.id.as_str()))
                .map_err(|e| (Pending, StepFailure::new(FailureKind::Repository, e.to_string())))?;
        }
        self.transition(&cs.id, Pending, Building, "Building")
            .map_err(internal(Pending))?;

        let staging = self.layout.staging_dir().join(&cs.id);
        {
            let _step = info_span!("build").entered();
            activation::prepare_staging(&*self.fs, &staging).map_err(|e| {
                (Building, StepFailure::io("preparing staging directory", &e, FailureKind::Internal))
            })?;
            if let Err(failure) = self.build(repo.repository_path(), &staging, cs, deployer, logger) {
                if let Err(e) = self.fs.remove_dir_all(&staging) {
                    warn!("failed to remove staging tree {}: {e}", staging.display());
                }
                return Err((Building, failure));
            }
        }
        self.transition(&cs.id, Building, Deploying, "Deploying")
            .map_err(internal(Building))?;

        {
            let _step = info_span!("activate").entered();
            logger.log(LogKind::Message, "Activating build");
            activation::activate(&*self.fs, &staging, &self.layout).map_err(|e| {
                if let Err(cleanup) = self.fs.remove_dir_all(&staging) {
                    warn!("failed to remove staging tree {}: {cleanup}", staging.display());
                }
                (Deploying, StepFailure::io("activation failed", &e, FailureKind::Activation))
            })?;
        }
        validate_transition(Deploying, Success).map_err(internal(Deploying))?;
        Ok(())
    }

    fn build(
        &self,
        working_copy: &Path,
        staging: &Path,
        cs: &ChangeSet,
        deployer: Option<&str>,
        logger: &dyn Logger,
    ) -> Result<(), StepFailure> {
        let builder = select_builder(working_copy, &self.settings.build)
            .map_err(|e| StepFailure::new(FailureKind::Build, e.to_string()))?;
        logger.log(LogKind::Message, &format!("Using {} builder", builder.kind()));
        let props = self.build_properties(cs, deployer);
        let outcome = builder
            .build(working_copy, staging, &props, logger)
            .map_err(|e| StepFailure::new(FailureKind::Build, e.to_string()))?;
        logger.log(
            LogKind::Message,
            &format!("Build finished in {:.1}s", outcome.duration.as_secs_f64()),
        );
        Ok(())
    }

    fn finish_success(&self, id: &str, logger: &dyn Logger) -> Result<DeployReport, CoreError> {
        let now = chrono::Utc::now().to_rfc3339();
        let record = self.ledger.update(id, |r| {
            r.status = DeploymentStatus::Success;
            r.status_text = "Deployment successful".to_owned();
            r.progress.clear();
            r.end_time = Some(now.clone());
            r.last_success_end_time = Some(now.clone());
            r.complete = true;
            r.failure = None;
            r.failure_detail = None;
        })?;
        self.ledger.mark_current(id)?;
        if let Err(e) = activation::confirm(&*self.fs, &self.layout) {
            warn!("failed to remove previous web root: {e}");
        }
        logger.log(LogKind::Message, "Deployment successful");
        info!("deployment {id} succeeded");

        self.notify(HookEvent::DeploymentSucceeded, &record);
        let mut report = DeployReport {
            id: id.to_owned(),
            status: DeploymentStatus::Success,
            failure: None,
            failure_detail: None,
            no_op: false,
            swap: SwapOutcome::Skipped {
                reason: "not evaluated".to_owned(),
            },
        };
        report.swap = self.autoswap.evaluate(&report, logger);
        Ok(report)
    }

    fn finish_no_op(&self, id: &str, logger: &dyn Logger) -> Result<DeployReport, CoreError> {
        validate_transition(DeploymentStatus::Pending, DeploymentStatus::Success)?;
        let now = chrono::Utc::now().to_rfc3339();
        let record = self.ledger.update(id, |r| {
            r.status = DeploymentStatus::Success;
            r.status_text = "no changes".to_owned();
            r.end_time = Some(now.clone());
            r.complete = true;
        })?;
        logger.log(LogKind::Message, "No changes since the current deployment; nothing to do");
        info!("deployment {id} has no changes");

        self.notify(HookEvent::DeploymentSucceeded, &record);
        let mut report = DeployReport {
            id: id.to_owned(),
            status: DeploymentStatus::Success,
            failure: None,
            failure_detail: None,
            no_op: true,
            swap: SwapOutcome::Skipped {
                reason: "not evaluated".to_owned(),
            },
        };
        report.swap = self.autoswap.evaluate(&report, logger);
        Ok(report)
    }

    fn fail(
        &self,
        id: &str,
        from: DeploymentStatus,
        failure: StepFailure,
        logger: &dyn Logger,
    ) -> Result<DeployReport, CoreError> {
        validate_transition(from, DeploymentStatus::Failed)?;
        logger.log(LogKind::Error, &failure.detail);
        let now = chrono::Utc::now().to_rfc3339();
        let record = self.ledger.update(id, |r| {
            r.status = DeploymentStatus::Failed;
            r.status_text = format!("{} failure", failure.kind);
            r.end_time = Some(now.clone());
            r.complete = true;
            r.failure = Some(failure.kind);
            r.failure_detail = Some(failure.detail.clone());
            r.is_read_only = failure.kind == FailureKind::Unavailable;
        })?;
        // The caller reports the failure itself; keep stderr to one summary line.
        info!("deployment {id} failed ({}): {}", failure.kind, failure.detail);

        self.notify(HookEvent::DeploymentFailed, &record);
        Ok(DeployReport {
            id: id.to_owned(),
            status: DeploymentStatus::Failed,
            failure: Some(failure.kind),
            failure_detail: Some(failure.detail),
            no_op: false,
            swap: SwapOutcome::Skipped {
                reason: "deployment did not succeed".to_owned(),
            },
        })
    }

    fn notify(&self, event: HookEvent, record: &DeploymentRecord) {
        let _step = info_span!("hooks").entered();
        let payload = match serde_json::to_value(record) {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to encode hook payload: {e}");
                return;
            }
        };
        match self.hooks.notify(event, &payload) {
            Ok(report) => {
                for (url, error) in report.failed {
                    warn!("hook {url} not notified: {error}");
                }
            }
            Err(e) => warn!("failed to read hook registrations: {e}"),
        }
    }
}

/// Maps a bookkeeping error raised while the record was in `from`.
fn internal(from: DeploymentStatus) -> impl Fn(CoreError) -> (DeploymentStatus, StepFailure) {
    move |e| (from, StepFailure::new(e.failure_kind(), e.to_string()))
}

fn short(id: &str) -> &str {
    &id[..id.len().min(10)]
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or_default()
}
