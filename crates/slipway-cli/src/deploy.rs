use crate::EXIT_SUCCESS;
use slipway_core::settings::DeploySettings;
use slipway_core::{
    shutdown_requested, CascadeLogger, ConsoleLogger, DeploymentManager, SwapOutcome,
    TraceFileLogger,
};
use slipway_source::select_repository;
use slipway_store::{Logger, OperationLock, SiteLayout};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct Request {
    pub build_targets: PathBuf,
    pub deployer: Option<String>,
    pub commit: Option<String>,
    pub clean: bool,
}

pub fn run(layout: SiteLayout, settings: DeploySettings, request: &Request) -> Result<u8, String> {
    let layout = match settings.repository_path {
        Some(ref path) => layout.with_repository_path(path),
        None => layout,
    };
    layout.initialize().map_err(|e| e.to_string())?;

    let console = Arc::new(ConsoleLogger::new());
    let mut logger = CascadeLogger::new(vec![console as Arc<dyn Logger>]);
    if let Some(ref name) = settings.trace_file {
        let trace = TraceFileLogger::open(&layout.trace_dir().join(name))
            .map_err(|e| format!("cannot open trace file {name}: {e}"))?;
        logger.push(Arc::new(trace));
    }
    let logger = Arc::new(logger);

    let repo = select_repository(
        settings.repository,
        layout.repository_dir(),
        settings.git_executable.clone(),
    );

    // A lock that is already held at startup is waited on for a bounded time,
    // giving a dead holder the chance to be reclaimed as stale.
    let lock_timeout = if OperationLock::new(layout.deployment_lock()).is_held() {
        debug!("deployment lock is held; waiting up to {:?}", settings.lock_wait());
        settings.lock_wait()
    } else {
        Duration::ZERO
    };

    let manager = DeploymentManager::new(layout, settings, Arc::clone(&logger) as Arc<dyn Logger>)
        .with_lock_timeout(lock_timeout)
        .with_build_targets(&request.build_targets);
    let report = manager
        .deploy(
            repo.as_ref(),
            request.commit.as_deref(),
            request.deployer.as_deref(),
            request.clean,
        )
        .map_err(|e| e.to_string())?;

    if shutdown_requested() {
        info!("shutdown was requested; deployment {} ran to completion", report.id);
    }
    if let SwapOutcome::Swapped { ref slot } = report.swap {
        info!("deployment {} swapped into {slot}", report.id);
    }

    if !report.succeeded() {
        let detail = report.failure_detail.unwrap_or_else(|| "deployment failed".to_owned());
        return Err(detail);
    }
    if logger.has_errors() {
        return Err(format!("deployment {} logged errors", report.id));
    }
    Ok(EXIT_SUCCESS)
}
