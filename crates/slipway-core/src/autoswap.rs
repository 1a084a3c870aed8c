use crate::deployment::DeployReport;
use serde::{Deserialize, Serialize};
use slipway_build::command::run_streaming;
use slipway_store::{validate_deployment_id, write_atomic, DeploymentStatus, Logger, SiteLayout};
use std::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum SwapOutcome {
    Swapped { slot: String },
    Skipped { reason: String },
    Failed { error: String },
}

impl SwapOutcome {
    fn skipped(reason: &str) -> Self {
        SwapOutcome::Skipped {
            reason: reason.to_owned(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SwapMarker {
    slot: String,
    deployment_id: String,
    swapped_at: String,
}

/// Decides whether a finished deployment is promoted to the configured slot.
pub struct AutoSwapHandler {
    layout: SiteLayout,
    slot: Option<String>,
    command: Option<String>,
}

impl AutoSwapHandler {
    pub fn new(layout: SiteLayout, slot: Option<String>, command: Option<String>) -> Self {
        Self {
            layout,
            slot,
            command,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.slot.is_some()
    }

    /// Swap only after a successful deployment that actually changed the site.
    /// Never fails: problems are reported in the outcome.
    pub fn evaluate(&self, report: &DeployReport, logger: &dyn Logger) -> SwapOutcome {
        let Some(slot) = self.slot.as_deref() else {
            return SwapOutcome::skipped("auto-swap is not configured");
        };
        if report.status != DeploymentStatus::Success {
            return SwapOutcome::skipped("deployment did not succeed");
        }
        if report.no_op {
            return SwapOutcome::skipped("no changes were deployed");
        }

        match self.swap(slot, &report.id, logger) {
            Ok(()) => {
                info!("auto-swapped {} into slot {slot}", report.id);
                SwapOutcome::Swapped {
                    slot: slot.to_owned(),
                }
            }
            Err(error) => {
                warn!("auto-swap to {slot} failed: {error}");
                SwapOutcome::Failed { error }
            }
        }
    }

    fn swap(&self, slot: &str, id: &str, logger: &dyn Logger) -> Result<(), String> {
        validate_deployment_id(slot).map_err(|e| format!("invalid slot name: {e}"))?;
        let marker = SwapMarker {
            slot: slot.to_owned(),
            deployment_id: id.to_owned(),
            swapped_at: chrono::Utc::now().to_rfc3339(),
        };
        let content = serde_json::to_vec_pretty(&marker).map_err(|e| e.to_string())?;
        let path = self.layout.autoswap_dir().join(format!("{slot}.json"));
        write_atomic(&path, &content).map_err(|e| e.to_string())?;

        if let Some(ref command) = self.command {
            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(command)
                .current_dir(self.layout.root())
                .env("SLIPWAY_SWAP_SLOT", slot)
                .env("SLIPWAY_DEPLOYMENT_ID", id);
            run_streaming(cmd, logger).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}
