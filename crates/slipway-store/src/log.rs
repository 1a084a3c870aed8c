use crate::ledger::DeploymentStatusLedger;
use crate::record::{LogEntry, LogKind};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// Sink for the ordered lines of a deployment log.
///
/// `has_errors` is consulted after the pipeline completes: any error line
/// turns an otherwise clean run into a failed invocation.
pub trait Logger: Send + Sync {
    fn log(&self, kind: LogKind, message: &str);

    fn has_errors(&self) -> bool;
}

/// Appends every line to one deployment's log in the ledger.
pub struct LedgerLogger {
    ledger: DeploymentStatusLedger,
    id: String,
    errors: AtomicBool,
}

impl LedgerLogger {
    pub fn new(ledger: DeploymentStatusLedger, id: impl Into<String>) -> Self {
        Self {
            ledger,
            id: id.into(),
            errors: AtomicBool::new(false),
        }
    }

    pub fn deployment_id(&self) -> &str {
        &self.id
    }
}

impl Logger for LedgerLogger {
    fn log(&self, kind: LogKind, message: &str) {
        if kind == LogKind::Error {
            self.errors.store(true, Ordering::SeqCst);
        }
        if let Err(e) = self.ledger.append_log(&self.id, &LogEntry::new(kind, message)) {
            warn!("failed to append to deployment log {}: {e}", self.id);
        }
    }

    fn has_errors(&self) -> bool {
        self.errors.load(Ordering::SeqCst)
    }
}
