use console::Style;
use slipway_store::{LogKind, Logger};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Writes deployment lines to stdout, styled by kind.
///
/// Output shows up in the pushing client's terminal, so everything goes to
/// stdout; stderr is reserved for the final error summary.
#[derive(Debug, Default)]
pub struct ConsoleLogger {
    errors: AtomicBool,
}

impl ConsoleLogger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Logger for ConsoleLogger {
    fn log(&self, kind: LogKind, message: &str) {
        let line = match kind {
            LogKind::Message => message.to_owned(),
            LogKind::Warning => Style::new().yellow().apply_to(message).to_string(),
            LogKind::Error => {
                self.errors.store(true, Ordering::SeqCst);
                Style::new().red().bold().apply_to(message).to_string()
            }
        };
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "{line}");
    }

    fn has_errors(&self) -> bool {
        self.errors.load(Ordering::SeqCst)
    }
}

/// Fans every line out to several loggers.
#[derive(Default)]
pub struct CascadeLogger {
    loggers: Vec<Arc<dyn Logger>>,
}

impl CascadeLogger {
    pub fn new(loggers: Vec<Arc<dyn Logger>>) -> Self {
        Self { loggers }
    }

    pub fn push(&mut self, logger: Arc<dyn Logger>) {
        self.loggers.push(logger);
    }
}

impl Logger for CascadeLogger {
    fn log(&self, kind: LogKind, message: &str) {
        for logger in &self.loggers {
            logger.log(kind, message);
        }
    }

    fn has_errors(&self) -> bool {
        self.loggers.iter().any(|l| l.has_errors())
    }
}

/// Appends plain-text lines to a trace file.
pub struct TraceFileLogger {
    file: Mutex<File>,
    errors: AtomicBool,
}

impl TraceFileLogger {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            errors: AtomicBool::new(false),
        })
    }
}

impl Logger for TraceFileLogger {
    fn log(&self, kind: LogKind, message: &str) {
        if kind == LogKind::Error {
            self.errors.store(true, Ordering::SeqCst);
        }
        let tag = match kind {
            LogKind::Message => "INFO",
            LogKind::Warning => "WARN",
            LogKind::Error => "ERROR",
        };
        let line = format!("{} {tag} {message}\n", chrono::Utc::now().to_rfc3339());
        let Ok(mut file) = self.file.lock() else {
            return;
        };
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!("failed to write trace file: {e}");
        }
    }

    fn has_errors(&self) -> bool {
        self.errors.load(Ordering::SeqCst)
    }
}
