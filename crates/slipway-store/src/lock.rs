//! Cross-process advisory locks backed by lock files.
//!
//! A lock is held while its file exists and names a live process. The file is
//! created with `O_CREAT | O_EXCL`, so only one acquirer can win; the holder's
//! identity is written into it as JSON. A file whose holder is gone is reclaimed
//! by the next acquirer. Reclaims are serialized through an `fs2` lock on a
//! sidecar file so two acquirers can never both delete and recreate.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Default polling interval for [`OperationLock::acquire_with_timeout`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// An empty or unparseable lock file younger than this is assumed to be
/// mid-write by its creator.
const UNREADABLE_GRACE: Duration = Duration::from_secs(10);

/// Holders on another host cannot be checked; they expire after this long.
const FOREIGN_HOLDER_TTL: chrono::Duration = chrono::Duration::hours(1);

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("timed out after {}ms waiting for lock '{name}'", waited.as_millis())]
    Timeout { name: String, waited: Duration },
}

/// Identity of a lock holder, as written into the lock file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: String,
    pub token: String,
}

impl LockInfo {
    pub fn current() -> Self {
        let pid = std::process::id();
        let now = Utc::now();
        let seq = TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self {
            pid,
            hostname: hostname(),
            acquired_at: now.to_rfc3339(),
            token: format!(
                "{pid}-{}-{seq}",
                now.timestamp_nanos_opt().unwrap_or_default()
            ),
        }
    }

    /// Whether the recorded holder still exists.
    ///
    /// Same-host holders are checked with `kill(pid, 0)`. Holders on another
    /// host are considered alive until [`FOREIGN_HOLDER_TTL`] has passed.
    pub fn is_alive(&self) -> bool {
        if self.hostname == hostname() {
            return process_alive(self.pid);
        }
        match DateTime::parse_from_rfc3339(&self.acquired_at) {
            Ok(at) => Utc::now().signed_duration_since(at) < FOREIGN_HOLDER_TTL,
            Err(_) => false,
        }
    }
}

/// Whether a process with `pid` exists on this host.
#[allow(unsafe_code)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    if pid_i32 <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission checks.
    let ret = unsafe { libc::kill(pid_i32, 0) };
    if ret == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[allow(unsafe_code)]
fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for writes of buf.len() bytes.
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if ret != 0 {
        return String::new();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

enum Holder {
    Vacant,
    Busy,
    Stale(String),
}

/// A named lock file guarding one shared resource.
#[derive(Debug, Clone)]
pub struct OperationLock {
    path: PathBuf,
    poll_interval: Duration,
}

impl OperationLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn name(&self) -> String {
        self.path
            .file_stem()
            .map_or_else(|| "lock".to_owned(), |s| s.to_string_lossy().into_owned())
    }

    /// Take the lock without waiting.
    ///
    /// Returns `Ok(None)` when a live holder owns it. A stale holder is
    /// reclaimed and acquisition retried once.
    pub fn try_acquire(&self) -> Result<Option<LockGuard>, LockError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        if let Some(guard) = self.create_exclusive()? {
            return Ok(Some(guard));
        }
        if self.reclaim_if_stale()? {
            return self.create_exclusive();
        }
        Ok(None)
    }

    /// Poll [`try_acquire`](Self::try_acquire) until it succeeds or `timeout` elapses.
    ///
    /// A zero timeout makes exactly one attempt.
    pub fn acquire_with_timeout(&self, timeout: Duration) -> Result<LockGuard, LockError> {
        let started = Instant::now();
        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(guard);
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    name: self.name(),
                    waited,
                });
            }
            std::thread::sleep(self.poll_interval.min(timeout - waited));
        }
    }

    /// Run `action` while holding the lock, waiting at most `timeout` for it.
    ///
    /// The lock is released when `action` returns, whatever it returns.
    pub fn try_lock_operation<T>(
        &self,
        timeout: Duration,
        action: impl FnOnce() -> T,
    ) -> Result<T, LockError> {
        let guard = self.acquire_with_timeout(timeout)?;
        let output = action();
        if let Err(e) = guard.release() {
            warn!("failed to release lock {}: {e}", self.path.display());
        }
        Ok(output)
    }

    /// Whether a live process currently holds the lock.
    pub fn is_held(&self) -> bool {
        matches!(self.inspect(), Ok(Holder::Busy))
    }

    /// The recorded holder, if the lock file exists and is readable.
    pub fn holder(&self) -> Option<LockInfo> {
        let content = fs::read(&self.path).ok()?;
        serde_json::from_slice(&content).ok()
    }

    fn create_exclusive(&self) -> Result<Option<LockGuard>, LockError> {
        let info = LockInfo::current();
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let write = serde_json::to_vec(&info)
            .map_err(LockError::from)
            .and_then(|content| {
                file.write_all(&content)?;
                file.sync_all()?;
                Ok(())
            });
        if let Err(e) = write {
            let _ = fs::remove_file(&self.path);
            return Err(e);
        }

        debug!("acquired lock {} (pid {})", self.path.display(), info.pid);
        Ok(Some(LockGuard {
            path: self.path.clone(),
            token: info.token,
            released: false,
        }))
    }

    fn inspect(&self) -> Result<Holder, LockError> {
        let content = match fs::read(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Holder::Vacant),
            Err(e) => return Err(e.into()),
        };

        if let Ok(info) = serde_json::from_slice::<LockInfo>(&content) {
            if info.is_alive() {
                return Ok(Holder::Busy);
            }
            return Ok(Holder::Stale(format!(
                "holder pid {} on '{}' is gone",
                info.pid, info.hostname
            )));
        }

        let age = fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .map(|t| t.elapsed().unwrap_or_default())
            .unwrap_or_default();
        if age >= UNREADABLE_GRACE {
            Ok(Holder::Stale("unreadable lock content".to_owned()))
        } else {
            Ok(Holder::Busy)
        }
    }

    /// Delete the lock file if its holder is dead. Returns `true` when the
    /// caller should retry creation.
    fn reclaim_if_stale(&self) -> Result<bool, LockError> {
        let mut reclaim_path = self.path.clone().into_os_string();
        reclaim_path.push(".reclaim");
        let gate = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(PathBuf::from(reclaim_path))?;
        gate.lock_exclusive()?;

        let result = match self.inspect() {
            Ok(Holder::Vacant) => Ok(true),
            Ok(Holder::Busy) => Ok(false),
            Ok(Holder::Stale(reason)) => {
                warn!("reclaiming stale lock {}: {reason}", self.path.display());
                match fs::remove_file(&self.path) {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e),
        };

        let _ = FileExt::unlock(&gate);
        result
    }
}

/// Ownership of an acquired [`OperationLock`].
///
/// Dropping the guard releases the lock, so every exit path (early return,
/// `?`, unwinding panic) gives it back.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    token: String,
    released: bool,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly and report failures. Idempotent with `Drop`.
    pub fn release(mut self) -> Result<(), LockError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let content = match fs::read(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let still_ours = serde_json::from_slice::<LockInfo>(&content)
            .is_ok_and(|info| info.token == self.token);
        if !still_ours {
            warn!(
                "lock {} was taken over by another holder; leaving it in place",
                self.path.display()
            );
            return Ok(());
        }

        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("released lock {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!("failed to release lock {}: {e}", self.path.display());
        }
    }
}
