use crate::layout::SiteLayout;
use crate::lock::OperationLock;
use crate::record::{validate_deployment_id, DeploymentRecord, LogEntry};
use crate::{write_atomic, StoreError};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

const STATUS_FILE: &str = "status.json";
const LOG_FILE: &str = "log.jsonl";

/// How long a ledger mutation waits for the status lock.
pub const DEFAULT_STATUS_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Durable record of every deployment attempt on a site.
///
/// Each deployment gets `deployments/<id>/status.json` (rewritten atomically)
/// and `deployments/<id>/log.jsonl` (appended). The `deployments/active` file
/// names the current deployment. Every mutation of status files happens under
/// the status lock; reads take no lock because writes are atomic renames.
#[derive(Debug, Clone)]
pub struct DeploymentStatusLedger {
    layout: SiteLayout,
    lock: OperationLock,
    lock_timeout: Duration,
}

impl DeploymentStatusLedger {
    pub fn new(layout: SiteLayout) -> Self {
        let lock = OperationLock::new(layout.status_lock());
        Self {
            layout,
            lock,
            lock_timeout: DEFAULT_STATUS_LOCK_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn status_path(&self, id: &str) -> PathBuf {
        self.layout.deployment_dir(id).join(STATUS_FILE)
    }

    fn log_path(&self, id: &str) -> PathBuf {
        self.layout.deployment_dir(id).join(LOG_FILE)
    }

    fn locked<T>(
        &self,
        f: impl FnOnce() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.lock.try_lock_operation(self.lock_timeout, f)?
    }

    fn put(&self, record: &DeploymentRecord) -> Result<(), StoreError> {
        let mut with_checksum = record.clone();
        with_checksum.checksum = Some(with_checksum.compute_checksum()?);
        let content = serde_json::to_string_pretty(&with_checksum)?;
        write_atomic(&self.status_path(&record.id), content.as_bytes())
    }

    /// Write a fresh record for a starting deployment.
    ///
    /// Redeploying an id that already has a record resets it and starts a new
    /// log, but carries over `current` and `last_success_end_time` so the
    /// site's active deployment is not forgotten mid-flight.
    pub fn create(&self, record: &DeploymentRecord) -> Result<DeploymentRecord, StoreError> {
        validate_deployment_id(&record.id)?;
        self.locked(|| {
            let mut fresh = record.clone();
            if let Ok(existing) = self.get(&record.id) {
                fresh.current = existing.current;
                fresh.last_success_end_time = existing.last_success_end_time;
            }
            self.put(&fresh)?;
            match fs::remove_file(self.log_path(&record.id)) {
                Ok(()) => debug!("ledger: discarded previous log of {}", record.id),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            debug!("ledger: created record {}", fresh.id);
            Ok(fresh)
        })
    }

    pub fn exists(&self, id: &str) -> bool {
        validate_deployment_id(id).is_ok() && self.status_path(id).exists()
    }

    pub fn get(&self, id: &str) -> Result<DeploymentRecord, StoreError> {
        validate_deployment_id(id)?;
        let path = self.status_path(id);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::DeploymentNotFound(id.to_owned()));
            }
            Err(e) => return Err(e.into()),
        };
        let record: DeploymentRecord = serde_json::from_str(&content)?;

        if let Some(ref expected) = record.checksum {
            let actual = record.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    id: id.to_owned(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(record)
    }

    /// Read-modify-write a record under the status lock.
    pub fn update<F>(&self, id: &str, mutator: F) -> Result<DeploymentRecord, StoreError>
    where
        F: FnOnce(&mut DeploymentRecord),
    {
        self.locked(|| {
            let mut record = self.get(id)?;
            mutator(&mut record);
            record.id = id.to_owned();
            self.put(&record)?;
            Ok(record)
        })
    }

    /// Make `id` the single current deployment.
    ///
    /// Clears `current` on every other record, sets it on `id`, then rewrites
    /// the `active` pointer, all under one hold of the status lock.
    pub fn mark_current(&self, id: &str) -> Result<(), StoreError> {
        self.locked(|| {
            let mut target = self.get(id)?;
            for mut other in self.list()? {
                if other.current && other.id != id {
                    other.current = false;
                    self.put(&other)?;
                    debug!("ledger: cleared current flag on {}", other.id);
                }
            }
            target.current = true;
            self.put(&target)?;
            write_atomic(&self.layout.active_file(), id.as_bytes())?;
            debug!("ledger: {id} is now current");
            Ok(())
        })
    }

    pub fn current_id(&self) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.layout.active_file()) {
            Ok(s) => {
                let id = s.trim();
                Ok((!id.is_empty()).then(|| id.to_owned()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn current(&self) -> Result<Option<DeploymentRecord>, StoreError> {
        match self.current_id()? {
            Some(id) => match self.get(&id) {
                Ok(rec) => Ok(Some(rec)),
                Err(StoreError::DeploymentNotFound(_)) => Ok(None),
                Err(e) => Err(e),
            },
            None => Ok(None),
        }
    }

    /// All readable records, newest first. Corrupt entries are skipped.
    pub fn list(&self) -> Result<Vec<DeploymentRecord>, StoreError> {
        let dir = self.layout.deployments_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(id) = name.to_str() else { continue };
            if validate_deployment_id(id).is_err() || !self.status_path(id).exists() {
                continue;
            }
            match self.get(id) {
                Ok(rec) => records.push(rec),
                Err(e) => warn!("skipping corrupted deployment record '{id}': {e}"),
            }
        }
        records.sort_by(|a, b| b.received_time.cmp(&a.received_time));
        Ok(records)
    }

    /// Delete a record and its log.
    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        validate_deployment_id(id)?;
        self.locked(|| {
            let dir = self.layout.deployment_dir(id);
            if dir.exists() {
                fs::remove_dir_all(dir)?;
            }
            Ok(())
        })
    }

    /// Append one entry to a deployment's log.
    ///
    /// Logs are written only by the deployment-lock holder, one `write` per
    /// line with `O_APPEND`, so no status lock is taken.
    pub fn append_log(&self, id: &str, entry: &LogEntry) -> Result<(), StoreError> {
        validate_deployment_id(id)?;
        let path = self.log_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(&line)?;
        Ok(())
    }

    pub fn logs(&self, id: &str) -> Result<Vec<LogEntry>, StoreError> {
        validate_deployment_id(id)?;
        let content = match fs::read_to_string(self.log_path(id)) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("skipping unreadable log line for {id}: {e}"),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DeploymentStatus, LogKind};

    fn test_ledger() -> (tempfile::TempDir, DeploymentStatusLedger) {
        let dir = tempfile::tempdir().unwrap();
        let layout = SiteLayout::new(dir.path());
        layout.initialize().unwrap();
        (dir, DeploymentStatusLedger::new(layout))
    }

    #[test]
    fn create_and_get_roundtrip() {
        let (_dir, ledger) = test_ledger();
        let rec = DeploymentRecord::new("abc123", Some("push"));
        ledger.create(&rec).unwrap();

        let loaded = ledger.get("abc123").unwrap();
        assert_eq!(loaded.id, "abc123");
        assert_eq!(loaded.deployer.as_deref(), Some("push"));
        assert!(loaded.checksum.is_some());
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_dir, ledger) = test_ledger();
        assert!(matches!(
            ledger.get("nope"),
            Err(StoreError::DeploymentNotFound(_))
        ));
    }

    #[test]
    fn get_rejects_traversal_ids() {
        let (_dir, ledger) = test_ledger();
        assert!(matches!(
            ledger.get("../etc"),
            Err(StoreError::InvalidId(_))
        ));
    }

    #[test]
    fn update_persists_mutation() {
        let (_dir, ledger) = test_ledger();
        ledger.create(&DeploymentRecord::new("abc", None)).unwrap();
        ledger
            .update("abc", |r| {
                r.status = DeploymentStatus::Building;
                r.progress = "compiling".to_owned();
            })
            .unwrap();
        let loaded = ledger.get("abc").unwrap();
        assert_eq!(loaded.status, DeploymentStatus::Building);
        assert_eq!(loaded.progress, "compiling");
    }

    #[test]
    fn tampered_record_fails_integrity_check() {
        let (dir, ledger) = test_ledger();
        ledger.create(&DeploymentRecord::new("abc", None)).unwrap();
        let path = dir.path().join("deployments/abc/status.json");
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("pending", "success")).unwrap();
        assert!(matches!(
            ledger.get("abc"),
            Err(StoreError::IntegrityFailure { .. })
        ));
    }

    #[test]
    fn mark_current_keeps_single_current() {
        let (_dir, ledger) = test_ledger();
        for id in ["a", "b", "c"] {
            ledger.create(&DeploymentRecord::new(id, None)).unwrap();
        }
        ledger.mark_current("a").unwrap();
        ledger.mark_current("b").unwrap();

        let current: Vec<_> = ledger
            .list()
            .unwrap()
            .into_iter()
            .filter(|r| r.current)
            .map(|r| r.id)
            .collect();
        assert_eq!(current, vec!["b".to_owned()]);
        assert_eq!(ledger.current_id().unwrap().as_deref(), Some("b"));
        assert_eq!(ledger.current().unwrap().unwrap().id, "b");
    }

    #[test]
    fn recreate_preserves_current_flag() {
        let (_dir, ledger) = test_ledger();
        ledger.create(&DeploymentRecord::new("a", None)).unwrap();
        ledger.mark_current("a").unwrap();

        let again = ledger.create(&DeploymentRecord::new("a", None)).unwrap();
        assert!(again.current);
        assert!(ledger.get("a").unwrap().current);
    }

    #[test]
    fn create_discards_previous_log() {
        let (_dir, ledger) = test_ledger();
        ledger.create(&DeploymentRecord::new("abc", None)).unwrap();
        ledger
            .append_log("abc", &LogEntry::new(LogKind::Error, "first attempt failed"))
            .unwrap();

        ledger.create(&DeploymentRecord::new("abc", None)).unwrap();
        assert!(ledger.logs("abc").unwrap().is_empty());
        ledger
            .append_log("abc", &LogEntry::new(LogKind::Message, "second attempt"))
            .unwrap();
        let logs = ledger.logs("abc").unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "second attempt");
    }

    #[test]
    fn list_skips_corrupt_records() {
        let (dir, ledger) = test_ledger();
        ledger.create(&DeploymentRecord::new("good", None)).unwrap();
        let bad = dir.path().join("deployments/bad");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join("status.json"), "{not json").unwrap();

        let ids: Vec<_> = ledger.list().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["good".to_owned()]);
    }

    #[test]
    fn logs_append_in_order() {
        let (_dir, ledger) = test_ledger();
        ledger.create(&DeploymentRecord::new("abc", None)).unwrap();
        ledger
            .append_log("abc", &LogEntry::new(LogKind::Message, "one"))
            .unwrap();
        ledger
            .append_log("abc", &LogEntry::new(LogKind::Error, "two"))
            .unwrap();

        let logs = ledger.logs("abc").unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "one");
        assert_eq!(logs[1].kind, LogKind::Error);
    }

    #[test]
    fn remove_deletes_record_and_log() {
        let (_dir, ledger) = test_ledger();
        ledger.create(&DeploymentRecord::new("tmp", None)).unwrap();
        ledger
            .append_log("tmp", &LogEntry::new(LogKind::Message, "x"))
            .unwrap();
        ledger.remove("tmp").unwrap();
        assert!(!ledger.exists("tmp"));
        assert!(ledger.logs("tmp").unwrap().is_empty());
    }

    #[test]
    fn update_times_out_when_status_lock_is_held() {
        let (dir, ledger) = test_ledger();
        ledger.create(&DeploymentRecord::new("abc", None)).unwrap();
        let ledger = ledger.with_lock_timeout(Duration::from_millis(20));

        let status_lock = OperationLock::new(dir.path().join("locks/status.lock"));
        let _held = status_lock.try_acquire().unwrap().unwrap();
        let err = ledger.update("abc", |_| {}).unwrap_err();
        assert!(matches!(err, StoreError::Lock(_)));
    }
}
