use crate::{HookError, HookEvent};
use serde::{Deserialize, Serialize};
use slipway_store::{write_atomic, OperationLock, SiteLayout};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HookRegistration {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Subscribed events; empty means every event.
    #[serde(default)]
    pub events: Vec<HookEvent>,
}

impl HookRegistration {
    pub fn wants(&self, event: HookEvent) -> bool {
        self.events.is_empty() || self.events.contains(&event)
    }
}

fn registration_id(url: &str) -> String {
    blake3::hash(url.as_bytes()).to_hex()[..16].to_owned()
}

/// The site's hooks file, guarded by the hooks lock.
#[derive(Debug, Clone)]
pub struct HookRegistry {
    path: PathBuf,
    lock: OperationLock,
    lock_timeout: Duration,
}

impl HookRegistry {
    pub fn new(layout: &SiteLayout) -> Self {
        Self {
            path: layout.hooks_file(),
            lock: OperationLock::new(layout.hooks_lock()),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn locked<T>(&self, f: impl FnOnce() -> Result<T, HookError>) -> Result<T, HookError> {
        self.lock.try_lock_operation(self.lock_timeout, f)?
    }

    fn read(&self) -> Result<Vec<HookRegistration>, HookError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, hooks: &[HookRegistration]) -> Result<(), HookError> {
        let content = serde_json::to_string_pretty(hooks)?;
        write_atomic(&self.path, content.as_bytes())?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<HookRegistration>, HookError> {
        self.locked(|| self.read())
    }

    /// Add a subscriber, or update the existing registration for the same URL.
    pub fn register(
        &self,
        url: &str,
        secret: Option<&str>,
        events: &[HookEvent],
    ) -> Result<HookRegistration, HookError> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(HookError::InvalidUrl(url.to_owned()));
        }
        let registration = HookRegistration {
            id: registration_id(url),
            url: url.to_owned(),
            secret: secret.map(str::to_owned),
            events: events.to_vec(),
        };
        self.locked(|| {
            let mut hooks = self.read()?;
            hooks.retain(|h| h.url != url);
            hooks.push(registration.clone());
            self.write(&hooks)
        })?;
        info!("registered hook {} -> {url}", registration.id);
        Ok(registration)
    }

    /// Remove a registration by id. Returns whether it existed.
    pub fn unregister(&self, id: &str) -> Result<bool, HookError> {
        self.locked(|| {
            let mut hooks = self.read()?;
            let before = hooks.len();
            hooks.retain(|h| h.id != id);
            if hooks.len() == before {
                return Ok(false);
            }
            self.write(&hooks)?;
            Ok(true)
        })
    }
}
