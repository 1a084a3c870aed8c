use crate::registry::{HookRegistration, HookRegistry};
use crate::{HookError, HookEvent, EVENT_HEADER, SIGNATURE_HEADER};
use std::time::Duration;
use tracing::{debug, info, warn};

const SIGNATURE_CONTEXT: &str = "slipway 2025-01-01 webhook signature v1";

/// Signature header value for `body` under `secret`: `blake3=<hex>` of the
/// body keyed with a key derived from the secret.
pub fn signature(secret: &str, body: &[u8]) -> String {
    let key = blake3::derive_key(SIGNATURE_CONTEXT, secret.as_bytes());
    format!("blake3={}", blake3::keyed_hash(&key, body).to_hex())
}

#[derive(Debug, Clone, Copy)]
pub struct DeliveryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
    pub timeout: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Per-subscriber results of one notification round.
#[derive(Debug, Default)]
pub struct NotifyReport {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct WebHooksManager {
    registry: HookRegistry,
    policy: DeliveryPolicy,
    agent: ureq::Agent,
}

impl WebHooksManager {
    pub fn new(registry: HookRegistry) -> Self {
        Self::with_policy(registry, DeliveryPolicy::default())
    }

    pub fn with_policy(registry: HookRegistry, policy: DeliveryPolicy) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(policy.timeout))
            .build();
        Self {
            registry,
            policy,
            agent: ureq::Agent::new_with_config(config),
        }
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    fn post(&self, hook: &HookRegistration, event: HookEvent, body: &[u8]) -> Result<(), HookError> {
        let mut req = self
            .agent
            .post(&hook.url)
            .header("Content-Type", "application/json")
            .header(EVENT_HEADER, &event.to_string());
        if let Some(ref secret) = hook.secret {
            req = req.header(SIGNATURE_HEADER, &signature(secret, body));
        }
        match req.send(body) {
            Ok(_) => Ok(()),
            Err(ureq::Error::StatusCode(code)) => {
                Err(HookError::Http(format!("HTTP {code} from {}", hook.url)))
            }
            Err(e) => Err(HookError::Http(e.to_string())),
        }
    }

    fn deliver(&self, hook: &HookRegistration, event: HookEvent, body: &[u8]) -> Result<(), HookError> {
        let attempts = self.policy.attempts.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            match self.post(hook, event, body) {
                Ok(()) => {
                    debug!("delivered {event} to {} (attempt {attempt})", hook.url);
                    return Ok(());
                }
                Err(e) => {
                    debug!("attempt {attempt}/{attempts} to {} failed: {e}", hook.url);
                    last = Some(e);
                    if attempt < attempts {
                        std::thread::sleep(self.policy.backoff);
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| HookError::Http("no attempt made".to_owned())))
    }

    /// Post `payload` to every registration subscribed to `event`.
    ///
    /// Never fails because of a subscriber: undeliverable hooks are logged
    /// and listed in the report. Only reading the registrations can fail.
    pub fn notify(
        &self,
        event: HookEvent,
        payload: &serde_json::Value,
    ) -> Result<NotifyReport, HookError> {
        let hooks = self.registry.list()?;
        let body = serde_json::to_vec(payload)?;
        let mut report = NotifyReport::default();
        for hook in hooks.iter().filter(|h| h.wants(event)) {
            match self.deliver(hook, event, &body) {
                Ok(()) => report.delivered.push(hook.url.clone()),
                Err(e) => {
                    warn!("dropping {event} notification for {}: {e}", hook.url);
                    report.failed.push((hook.url.clone(), e.to_string()));
                }
            }
        }
        if !report.delivered.is_empty() {
            info!("notified {} hook(s) of {event}", report.delivered.len());
        }
        Ok(report)
    }
}
