//! Credential state and round-robin selection
//!
//! Each credential owns its state behind its own lock, so updates to one key
//! never contend with reads of another and a reader never sees a half-written
//! state. Locks are synchronous and never held across an `.await`.
//!
//! Expiry is evaluated lazily: an `Expired` credential whose deadline has
//! passed is handed out again, but its stored state stays `Expired` until the
//! next response for that key overwrites it.

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use common::Secret;
use parking_lot::RwLock;
use reqwest::header::HeaderMap;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::headers::capture_state;

/// Rate-limit state of one credential.
///
/// Transitions (all driven by `record_usage`):
/// - NotInitialized → Valid | Expired
/// - Valid → Valid | Expired
/// - Expired → Valid | Expired (with a new deadline)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    NotInitialized,
    Valid,
    Expired { retry_after: DateTime<Utc> },
}

impl CredentialState {
    /// Whether a credential in this state may be dispatched at `now`.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        match self {
            CredentialState::NotInitialized | CredentialState::Valid => true,
            CredentialState::Expired { retry_after } => now > *retry_after,
        }
    }

    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            CredentialState::NotInitialized => "not_initialized",
            CredentialState::Valid => "valid",
            CredentialState::Expired { .. } => "expired",
        }
    }
}

/// A credential picked for one outbound call.
#[derive(Debug, Clone)]
pub struct SelectedCredential {
    /// Non-secret name for logs (`credential-N`, configuration order)
    pub label: String,
    pub key: Secret<String>,
}

struct Entry {
    key: Secret<String>,
    label: String,
    state: RwLock<CredentialState>,
}

/// Pool of API keys with per-key rate-limit state.
///
/// Built once from configuration and shared as `Arc<CredentialPool>`. The key
/// list is fixed after construction; only states change.
pub struct CredentialPool {
    entries: Vec<Entry>,
    next_index: AtomicUsize,
}

impl CredentialPool {
    /// Build a pool from the configured keys, all starting `NotInitialized`.
    ///
    /// Blank keys are skipped and duplicates collapse onto their first
    /// occurrence so ids stay unique.
    pub fn new<I>(keys: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut entries: Vec<Entry> = Vec::new();
        for key in keys {
            let key = key.trim().to_string();
            if key.is_empty() {
                continue;
            }
            if entries.iter().any(|entry| entry.key.matches(&key)) {
                warn!("duplicate credential in configuration, ignoring");
                continue;
            }
            let label = format!("credential-{}", entries.len() + 1);
            entries.push(Entry {
                key: Secret::new(key),
                label,
                state: RwLock::new(CredentialState::NotInitialized),
            });
        }
        info!(credentials = entries.len(), "credential pool initialized");
        Self {
            entries,
            next_index: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Select a usable credential, round-robin from the shared cursor.
    pub fn select_usable(&self) -> Result<SelectedCredential> {
        self.select_usable_at(Utc::now())
    }

    /// Select a usable credential as of `now`.
    ///
    /// Returns `Exhausted` with pool counts if every credential is still
    /// throttled, `Empty` if the pool has no credentials at all.
    pub fn select_usable_at(&self, now: DateTime<Utc>) -> Result<SelectedCredential> {
        let n = self.entries.len();
        if n == 0 {
            return Err(Error::Empty);
        }

        let start = self.next_index.fetch_add(1, Ordering::Relaxed) % n;
        for offset in 0..n {
            let entry = &self.entries[(start + offset) % n];
            let state = *entry.state.read();
            if state.is_usable_at(now) {
                debug!(credential = %entry.label, state = state.label(), "credential selected");
                return Ok(SelectedCredential {
                    label: entry.label.clone(),
                    key: entry.key.clone(),
                });
            }
        }

        Err(Error::Exhausted(self.exhausted_message(now)))
    }

    /// Install the state derived from `headers` for `key`.
    pub fn record_usage(&self, key: &str, headers: &HeaderMap) -> Option<CredentialState> {
        self.record_usage_at(key, headers, Utc::now())
    }

    /// Install the state derived from `headers` for `key`, judged at `now`.
    ///
    /// Returns the installed state, or `None` if the key is not in the pool.
    pub fn record_usage_at(
        &self,
        key: &str,
        headers: &HeaderMap,
        now: DateTime<Utc>,
    ) -> Option<CredentialState> {
        let Some(entry) = self.entry(key) else {
            debug!("usage reported for a credential not in the pool");
            return None;
        };

        let state = capture_state(headers, now);
        let previous = std::mem::replace(&mut *entry.state.write(), state);

        match state {
            CredentialState::Expired { retry_after } => info!(
                credential = %entry.label,
                previous = previous.label(),
                retry_after = %retry_after.to_rfc3339(),
                "credential throttled"
            ),
            _ => debug!(
                credential = %entry.label,
                previous = previous.label(),
                state = state.label(),
                "credential state updated"
            ),
        }
        Some(state)
    }

    /// Current stored state of `key`.
    pub fn state_of(&self, key: &str) -> Option<CredentialState> {
        self.entry(key).map(|entry| *entry.state.read())
    }

    /// Pool health summary for the health endpoint.
    pub fn health(&self) -> serde_json::Value {
        self.health_at(Utc::now())
    }

    /// Pool health as of `now`.
    ///
    /// Status mapping: all usable → healthy, some usable → degraded,
    /// none usable (or empty pool) → unhealthy.
    pub fn health_at(&self, now: DateTime<Utc>) -> serde_json::Value {
        let mut credentials = Vec::with_capacity(self.entries.len());
        let mut usable = 0usize;
        let mut throttled = 0usize;

        for entry in &self.entries {
            let state = *entry.state.read();
            let is_usable = state.is_usable_at(now);
            if is_usable {
                usable += 1;
            } else {
                throttled += 1;
            }
            let mut detail = serde_json::json!({
                "label": entry.label,
                "state": state.label(),
                "usable": is_usable,
            });
            if let CredentialState::Expired { retry_after } = state {
                detail["retry_after"] = serde_json::Value::String(retry_after.to_rfc3339());
                detail["retry_in_secs"] = serde_json::json!(seconds_until(retry_after, now));
            }
            credentials.push(detail);
        }

        let total = self.entries.len();
        let status = if usable == total && total > 0 {
            "healthy"
        } else if usable > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "credentials_total": total,
            "credentials_usable": usable,
            "credentials_throttled": throttled,
            "credentials": credentials,
        })
    }

    fn entry(&self, key: &str) -> Option<&Entry> {
        self.entries.iter().find(|entry| entry.key.matches(key))
    }

    /// Build the exhausted error message JSON.
    fn exhausted_message(&self, now: DateTime<Utc>) -> String {
        let next_retry_in_secs = self
            .entries
            .iter()
            .filter_map(|entry| match *entry.state.read() {
                CredentialState::Expired { retry_after } => Some(seconds_until(retry_after, now)),
                _ => None,
            })
            .min();

        serde_json::json!({
            "error": {
                "type": "credentials_exhausted",
                "message": "All credentials are rate limited",
                "pool": {
                    "credentials_total": self.entries.len(),
                    "credentials_usable": 0,
                    "next_retry_in_secs": next_retry_in_secs,
                }
            }
        })
        .to_string()
    }
}

fn seconds_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (deadline - now).num_seconds().max(0)
}
