//! Quota handling for envelope saves.
//!
//! [`QuotaGuard`] wraps a [`KeyValueStore`] and reacts to quota-exceeded
//! writes with a cleanup-then-retry policy: first trim completed records
//! older than the retention window out of the envelope being written, then
//! drop auxiliary keys not on the allow-list. Only when every cleanup step
//! is exhausted does the failure reach the caller — whatever fit is kept.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::keys;
use crate::kv::{KeyValueStore, KvError};

/// Callback invoked with the ids of records trimmed out of an envelope.
/// Fires only after the trimmed payload has actually been written, so the
/// owner can drop the same records from its live view.
pub type TrimHandler = dyn Fn(&[String]) + Send + Sync;

#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Save attempts before giving up, cleanup between each.
    pub max_attempts: u32,
    /// Completed records older than this are eligible for trimming.
    pub retention: Duration,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retention: Duration::days(30),
        }
    }
}

/// Storage decorator applying the quota cleanup policy on `set`.
pub struct QuotaGuard<S: KeyValueStore> {
    store: S,
    config: QuotaConfig,
    on_trim: Mutex<Option<Box<TrimHandler>>>,
}

impl<S: KeyValueStore> QuotaGuard<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, QuotaConfig::default())
    }

    pub fn with_config(store: S, config: QuotaConfig) -> Self {
        Self {
            store,
            config,
            on_trim: Mutex::new(None),
        }
    }

    /// Register a handler for quota trims.
    pub fn on_trim(&self, handler: Box<TrimHandler>) {
        *self.on_trim.lock().expect("quota guard lock poisoned") = Some(handler);
    }

    /// Remove completed records older than the retention cutoff from the
    /// serialized envelope. Returns the smaller payload and the trimmed
    /// ids, only when at least one record was trimmed.
    fn trim_old_completed(
        &self,
        value: &str,
        cutoff: DateTime<Utc>,
    ) -> Option<(String, Vec<String>)> {
        let mut envelope: Value = serde_json::from_str(value).ok()?;
        let (trimmed, trimmed_ids) = {
            let records = envelope.get_mut("records")?.as_array_mut()?;
            let before = records.len();
            let mut ids = Vec::new();
            records.retain(|record| {
                let completed = record
                    .get("completed")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let created = record
                    .get("createdAt")
                    .and_then(Value::as_str)
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc));
                match created {
                    Some(created) if completed && created < cutoff => {
                        if let Some(id) = record.get("id").and_then(Value::as_str) {
                            ids.push(id.to_string());
                        }
                        false
                    }
                    _ => true,
                }
            });
            (before - records.len(), ids)
        };
        if trimmed == 0 {
            return None;
        }
        tracing::warn!("quota cleanup trimmed {trimmed} completed tasks older than retention");
        serde_json::to_string(&envelope)
            .ok()
            .map(|json| (json, trimmed_ids))
    }

    /// Drop every key not on the allow-list. Failures on individual keys
    /// are logged and skipped.
    fn remove_auxiliary_keys(&self) -> usize {
        let keys = match self.store.keys() {
            Ok(keys) => keys,
            Err(err) => {
                tracing::warn!("quota cleanup could not list keys: {err}");
                return 0;
            }
        };
        let mut removed = 0;
        for key in keys {
            if keys::PROTECTED_KEYS.contains(&key.as_str()) {
                continue;
            }
            match self.store.remove(&key) {
                Ok(()) => removed += 1,
                Err(err) => tracing::debug!("quota cleanup could not remove {key}: {err}"),
            }
        }
        if removed > 0 {
            tracing::warn!("quota cleanup removed {removed} auxiliary keys");
        }
        removed
    }
}

impl<S: KeyValueStore> KeyValueStore for QuotaGuard<S> {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.store.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let cutoff = Utc::now() - self.config.retention;
        let mut payload = value.to_string();
        let mut trimmed_ids: Vec<String> = Vec::new();
        let mut aux_cleaned = false;

        for attempt in 1..=self.config.max_attempts {
            match self.store.set(key, &payload) {
                Ok(()) => {
                    if !trimmed_ids.is_empty() {
                        if let Some(handler) = self
                            .on_trim
                            .lock()
                            .expect("quota guard lock poisoned")
                            .as_ref()
                        {
                            handler(&trimmed_ids);
                        }
                    }
                    return Ok(());
                }
                Err(KvError::QuotaExceeded { .. }) => {
                    tracing::debug!("save of {key} hit the storage quota (attempt {attempt})");
                    if key == keys::RECORDS_KEY {
                        if let Some((smaller, ids)) = self.trim_old_completed(&payload, cutoff) {
                            payload = smaller;
                            trimmed_ids.extend(ids);
                            continue;
                        }
                    }
                    if !aux_cleaned {
                        aux_cleaned = true;
                        if self.remove_auxiliary_keys() > 0 {
                            continue;
                        }
                    }
                    break;
                }
                Err(other) => return Err(other),
            }
        }
        Err(KvError::QuotaExceeded {
            key: key.to_string(),
        })
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        self.store.remove(key)
    }

    fn keys(&self) -> Result<Vec<String>, KvError> {
        self.store.keys()
    }
}
