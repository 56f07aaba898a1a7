//! Live parameter store.
//!
//! Readers grab an `Arc<ParamSnapshot>` via `params()` — a lock-free
//! arc-swap load. Writers go through `apply`/`rollback`, which validate,
//! back up, swap and audit under one writer lock. An apply containing any
//! invalid key changes nothing and writes no backup.

use anyhow::Result;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::schema::{
    default_values, spec_for, validate_cross_field, validate_value, ParamSnapshot,
};
use crate::storage::{AuditEntry, Storage};

const META_PARAM_VALUES: &str = "param_values";
const META_PARAM_REVISION: &str = "param_revision";

#[derive(Debug)]
pub enum ApplyError {
    /// Another successful apply happened inside the minimum interval.
    RateLimited { remaining: Duration },
    UnknownKey(String),
    Validation { message: String },
    NothingToApply,
    NoBackup,
    Storage(anyhow::Error),
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyError::RateLimited { remaining } => {
                write!(f, "rate limited, retry in {}s", remaining.as_secs())
            }
            ApplyError::UnknownKey(key) => write!(f, "unknown parameter: {key}"),
            ApplyError::Validation { message } => write!(f, "{message}"),
            ApplyError::NothingToApply => write!(f, "empty delta"),
            ApplyError::NoBackup => write!(f, "no backup available to roll back to"),
            ApplyError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl ApplyError {
    /// Stable machine code for the control surface.
    pub fn code(&self) -> &'static str {
        match self {
            ApplyError::RateLimited { .. } => "RATE_LIMITED",
            ApplyError::UnknownKey(_) => "UNKNOWN_KEY",
            ApplyError::Validation { .. } => "INVALID_VALUE",
            ApplyError::NothingToApply => "EMPTY_DELTA",
            ApplyError::NoBackup => "NO_BACKUP",
            ApplyError::Storage(_) => "STORAGE_ERROR",
        }
    }
}

struct WriterState {
    values: BTreeMap<String, Value>,
    revision: u64,
    last_apply: Option<Instant>,
}

pub struct ParamStore {
    snapshot: ArcSwap<ParamSnapshot>,
    writer: Mutex<WriterState>,
    storage: Storage,
}

impl ParamStore {
    /// Load persisted values if present, otherwise factory defaults.
    pub fn load(storage: Storage) -> Result<Self> {
        let mut values = default_values();
        let mut revision = 0;
        if let Some(raw) = storage.meta_get(META_PARAM_VALUES)? {
            match serde_json::from_str::<BTreeMap<String, Value>>(&raw) {
                Ok(saved) => {
                    // Unknown saved keys are dropped; missing keys keep defaults.
                    for (key, value) in saved {
                        if spec_for(&key).is_some() {
                            values.insert(key, value);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Persisted parameter values unreadable, using defaults"),
            }
            revision = storage
                .meta_get(META_PARAM_REVISION)?
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0);
        }
        let snapshot = ParamSnapshot::from_values(revision, &values);
        Ok(Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            writer: Mutex::new(WriterState {
                values,
                revision,
                last_apply: None,
            }),
            storage,
        })
    }

    /// Current live snapshot. Cheap; safe to call per item.
    pub fn params(&self) -> Arc<ParamSnapshot> {
        self.snapshot.load_full()
    }

    pub fn values_json(&self) -> Value {
        let writer = self.writer.lock();
        serde_json::to_value(&writer.values).unwrap_or(Value::Null)
    }

    pub fn history(&self, limit: u32) -> Result<Vec<AuditEntry>> {
        self.storage.audit_tail(limit)
    }

    pub fn apply(
        &self,
        delta: BTreeMap<String, Value>,
        author: &str,
        source_tag: &str,
    ) -> Result<u64, ApplyError> {
        self.apply_at(Instant::now(), delta, author, source_tag)
    }

    /// `apply` with an injectable clock, for rate-limit tests.
    pub fn apply_at(
        &self,
        now: Instant,
        delta: BTreeMap<String, Value>,
        author: &str,
        source_tag: &str,
    ) -> Result<u64, ApplyError> {
        if delta.is_empty() {
            return Err(ApplyError::NothingToApply);
        }

        let mut writer = self.writer.lock();

        let min_interval =
            Duration::from_secs(self.snapshot.load().config_apply_min_secs);
        if let Some(last) = writer.last_apply {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < min_interval {
                return Err(ApplyError::RateLimited {
                    remaining: min_interval - elapsed,
                });
            }
        }

        // Validate the complete delta before touching anything.
        for (key, value) in &delta {
            let Some(spec) = spec_for(key) else {
                return Err(ApplyError::UnknownKey(key.clone()));
            };
            validate_value(spec, value).map_err(|message| ApplyError::Validation { message })?;
        }
        let mut candidate = writer.values.clone();
        for (key, value) in &delta {
            candidate.insert(key.clone(), value.clone());
        }
        validate_cross_field(&candidate)
            .map_err(|message| ApplyError::Validation { message })?;

        // Backup prior state, then swap.
        let prior_json = serde_json::to_string(&writer.values)
            .map_err(|e| ApplyError::Storage(e.into()))?;
        self.storage
            .push_backup(writer.revision, &prior_json)
            .map_err(ApplyError::Storage)?;

        writer.revision += 1;
        writer.values = candidate;
        writer.last_apply = Some(now);
        let revision = writer.revision;
        self.persist(&writer.values, revision)
            .map_err(ApplyError::Storage)?;
        self.snapshot
            .store(Arc::new(ParamSnapshot::from_values(revision, &writer.values)));

        let delta_json = serde_json::to_string(&delta).unwrap_or_default();
        self.storage
            .append_audit(revision, author, source_tag, &delta_json)
            .map_err(ApplyError::Storage)?;

        info!(revision, author, source = source_tag, delta = %delta_json, "Parameters applied");
        Ok(revision)
    }

    /// Restore the n-th most recent backup (n = 1 is the snapshot prior
    /// to the last apply). Appends its own audit record; not rate limited.
    pub fn rollback(&self, n: u32, author: &str) -> Result<u64, ApplyError> {
        let mut writer = self.writer.lock();
        let restored_json = self
            .storage
            .take_backup(n.max(1))
            .map_err(ApplyError::Storage)?
            .ok_or(ApplyError::NoBackup)?;
        let restored: BTreeMap<String, Value> = serde_json::from_str(&restored_json)
            .map_err(|e| ApplyError::Storage(e.into()))?;

        writer.revision += 1;
        writer.values = restored;
        let revision = writer.revision;
        self.persist(&writer.values, revision)
            .map_err(ApplyError::Storage)?;
        self.snapshot
            .store(Arc::new(ParamSnapshot::from_values(revision, &writer.values)));

        let delta_json = format!("{{\"rollback\":{}}}", n.max(1));
        self.storage
            .append_audit(revision, author, "rollback", &delta_json)
            .map_err(ApplyError::Storage)?;
        info!(revision, author, "Parameters rolled back");
        Ok(revision)
    }

    fn persist(&self, values: &BTreeMap<String, Value>, revision: u64) -> Result<()> {
        let raw = serde_json::to_string(values)?;
        self.storage.meta_set(META_PARAM_VALUES, &raw)?;
        self.storage.meta_set(META_PARAM_REVISION, &revision.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::schema;
    use super::*;
    use serde_json::json;

    fn store() -> ParamStore {
        ParamStore::load(Storage::open_in_memory().unwrap()).unwrap()
    }

    fn delta(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn apply_swaps_snapshot() {
        let store = store();
        let t0 = Instant::now();
        store
            .apply_at(t0, delta(&[(schema::MIN_SCORE, json!(0.30))]), "op", "test")
            .unwrap();
        assert!((store.params().min_score - 0.30).abs() < 1e-12);
    }

    #[test]
    fn apply_is_all_or_nothing() {
        let store = store();
        let t0 = Instant::now();
        let bad = delta(&[
            (schema::MIN_SCORE, json!(0.30)),
            (schema::MIN_SENT_ABS, json!(7.0)),
        ]);
        let err = store.apply_at(t0, bad, "op", "test").unwrap_err();
        assert_eq!(err.code(), "INVALID_VALUE");
        // Snapshot untouched, and no backup was written.
        assert!((store.params().min_score - 0.25).abs() < 1e-12);
        assert!(matches!(
            store.rollback(1, "op").unwrap_err(),
            ApplyError::NoBackup
        ));
    }

    #[test]
    fn unknown_key_rejected() {
        let store = store();
        let err = store
            .apply_at(Instant::now(), delta(&[("WAT", json!(1))]), "op", "test")
            .unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_KEY");
    }

    #[test]
    fn rate_limit_enforced_between_applies() {
        let store = store();
        let t0 = Instant::now();
        store
            .apply_at(t0, delta(&[(schema::MIN_SCORE, json!(0.30))]), "op", "test")
            .unwrap();

        let err = store
            .apply_at(
                t0 + Duration::from_secs(30),
                delta(&[(schema::MIN_SCORE, json!(0.35))]),
                "op",
                "test",
            )
            .unwrap_err();
        match err {
            ApplyError::RateLimited { remaining } => {
                assert!(remaining.as_secs() >= 29 && remaining.as_secs() <= 30);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
        // Snapshot still reports the first value.
        assert!((store.params().min_score - 0.30).abs() < 1e-12);

        // Outside the window the next apply succeeds.
        store
            .apply_at(
                t0 + Duration::from_secs(61),
                delta(&[(schema::MIN_SCORE, json!(0.35))]),
                "op",
                "test",
            )
            .unwrap();
        assert!((store.params().min_score - 0.35).abs() < 1e-12);
    }

    #[test]
    fn rollback_restores_prior_snapshot() {
        let store = store();
        let t0 = Instant::now();
        store
            .apply_at(t0, delta(&[(schema::MIN_SCORE, json!(0.30))]), "op", "test")
            .unwrap();
        store
            .apply_at(
                t0 + Duration::from_secs(120),
                delta(&[(schema::MIN_SCORE, json!(0.40))]),
                "op",
                "test",
            )
            .unwrap();

        store.rollback(1, "op").unwrap();
        // Back to the state immediately prior to the last apply.
        assert!((store.params().min_score - 0.30).abs() < 1e-12);
    }

    #[test]
    fn audit_trail_includes_rollback() {
        let store = store();
        store
            .apply_at(
                Instant::now(),
                delta(&[(schema::MIN_SCORE, json!(0.30))]),
                "alice",
                "chat",
            )
            .unwrap();
        store.rollback(1, "bob").unwrap();

        let history = store.history(10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].author, "bob");
        assert_eq!(history[0].source_tag, "rollback");
        assert_eq!(history[1].author, "alice");
    }

    #[test]
    fn live_values_survive_reload() {
        let storage = Storage::open_in_memory().unwrap();
        {
            let store = ParamStore::load(storage.clone()).unwrap();
            store
                .apply_at(
                    Instant::now(),
                    delta(&[(schema::MIN_SCORE, json!(0.33))]),
                    "op",
                    "test",
                )
                .unwrap();
        }
        let reloaded = ParamStore::load(storage).unwrap();
        assert!((reloaded.params().min_score - 0.33).abs() < 1e-12);
        assert_eq!(reloaded.params().revision, 1);
    }
}
