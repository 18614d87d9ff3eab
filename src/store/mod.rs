//! Storage abstraction for the harness.
//!
//! The [`Store`] trait is the whole contract the pipeline has with its
//! storage engine: idempotent upserts keyed by natural identity, filtered
//! reads, named procedures for derivation work, and an append-only run log.
//! Two backends ship with the crate:
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`memory::InMemoryStore`] | tests and dry runs |
//! | [`sqlite::SqliteStore`] | the on-disk store used by `gdh` |
//!
//! Implementations must be `Send + Sync`; the orchestrator shares one store
//! across every concurrent ingestion unit.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::{CanonicalRecord, EntityKind, HealthSnapshot, NaturalKey, StoredRecord};
use crate::run_log::PipelineRun;

/// Store-level result of one upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreUpsert {
    /// Fields were written. `false` when the timestamp gate kept the stored row.
    pub applied: bool,
    /// No row existed under this key before the call.
    pub was_new: bool,
}

/// Filter for [`Store::query`]. All set fields must match.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub key: Option<NaturalKey>,
    pub source: Option<String>,
    pub seen_since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn key(key: NaturalKey) -> Self {
        Self {
            key: Some(key),
            ..Default::default()
        }
    }

    pub fn matches(&self, rec: &CanonicalRecord) -> bool {
        if let Some(key) = &self.key {
            if &rec.key != key {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if &rec.source != source {
                return false;
            }
        }
        if let Some(since) = self.seen_since {
            if rec.last_seen < since {
                return false;
            }
        }
        true
    }
}

/// Whether an incoming record may overwrite the stored one.
///
/// Last write wins, except that a record whose upstream timestamp is strictly
/// older than the stored row's never clobbers it. Records without a
/// timestamp on either side always overwrite.
pub fn should_overwrite(
    stored: Option<DateTime<Utc>>,
    incoming: Option<DateTime<Utc>>,
) -> bool {
    match (stored, incoming) {
        (Some(stored), Some(incoming)) => incoming >= stored,
        _ => true,
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Cheap reachability check, run before any ingestion work starts.
    async fn ping(&self) -> Result<()>;

    /// Insert or update the row identified by `(record.kind, record.key)`.
    ///
    /// Mutable fields and `last_seen` are overwritten subject to
    /// [`should_overwrite`]; `last_seen` is refreshed even when the gate
    /// keeps the stored fields. Never creates a second row for a key.
    async fn upsert(&self, record: &CanonicalRecord) -> Result<StoreUpsert>;

    /// Read back records of one kind.
    async fn query(&self, kind: EntityKind, filter: &RecordFilter) -> Result<Vec<StoredRecord>>;

    async fn count(&self, kind: EntityKind) -> Result<u64>;

    /// Run a named derivation procedure. See [`crate::procedures`].
    async fn call_procedure(&self, name: &str, args: &Value) -> Result<Value>;

    /// Append a finished Run to the audit log.
    async fn append_log(&self, run: &PipelineRun) -> Result<()>;

    /// Most recent Runs, newest first.
    async fn recent_runs(&self, limit: usize) -> Result<Vec<PipelineRun>>;

    async fn latest_health(&self) -> Result<Option<HealthSnapshot>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn older_timestamp_does_not_overwrite() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        assert!(should_overwrite(Some(t1), Some(t2)));
        assert!(should_overwrite(Some(t1), Some(t1)));
        assert!(!should_overwrite(Some(t2), Some(t1)));
        assert!(should_overwrite(None, Some(t1)));
        assert!(should_overwrite(Some(t1), None));
    }
}
