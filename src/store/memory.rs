//! In-memory [`Store`] implementation for tests and dry runs.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. Every upsert takes the write
//! lock for the record map, so the existence check and the write are atomic
//! per call, which is what makes `was_new` exact under concurrent writers.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::models::{CanonicalRecord, EntityKind, HealthSnapshot, NaturalKey, StoredRecord};
use crate::procedures::{
    self, AgencyTotal, DerivedStore, EntityScore, EntityStat, Insight, Relationship,
};
use crate::run_log::PipelineRun;

use super::{should_overwrite, RecordFilter, Store, StoreUpsert};

#[derive(Default)]
struct Derived {
    stats: Vec<EntityStat>,
    edges: Vec<Relationship>,
    insights: Vec<Insight>,
    scores: Vec<EntityScore>,
    aggregates: Vec<AgencyTotal>,
    health: Vec<HealthSnapshot>,
}

/// In-memory store for tests and dry runs.
pub struct InMemoryStore {
    records: RwLock<HashMap<(EntityKind, NaturalKey), StoredRecord>>,
    derived: RwLock<Derived>,
    runs: RwLock<Vec<PipelineRun>>,
    reachable: AtomicBool,
    fail_procedures: RwLock<Vec<String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            derived: RwLock::new(Derived::default()),
            runs: RwLock::new(Vec::new()),
            reachable: AtomicBool::new(true),
            fail_procedures: RwLock::new(Vec::new()),
        }
    }

    /// Make [`Store::ping`] fail, simulating an unreachable store.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make the named procedure fail on every call.
    pub fn fail_procedure(&self, name: &str) {
        if let Ok(mut names) = self.fail_procedures.write() {
            names.push(name.to_string());
        }
    }

    /// Total rows across all kinds.
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn relationships_snapshot(&self) -> Vec<Relationship> {
        self.derived.read().map(|d| d.edges.clone()).unwrap_or_default()
    }

    pub fn insights_snapshot(&self) -> Vec<Insight> {
        self.derived.read().map(|d| d.insights.clone()).unwrap_or_default()
    }

    pub fn aggregates_snapshot(&self) -> Vec<AgencyTotal> {
        self.derived.read().map(|d| d.aggregates.clone()).unwrap_or_default()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

#[async_trait]
impl Store for InMemoryStore {
    async fn ping(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            bail!("store unreachable")
        }
    }

    async fn upsert(&self, record: &CanonicalRecord) -> Result<StoreUpsert> {
        let mut records = self.records.write().map_err(poisoned)?;
        let slot = (record.kind, record.key.clone());

        match records.entry(slot) {
            Entry::Vacant(vacant) => {
                vacant.insert(StoredRecord {
                    record: record.clone(),
                    first_seen: record.last_seen,
                });
                Ok(StoreUpsert {
                    applied: true,
                    was_new: true,
                })
            }
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                let applied = should_overwrite(
                    existing.record.source_updated_at,
                    record.source_updated_at,
                );
                if applied {
                    existing.record.fields = record.fields.clone();
                    existing.record.source = record.source.clone();
                    existing.record.source_updated_at = record.source_updated_at;
                }
                if record.last_seen > existing.record.last_seen {
                    existing.record.last_seen = record.last_seen;
                }
                Ok(StoreUpsert {
                    applied,
                    was_new: false,
                })
            }
        }
    }

    async fn query(&self, kind: EntityKind, filter: &RecordFilter) -> Result<Vec<StoredRecord>> {
        let records = self.records.read().map_err(poisoned)?;
        let mut out: Vec<StoredRecord> = records
            .iter()
            .filter(|((k, _), rec)| *k == kind && filter.matches(&rec.record))
            .map(|(_, rec)| rec.clone())
            .collect();
        out.sort_by(|a, b| a.record.key.cmp(&b.record.key));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn count(&self, kind: EntityKind) -> Result<u64> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.keys().filter(|(k, _)| *k == kind).count() as u64)
    }

    async fn call_procedure(&self, name: &str, args: &Value) -> Result<Value> {
        let should_fail = self
            .fail_procedures
            .read()
            .map_err(poisoned)?
            .iter()
            .any(|n| n == name);
        if should_fail {
            bail!("procedure {} failed", name);
        }
        procedures::execute(self, name, args).await
    }

    async fn append_log(&self, run: &PipelineRun) -> Result<()> {
        let mut runs = self.runs.write().map_err(poisoned)?;
        match runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => runs.push(run.clone()),
        }
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<PipelineRun>> {
        let runs = self.runs.read().map_err(poisoned)?;
        Ok(runs.iter().rev().take(limit).cloned().collect())
    }

    async fn latest_health(&self) -> Result<Option<HealthSnapshot>> {
        let derived = self.derived.read().map_err(poisoned)?;
        Ok(derived.health.last().cloned())
    }
}

#[async_trait]
impl DerivedStore for InMemoryStore {
    async fn entity_stats(&self) -> Result<Vec<EntityStat>> {
        Ok(self.derived.read().map_err(poisoned)?.stats.clone())
    }

    async fn replace_entity_stats(&self, stats: &[EntityStat]) -> Result<()> {
        self.derived.write().map_err(poisoned)?.stats = stats.to_vec();
        Ok(())
    }

    async fn relationships(&self) -> Result<Vec<Relationship>> {
        Ok(self.derived.read().map_err(poisoned)?.edges.clone())
    }

    async fn replace_relationships(&self, kinds: &[&str], edges: &[Relationship]) -> Result<()> {
        let mut derived = self.derived.write().map_err(poisoned)?;
        derived.edges.retain(|e| !kinds.contains(&e.kind.as_str()));
        derived.edges.extend_from_slice(edges);
        Ok(())
    }

    async fn insights(&self) -> Result<Vec<Insight>> {
        Ok(self.derived.read().map_err(poisoned)?.insights.clone())
    }

    async fn replace_insights(&self, insights: &[Insight]) -> Result<()> {
        self.derived.write().map_err(poisoned)?.insights = insights.to_vec();
        Ok(())
    }

    async fn scores(&self) -> Result<Vec<EntityScore>> {
        Ok(self.derived.read().map_err(poisoned)?.scores.clone())
    }

    async fn replace_scores(&self, scores: &[EntityScore]) -> Result<()> {
        self.derived.write().map_err(poisoned)?.scores = scores.to_vec();
        Ok(())
    }

    async fn replace_aggregates(&self, totals: &[AgencyTotal]) -> Result<()> {
        self.derived.write().map_err(poisoned)?.aggregates = totals.to_vec();
        Ok(())
    }

    async fn insert_health(&self, snapshot: &HealthSnapshot) -> Result<()> {
        self.derived.write().map_err(poisoned)?.health.push(snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Map};

    fn record(key: &str, amount: f64, updated: Option<(i32, u32)>) -> CanonicalRecord {
        let mut fields = Map::new();
        fields.insert("amount".into(), json!(amount));
        CanonicalRecord {
            kind: EntityKind::Award,
            key: NaturalKey::new([key]).unwrap(),
            fields,
            source: "awards".into(),
            source_updated_at: updated
                .map(|(y, m)| Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0).unwrap()),
            last_seen: Utc::now(),
        }
    }

    #[tokio::test]
    async fn second_upsert_is_not_new_and_keeps_one_row() {
        let store = InMemoryStore::new();
        let first = store.upsert(&record("A1", 10.0, None)).await.unwrap();
        let second = store.upsert(&record("A1", 20.0, None)).await.unwrap();

        assert!(first.was_new && first.applied);
        assert!(!second.was_new && second.applied);
        assert_eq!(store.count(EntityKind::Award).await.unwrap(), 1);

        let rows = store.query(EntityKind::Award, &RecordFilter::default()).await.unwrap();
        assert_eq!(rows[0].record.f64_field("amount"), Some(20.0));
    }

    #[tokio::test]
    async fn stale_record_keeps_newer_fields() {
        let store = InMemoryStore::new();
        store.upsert(&record("A1", 10.0, Some((2024, 5)))).await.unwrap();
        let stale = store.upsert(&record("A1", 99.0, Some((2024, 1)))).await.unwrap();

        assert!(!stale.applied);
        let rows = store
            .query(EntityKind::Award, &RecordFilter::key(NaturalKey::new(["A1"]).unwrap()))
            .await
            .unwrap();
        assert_eq!(rows[0].record.f64_field("amount"), Some(10.0));
    }

    #[tokio::test]
    async fn injected_procedure_failure_is_reported() {
        let store = InMemoryStore::new();
        store.fail_procedure("score_entities");
        assert!(store.call_procedure("score_entities", &json!({})).await.is_err());
        assert!(store.call_procedure("resync_entity_stats", &json!({})).await.is_ok());
        assert!(store.call_procedure("no_such_thing", &json!({})).await.is_err());
    }
}
