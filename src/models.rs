//! Core data models used throughout the harness.
//!
//! These types describe the sources being harvested, the records that flow
//! from connectors through the upsert sink into the store, and the results
//! that each pipeline Run accumulates.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The broad category of an upstream data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    Contract,
    Grant,
    Opportunity,
    Entity,
    Exclusion,
    Regulatory,
}

/// Which [`RunOptions`] toggle controls whether a source participates in a Run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFamily {
    Contracts,
    Grants,
    Opportunities,
    States,
    Historical,
    /// Entity, exclusion, and regulatory sources. Always included.
    Reference,
}

impl SourceCategory {
    /// The family a source of this category belongs to unless config overrides it.
    pub fn default_family(self) -> SourceFamily {
        match self {
            SourceCategory::Contract => SourceFamily::Contracts,
            SourceCategory::Grant => SourceFamily::Grants,
            SourceCategory::Opportunity => SourceFamily::Opportunities,
            SourceCategory::Entity | SourceCategory::Exclusion | SourceCategory::Regulatory => {
                SourceFamily::Reference
            }
        }
    }
}

/// The closed set of connector variants the harness knows how to talk to.
///
/// Each variant fixes the upstream request shape and the field mapping; see
/// [`crate::mapping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    UsaspendingAwards,
    UsaspendingGrants,
    GrantsGov,
    SamOpportunities,
    SamEntities,
    SamExclusions,
    FederalRegister,
    StateContracts,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::UsaspendingAwards => "usaspending_awards",
            SourceKind::UsaspendingGrants => "usaspending_grants",
            SourceKind::GrantsGov => "grants_gov",
            SourceKind::SamOpportunities => "sam_opportunities",
            SourceKind::SamEntities => "sam_entities",
            SourceKind::SamExclusions => "sam_exclusions",
            SourceKind::FederalRegister => "federal_register",
            SourceKind::StateContracts => "state_contracts",
        }
    }

    /// The entity kind every record from this source maps to.
    pub fn entity_kind(self) -> EntityKind {
        match self {
            SourceKind::UsaspendingAwards | SourceKind::StateContracts => EntityKind::Award,
            SourceKind::UsaspendingGrants => EntityKind::Grant,
            SourceKind::GrantsGov | SourceKind::SamOpportunities => EntityKind::Opportunity,
            SourceKind::SamEntities => EntityKind::Entity,
            SourceKind::SamExclusions => EntityKind::Exclusion,
            SourceKind::FederalRegister => EntityKind::Regulation,
        }
    }
}

/// Kind of record held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Award,
    Grant,
    Opportunity,
    Entity,
    Exclusion,
    Regulation,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Award,
        EntityKind::Grant,
        EntityKind::Opportunity,
        EntityKind::Entity,
        EntityKind::Exclusion,
        EntityKind::Regulation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Award => "award",
            EntityKind::Grant => "grant",
            EntityKind::Opportunity => "opportunity",
            EntityKind::Entity => "entity",
            EntityKind::Exclusion => "exclusion",
            EntityKind::Regulation => "regulation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        EntityKind::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of one upstream source, built from config at startup.
#[derive(Debug, Clone, Serialize)]
pub struct SourceDescriptor {
    pub id: String,
    pub kind: SourceKind,
    pub category: SourceCategory,
    pub family: SourceFamily,
    pub base_url: String,
    /// Partition key space. A single `"*"` means the source is unpartitioned.
    pub partitions: Vec<String>,
    /// Partitions scheduled ahead of the rest (highest historical density).
    pub priority_partitions: Vec<String>,
    pub rate_limit: RateLimitSpec,
    pub page_size: u32,
    pub max_pages: u32,
    /// Environment variable holding the API key, if the source needs one.
    pub credential_env: Option<String>,
    /// Action-date window, for sources that filter server-side by date.
    pub time_period: Option<TimePeriod>,
}

/// Inclusive date window sent as a server-side filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimePeriod {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// Per-source rate-limit parameters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateLimitSpec {
    /// Fixed delay enforced between consecutive upstream calls.
    #[serde(with = "duration_ms")]
    pub delay: Duration,
    /// Upper bound on calls in flight at once for this source.
    pub max_in_flight: usize,
    /// Hard per-call timeout.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for RateLimitSpec {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(250),
            max_in_flight: 1,
            timeout: Duration::from_secs(15),
        }
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Position within a partition's page sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    Start,
    Page(String),
}

/// One page of raw records plus where to continue from.
#[derive(Debug, Clone)]
pub struct Page {
    pub records: Vec<RawRecord>,
    /// `None` when the partition is exhausted.
    pub next: Option<Cursor>,
}

/// Payload exactly as received from a connector, before mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord(pub Value);

/// Ordered tuple of field values that identifies a real-world record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey(Vec<String>);

impl NaturalKey {
    /// Build a key, rejecting empty tuples and blank parts.
    pub fn new<I, S>(parts: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let parts: Vec<String> = parts.into_iter().map(Into::into).collect();
        if parts.is_empty() || parts.iter().any(|p| p.trim().is_empty()) {
            return None;
        }
        Some(Self(parts))
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Human-readable form for logs and derived rows. Not unique when a
    /// part itself contains `|`; use [`NaturalKey::encode`] for storage.
    pub fn render(&self) -> String {
        self.0.join("|")
    }

    /// Lossless column form: the parts as a JSON array.
    pub fn encode(&self) -> String {
        Value::from(self.0.clone()).to_string()
    }

    pub fn decode(encoded: &str) -> Option<Self> {
        let parts: Vec<String> = serde_json::from_str(encoded).ok()?;
        Self::new(parts)
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// A normalized record ready for the upsert sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub kind: EntityKind,
    pub key: NaturalKey,
    pub fields: Map<String, Value>,
    /// Source id of the connector that produced the record.
    pub source: String,
    /// Upstream modification time, when the source exposes one.
    pub source_updated_at: Option<DateTime<Utc>>,
    /// Stamped by the sink at apply time.
    pub last_seen: DateTime<Utc>,
}

impl CanonicalRecord {
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn f64_field(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(Value::as_f64)
    }
}

/// A record as read back from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    #[serde(flatten)]
    pub record: CanonicalRecord,
    pub first_seen: DateTime<Utc>,
}

/// Result of one sink write attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub applied: bool,
    pub is_new: bool,
    pub error: Option<String>,
}

impl UpsertOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            applied: false,
            is_new: false,
            error: Some(message.into()),
        }
    }
}

/// Category of a soft failure reported in a Run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Upstream,
    Mapping,
    Write,
    Derivation,
    Config,
}

/// One soft failure. Soft failures never abort a Run; they are listed inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftError {
    pub kind: ErrorKind,
    pub source: String,
    pub partition: Option<String>,
    pub message: String,
}

/// Per-source counters of one ingestion pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceOutcome {
    /// Partitions attempted.
    pub attempted: u64,
    /// Records written (new or updated).
    pub loaded: u64,
    pub new: u64,
    pub updated: u64,
    /// Records rejected by mapping.
    pub dropped: u64,
    /// Records whose write was skipped by the timestamp gate.
    pub stale: u64,
    pub errors: Vec<SoftError>,
}

/// Outcome of a best-effort maintenance or derivation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: String,
    pub ok: bool,
    pub affected: Option<u64>,
    pub error: Option<String>,
}

/// Aggregated result of one ingestion pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestionRunResult {
    pub per_source: BTreeMap<String, SourceOutcome>,
    pub total_loaded: u64,
    pub total_new: u64,
    pub errors: Vec<SoftError>,
    pub maintenance: Vec<StepOutcome>,
    pub duration_ms: u64,
}

impl IngestionRunResult {
    /// Fold one unit's outcome into the per-source map.
    pub fn absorb(&mut self, source: &str, unit: SourceOutcome) {
        let entry = self.per_source.entry(source.to_string()).or_default();
        entry.attempted += unit.attempted;
        entry.loaded += unit.loaded;
        entry.new += unit.new;
        entry.updated += unit.updated;
        entry.dropped += unit.dropped;
        entry.stale += unit.stale;
        self.total_loaded += unit.loaded;
        self.total_new += unit.new;
        self.errors.extend(unit.errors.iter().cloned());
        entry.errors.extend(unit.errors);
    }
}

/// Result of one derivation cycle. Counts are `None` for steps that did not run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DerivationCycleResult {
    pub below_threshold: bool,
    pub stats_resynced: Option<u64>,
    pub relationships_discovered: Option<u64>,
    pub network_edges: Option<u64>,
    pub insights_generated: Option<u64>,
    pub entities_scored: Option<u64>,
    pub aggregates_refreshed: Option<u64>,
    pub health_snapshot_id: Option<String>,
    pub quality_score: Option<u8>,
    pub steps: Vec<StepOutcome>,
}

/// What started a Run. Each variant is also an exclusivity scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Hourly,
    Daily,
    Weekly,
    Manual,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::Hourly => "hourly",
            TriggerKind::Daily => "daily",
            TriggerKind::Weekly => "weekly",
            TriggerKind::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hourly" => Some(TriggerKind::Hourly),
            "daily" => Some(TriggerKind::Daily),
            "weekly" => Some(TriggerKind::Weekly),
            "manual" => Some(TriggerKind::Manual),
            _ => None,
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Complete,
    Failed,
}

/// Point-in-time quality score of the corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub id: String,
    pub quality_score: u8,
    pub record_count: u64,
    /// Completeness percentage per entity kind.
    pub completeness: BTreeMap<String, u8>,
    pub captured_at: DateTime<Utc>,
}

/// Family toggles accepted by the HTTP trigger and the CLI.
///
/// Unknown keys are ignored. Reference sources always participate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub contracts: bool,
    pub grants: bool,
    pub opportunities: bool,
    pub states: bool,
    pub historical: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            contracts: true,
            grants: true,
            opportunities: true,
            states: true,
            historical: false,
        }
    }
}

impl RunOptions {
    pub fn includes(&self, family: SourceFamily) -> bool {
        match family {
            SourceFamily::Contracts => self.contracts,
            SourceFamily::Grants => self.grants,
            SourceFamily::Opportunities => self.opportunities,
            SourceFamily::States => self.states,
            SourceFamily::Historical => self.historical,
            SourceFamily::Reference => true,
        }
    }
}
