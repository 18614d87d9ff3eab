//! Store-side derivation procedures.
//!
//! Each derivation step is a named procedure invoked through
//! [`Store::call_procedure`]. The computations themselves are pure functions
//! over records and previously derived rows; a backend only has to implement
//! [`DerivedStore`] (read and replace the derived tables) and route
//! `call_procedure` to [`execute`].
//!
//! | Procedure | Reads | Replaces |
//! |-----------|-------|----------|
//! | `resync_entity_stats` | awards, grants, entities, exclusions | entity stats |
//! | `discover_relationships` | awards, grants, exclusions, stats | `funded_by` + `excluded` edges |
//! | `generate_insights` | stats, relationships, opportunities | insights |
//! | `score_entities` | stats | scores |
//! | `capture_health_snapshot` | all records | appends a snapshot |
//! | `deep_network_analysis` | stats | `co_agency` edges |
//! | `refresh_aggregates` | awards, grants | agency totals |
//! | `audit_cleanup` | everything derived | drops orphans |
//!
//! Every procedure fully replaces what it owns, so running one twice leaves
//! the same state as running it once.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::models::{EntityKind, HealthSnapshot, StoredRecord};
use crate::store::{RecordFilter, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Procedure {
    ResyncEntityStats,
    DiscoverRelationships,
    GenerateInsights,
    ScoreEntities,
    CaptureHealthSnapshot,
    DeepNetworkAnalysis,
    RefreshAggregates,
    AuditCleanup,
}

impl Procedure {
    pub const ALL: [Procedure; 8] = [
        Procedure::ResyncEntityStats,
        Procedure::DiscoverRelationships,
        Procedure::GenerateInsights,
        Procedure::ScoreEntities,
        Procedure::CaptureHealthSnapshot,
        Procedure::DeepNetworkAnalysis,
        Procedure::RefreshAggregates,
        Procedure::AuditCleanup,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Procedure::ResyncEntityStats => "resync_entity_stats",
            Procedure::DiscoverRelationships => "discover_relationships",
            Procedure::GenerateInsights => "generate_insights",
            Procedure::ScoreEntities => "score_entities",
            Procedure::CaptureHealthSnapshot => "capture_health_snapshot",
            Procedure::DeepNetworkAnalysis => "deep_network_analysis",
            Procedure::RefreshAggregates => "refresh_aggregates",
            Procedure::AuditCleanup => "audit_cleanup",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Procedure::ALL.into_iter().find(|p| p.name() == name)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Derived rows
// ═══════════════════════════════════════════════════════════════════════

/// Per-recipient statistics over awards and grants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityStat {
    pub recipient_key: String,
    pub name: String,
    pub uei: Option<String>,
    pub award_count: u64,
    pub grant_count: u64,
    pub total_value: f64,
    pub agencies: BTreeSet<String>,
    pub excluded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub kind: String,
    pub from: String,
    pub to: String,
    pub weight: f64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub kind: String,
    pub subject: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityScore {
    pub recipient_key: String,
    pub score: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgencyTotal {
    pub agency: String,
    pub record_count: u64,
    pub total_value: f64,
}

/// Read and replace access to derived tables.
#[async_trait]
pub trait DerivedStore: Store {
    async fn entity_stats(&self) -> Result<Vec<EntityStat>>;
    async fn replace_entity_stats(&self, stats: &[EntityStat]) -> Result<()>;

    async fn relationships(&self) -> Result<Vec<Relationship>>;
    /// Replace every edge whose kind is in `kinds` with `edges`.
    async fn replace_relationships(&self, kinds: &[&str], edges: &[Relationship]) -> Result<()>;

    async fn insights(&self) -> Result<Vec<Insight>>;
    async fn replace_insights(&self, insights: &[Insight]) -> Result<()>;

    async fn scores(&self) -> Result<Vec<EntityScore>>;
    async fn replace_scores(&self, scores: &[EntityScore]) -> Result<()>;

    async fn replace_aggregates(&self, totals: &[AgencyTotal]) -> Result<()>;

    async fn insert_health(&self, snapshot: &HealthSnapshot) -> Result<()>;
}

pub const EDGE_FUNDED_BY: &str = "funded_by";
pub const EDGE_EXCLUDED: &str = "excluded";
pub const EDGE_CO_AGENCY: &str = "co_agency";

pub const INSIGHT_CONCENTRATION: &str = "agency_concentration";
pub const INSIGHT_EXCLUDED: &str = "excluded_recipient";
pub const INSIGHT_CLOSING: &str = "closing_soon";

/// Dispatch a procedure by name.
pub async fn execute<S: DerivedStore + ?Sized>(store: &S, name: &str, args: &Value) -> Result<Value> {
    let procedure = Procedure::parse(name).ok_or_else(|| anyhow!("unknown procedure: {}", name))?;
    let as_of = parse_as_of(args)?;

    match procedure {
        Procedure::ResyncEntityStats => {
            let awards = load(store, EntityKind::Award).await?;
            let grants = load(store, EntityKind::Grant).await?;
            let entities = load(store, EntityKind::Entity).await?;
            let exclusions = load(store, EntityKind::Exclusion).await?;
            let stats = compute_entity_stats(&awards, &grants, &entities, &exclusions);
            store.replace_entity_stats(&stats).await?;
            Ok(json!({ "affected": stats.len() }))
        }
        Procedure::DiscoverRelationships => {
            let awards = load(store, EntityKind::Award).await?;
            let grants = load(store, EntityKind::Grant).await?;
            let exclusions = load(store, EntityKind::Exclusion).await?;
            let stats = store.entity_stats().await?;
            let edges = compute_relationships(&awards, &grants, &exclusions, &stats);
            store
                .replace_relationships(&[EDGE_FUNDED_BY, EDGE_EXCLUDED], &edges)
                .await?;
            Ok(json!({ "affected": edges.len() }))
        }
        Procedure::GenerateInsights => {
            let stats = store.entity_stats().await?;
            let edges = store.relationships().await?;
            let opportunities = load(store, EntityKind::Opportunity).await?;
            let insights = compute_insights(&stats, &edges, &opportunities, as_of);
            store.replace_insights(&insights).await?;
            Ok(json!({ "affected": insights.len() }))
        }
        Procedure::ScoreEntities => {
            let stats = store.entity_stats().await?;
            let scores: Vec<EntityScore> = stats.iter().map(score_entity).collect();
            store.replace_scores(&scores).await?;
            Ok(json!({ "affected": scores.len() }))
        }
        Procedure::CaptureHealthSnapshot => {
            let mut all = Vec::new();
            for kind in EntityKind::ALL {
                all.extend(load(store, kind).await?);
            }
            let snapshot = compute_health(&all, as_of);
            store.insert_health(&snapshot).await?;
            Ok(json!({
                "snapshot_id": snapshot.id,
                "quality_score": snapshot.quality_score,
                "record_count": snapshot.record_count,
            }))
        }
        Procedure::DeepNetworkAnalysis => {
            let top_n = args
                .get("top_n")
                .and_then(Value::as_u64)
                .unwrap_or(25) as usize;
            let stats = store.entity_stats().await?;
            let edges = compute_network(&stats, top_n);
            store.replace_relationships(&[EDGE_CO_AGENCY], &edges).await?;
            Ok(json!({ "affected": edges.len() }))
        }
        Procedure::RefreshAggregates => {
            let awards = load(store, EntityKind::Award).await?;
            let grants = load(store, EntityKind::Grant).await?;
            let totals = compute_agency_totals(&awards, &grants);
            store.replace_aggregates(&totals).await?;
            Ok(json!({ "affected": totals.len() }))
        }
        Procedure::AuditCleanup => {
            let stats = store.entity_stats().await?;
            let opportunities = load(store, EntityKind::Opportunity).await?;
            let edges = store.relationships().await?;
            let insights = store.insights().await?;
            let scores = store.scores().await?;

            let audit = audit(&stats, &opportunities, edges, insights, scores, as_of);
            let kinds = [EDGE_FUNDED_BY, EDGE_EXCLUDED, EDGE_CO_AGENCY];
            store.replace_relationships(&kinds, &audit.edges).await?;
            store.replace_insights(&audit.insights).await?;
            store.replace_scores(&audit.scores).await?;
            Ok(json!({ "affected": audit.removed }))
        }
    }
}

async fn load<S: Store + ?Sized>(store: &S, kind: EntityKind) -> Result<Vec<StoredRecord>> {
    store.query(kind, &RecordFilter::default()).await
}

fn parse_as_of(args: &Value) -> Result<DateTime<Utc>> {
    match args.get("as_of").and_then(Value::as_str) {
        Some(s) => Ok(DateTime::parse_from_rfc3339(s)
            .map_err(|e| anyhow!("invalid as_of '{}': {}", s, e))?
            .with_timezone(&Utc)),
        None => Ok(Utc::now()),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Pure computations
// ═══════════════════════════════════════════════════════════════════════

/// Stable identity of a recipient: UEI when known, else the normalized name.
pub fn recipient_key(uei: Option<&str>, name: Option<&str>) -> Option<String> {
    if let Some(uei) = uei.map(str::trim).filter(|u| !u.is_empty()) {
        return Some(format!("uei:{}", uei.to_uppercase()));
    }
    let name = normalize_name(name?);
    if name.is_empty() {
        None
    } else {
        Some(format!("name:{}", name))
    }
}

pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(|w| w.trim_matches(|c: char| c == ',' || c == '.'))
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

fn recipient_of(rec: &StoredRecord) -> Option<String> {
    recipient_key(
        rec.record.str_field("recipient_uei"),
        rec.record.str_field("recipient_name"),
    )
}

pub fn compute_entity_stats(
    awards: &[StoredRecord],
    grants: &[StoredRecord],
    entities: &[StoredRecord],
    exclusions: &[StoredRecord],
) -> Vec<EntityStat> {
    let mut stats: BTreeMap<String, EntityStat> = BTreeMap::new();

    let funded = awards
        .iter()
        .map(|r| (r, true))
        .chain(grants.iter().map(|r| (r, false)));
    for (rec, is_award) in funded {
        let Some(key) = recipient_of(rec) else {
            continue;
        };
        let stat = stats.entry(key.clone()).or_insert_with(|| EntityStat {
            recipient_key: key,
            name: rec.record.str_field("recipient_name").unwrap_or_default().to_string(),
            uei: rec
                .record
                .str_field("recipient_uei")
                .filter(|u| !u.trim().is_empty())
                .map(str::to_string),
            award_count: 0,
            grant_count: 0,
            total_value: 0.0,
            agencies: BTreeSet::new(),
            excluded: false,
        });
        if is_award {
            stat.award_count += 1;
        } else {
            stat.grant_count += 1;
        }
        stat.total_value += rec.record.f64_field("amount").unwrap_or(0.0);
        if let Some(agency) = rec.record.str_field("agency") {
            stat.agencies.insert(agency.to_string());
        }
    }

    // Registered entities backfill names for recipients known only by UEI.
    for ent in entities {
        let key = recipient_key(ent.record.str_field("uei"), ent.record.str_field("legal_name"));
        if let Some(stat) = key.and_then(|k| stats.get_mut(&k)) {
            if stat.name.is_empty() {
                if let Some(name) = ent.record.str_field("legal_name") {
                    stat.name = name.to_string();
                }
            }
        }
    }

    let excluded = excluded_keys(exclusions);
    for stat in stats.values_mut() {
        stat.excluded = matches_exclusion(stat, &excluded);
    }

    stats.into_values().collect()
}

/// Keys under which exclusions can match a recipient (UEI and name forms).
fn excluded_keys(exclusions: &[StoredRecord]) -> HashSet<String> {
    let mut keys = HashSet::new();
    for ex in exclusions {
        if let Some(k) = recipient_key(ex.record.str_field("uei"), None) {
            keys.insert(k);
        }
        if let Some(k) = recipient_key(None, ex.record.str_field("name")) {
            keys.insert(k);
        }
    }
    keys
}

fn matches_exclusion(stat: &EntityStat, excluded: &HashSet<String>) -> bool {
    if excluded.contains(&stat.recipient_key) {
        return true;
    }
    recipient_key(None, Some(&stat.name))
        .map(|k| excluded.contains(&k))
        .unwrap_or(false)
}

pub fn compute_relationships(
    awards: &[StoredRecord],
    grants: &[StoredRecord],
    exclusions: &[StoredRecord],
    stats: &[EntityStat],
) -> Vec<Relationship> {
    let mut funded: BTreeMap<(String, String), (f64, u64)> = BTreeMap::new();
    for rec in awards.iter().chain(grants.iter()) {
        let (Some(key), Some(agency)) = (recipient_of(rec), rec.record.str_field("agency")) else {
            continue;
        };
        let entry = funded.entry((key, agency.to_string())).or_insert((0.0, 0));
        entry.0 += rec.record.f64_field("amount").unwrap_or(0.0);
        entry.1 += 1;
    }

    let mut edges: Vec<Relationship> = funded
        .into_iter()
        .map(|((from, to), (weight, count))| Relationship {
            kind: EDGE_FUNDED_BY.to_string(),
            from,
            to,
            weight,
            count,
        })
        .collect();

    for ex in exclusions {
        let uei_key = recipient_key(ex.record.str_field("uei"), None);
        let name_key = recipient_key(None, ex.record.str_field("name"));
        for stat in stats {
            let by_uei = uei_key.as_deref() == Some(stat.recipient_key.as_str());
            let by_name = name_key.is_some()
                && (name_key.as_deref() == Some(stat.recipient_key.as_str())
                    || name_key == recipient_key(None, Some(&stat.name)));
            if by_uei || by_name {
                edges.push(Relationship {
                    kind: EDGE_EXCLUDED.to_string(),
                    from: stat.recipient_key.clone(),
                    to: ex.record.key.render(),
                    weight: 1.0,
                    count: 1,
                });
            }
        }
    }

    edges
}

pub fn compute_insights(
    stats: &[EntityStat],
    edges: &[Relationship],
    opportunities: &[StoredRecord],
    as_of: DateTime<Utc>,
) -> Vec<Insight> {
    let mut insights = Vec::new();

    for stat in stats {
        if stat.award_count >= 3 && stat.total_value > 0.0 {
            let top = edges
                .iter()
                .filter(|e| e.kind == EDGE_FUNDED_BY && e.from == stat.recipient_key)
                .max_by(|a, b| a.weight.total_cmp(&b.weight));
            if let Some(top) = top {
                let share = top.weight / stat.total_value;
                if share >= 0.8 {
                    insights.push(Insight {
                        kind: INSIGHT_CONCENTRATION.to_string(),
                        subject: stat.recipient_key.clone(),
                        detail: format!("{:.0}% of obligated value from {}", share * 100.0, top.to),
                        created_at: as_of,
                    });
                }
            }
        }

        if stat.excluded && stat.award_count + stat.grant_count > 0 {
            insights.push(Insight {
                kind: INSIGHT_EXCLUDED.to_string(),
                subject: stat.recipient_key.clone(),
                detail: format!(
                    "{} matches an exclusion record and holds {} funded record(s)",
                    stat.name,
                    stat.award_count + stat.grant_count
                ),
                created_at: as_of,
            });
        }
    }

    let today = as_of.date_naive();
    let horizon = today + Duration::days(7);
    for opp in opportunities {
        let Some(deadline) = opp
            .record
            .str_field("response_deadline")
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        else {
            continue;
        };
        if deadline >= today && deadline <= horizon {
            insights.push(Insight {
                kind: INSIGHT_CLOSING.to_string(),
                subject: opp.record.key.render(),
                detail: format!(
                    "{} closes {}",
                    opp.record.str_field("title").unwrap_or("opportunity"),
                    deadline
                ),
                created_at: as_of,
            });
        }
    }

    insights
}

pub fn score_entity(stat: &EntityStat) -> EntityScore {
    let value = (50.0 * (1.0 + stat.total_value.max(0.0)).log10() / 9.0).min(50.0);
    let volume = ((stat.award_count + stat.grant_count) as f64).min(25.0);
    let diversity = (stat.agencies.len() as f64 * 5.0).min(25.0);
    let mut score = value + volume + diversity;
    if stat.excluded {
        score -= 40.0;
    }
    EntityScore {
        recipient_key: stat.recipient_key.clone(),
        score: score.clamp(0.0, 100.0).round() as u8,
    }
}

/// Fields a record of each kind is expected to carry.
pub fn expected_fields(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Award | EntityKind::Grant => {
            &["recipient_name", "agency", "amount", "action_date"]
        }
        EntityKind::Opportunity => &["title", "agency", "posted_date", "response_deadline"],
        EntityKind::Entity => &["legal_name", "state", "naics"],
        EntityKind::Exclusion => &["name", "exclusion_type", "activation_date"],
        EntityKind::Regulation => &["title", "agency", "publication_date"],
    }
}

fn completeness(rec: &StoredRecord) -> f64 {
    let expected = expected_fields(rec.record.kind);
    let present = expected
        .iter()
        .filter(|f| match rec.record.fields.get(**f) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        })
        .count();
    present as f64 / expected.len() as f64
}

pub fn compute_health(records: &[StoredRecord], as_of: DateTime<Utc>) -> HealthSnapshot {
    let mut per_kind: BTreeMap<String, (f64, u64)> = BTreeMap::new();
    let mut total = 0.0;
    for rec in records {
        let c = completeness(rec);
        total += c;
        let entry = per_kind.entry(rec.record.kind.as_str().to_string()).or_insert((0.0, 0));
        entry.0 += c;
        entry.1 += 1;
    }

    let quality_score = if records.is_empty() {
        100
    } else {
        (100.0 * total / records.len() as f64).round() as u8
    };

    HealthSnapshot {
        id: Uuid::new_v4().to_string(),
        quality_score,
        record_count: records.len() as u64,
        completeness: per_kind
            .into_iter()
            .map(|(k, (sum, n))| (k, (100.0 * sum / n as f64).round() as u8))
            .collect(),
        captured_at: as_of,
    }
}

/// Pairwise shared-agency edges among the top `top_n` recipients by value.
pub fn compute_network(stats: &[EntityStat], top_n: usize) -> Vec<Relationship> {
    let mut ranked: Vec<&EntityStat> = stats.iter().collect();
    ranked.sort_by(|a, b| {
        b.total_value
            .total_cmp(&a.total_value)
            .then_with(|| a.recipient_key.cmp(&b.recipient_key))
    });
    ranked.truncate(top_n);

    let mut edges = Vec::new();
    for (i, a) in ranked.iter().enumerate() {
        for b in &ranked[i + 1..] {
            let shared = a.agencies.intersection(&b.agencies).count();
            if shared == 0 {
                continue;
            }
            let (from, to) = if a.recipient_key <= b.recipient_key {
                (&a.recipient_key, &b.recipient_key)
            } else {
                (&b.recipient_key, &a.recipient_key)
            };
            edges.push(Relationship {
                kind: EDGE_CO_AGENCY.to_string(),
                from: from.clone(),
                to: to.clone(),
                weight: shared as f64,
                count: shared as u64,
            });
        }
    }
    edges
}

pub fn compute_agency_totals(awards: &[StoredRecord], grants: &[StoredRecord]) -> Vec<AgencyTotal> {
    let mut totals: BTreeMap<String, (u64, f64)> = BTreeMap::new();
    for rec in awards.iter().chain(grants.iter()) {
        let Some(agency) = rec.record.str_field("agency") else {
            continue;
        };
        let entry = totals.entry(agency.to_string()).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += rec.record.f64_field("amount").unwrap_or(0.0);
    }
    totals
        .into_iter()
        .map(|(agency, (record_count, total_value))| AgencyTotal {
            agency,
            record_count,
            total_value,
        })
        .collect()
}

pub struct AuditResult {
    pub edges: Vec<Relationship>,
    pub insights: Vec<Insight>,
    pub scores: Vec<EntityScore>,
    pub removed: u64,
}

/// Drop derived rows that point at recipients or opportunities that no longer exist,
/// and closing-soon insights whose deadline has passed.
pub fn audit(
    stats: &[EntityStat],
    opportunities: &[StoredRecord],
    edges: Vec<Relationship>,
    insights: Vec<Insight>,
    scores: Vec<EntityScore>,
    as_of: DateTime<Utc>,
) -> AuditResult {
    let recipients: HashSet<&str> = stats.iter().map(|s| s.recipient_key.as_str()).collect();
    let open: HashSet<String> = opportunities
        .iter()
        .filter(|o| {
            o.record
                .str_field("response_deadline")
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
                .map(|d| d >= as_of.date_naive())
                .unwrap_or(true)
        })
        .map(|o| o.record.key.render())
        .collect();

    let before = (edges.len() + insights.len() + scores.len()) as u64;

    let edges: Vec<Relationship> = edges
        .into_iter()
        .filter(|e| {
            recipients.contains(e.from.as_str())
                && (e.kind != EDGE_CO_AGENCY || recipients.contains(e.to.as_str()))
        })
        .collect();
    let insights: Vec<Insight> = insights
        .into_iter()
        .filter(|i| {
            if i.kind == INSIGHT_CLOSING {
                open.contains(&i.subject)
            } else {
                recipients.contains(i.subject.as_str())
            }
        })
        .collect();
    let scores: Vec<EntityScore> = scores
        .into_iter()
        .filter(|s| recipients.contains(s.recipient_key.as_str()))
        .collect();

    let after = (edges.len() + insights.len() + scores.len()) as u64;
    AuditResult {
        edges,
        insights,
        scores,
        removed: before - after,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CanonicalRecord, NaturalKey};
    use chrono::TimeZone;
    use serde_json::Map;

    fn rec(kind: EntityKind, key: &str, fields: Value) -> StoredRecord {
        let fields: Map<String, Value> = fields.as_object().cloned().unwrap_or_default();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        StoredRecord {
            record: CanonicalRecord {
                kind,
                key: NaturalKey::new([key]).unwrap(),
                fields,
                source: "test".into(),
                source_updated_at: None,
                last_seen: now,
            },
            first_seen: now,
        }
    }

    fn award(key: &str, uei: &str, name: &str, agency: &str, amount: f64) -> StoredRecord {
        rec(
            EntityKind::Award,
            key,
            json!({
                "recipient_uei": uei,
                "recipient_name": name,
                "agency": agency,
                "amount": amount,
                "action_date": "2024-05-01",
            }),
        )
    }

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn recipient_key_prefers_uei_then_normalized_name() {
        assert_eq!(recipient_key(Some(" abc123 "), Some("Acme")), Some("uei:ABC123".into()));
        assert_eq!(
            recipient_key(Some(""), Some("Acme,  Inc.")),
            Some("name:ACME INC".into())
        );
        assert_eq!(recipient_key(None, Some("  ")), None);
    }

    #[test]
    fn stats_aggregate_awards_and_flag_exclusions() {
        let awards = vec![
            award("A1", "U1", "Acme", "DOD", 100.0),
            award("A2", "U1", "Acme", "NASA", 50.0),
            award("A3", "", "Beta LLC", "DOD", 10.0),
        ];
        let exclusions = vec![rec(
            EntityKind::Exclusion,
            "X1",
            json!({"name": "beta llc", "exclusion_type": "Ineligible"}),
        )];
        let stats = compute_entity_stats(&awards, &[], &[], &exclusions);
        assert_eq!(stats.len(), 2);

        let acme = stats.iter().find(|s| s.recipient_key == "uei:U1").unwrap();
        assert_eq!(acme.award_count, 2);
        assert_eq!(acme.total_value, 150.0);
        assert_eq!(acme.agencies.len(), 2);
        assert!(!acme.excluded);

        let beta = stats.iter().find(|s| s.recipient_key == "name:BETA LLC").unwrap();
        assert!(beta.excluded);
    }

    #[test]
    fn concentration_insight_requires_dominant_agency() {
        let awards = vec![
            award("A1", "U1", "Acme", "DOD", 900.0),
            award("A2", "U1", "Acme", "DOD", 50.0),
            award("A3", "U1", "Acme", "NASA", 50.0),
        ];
        let stats = compute_entity_stats(&awards, &[], &[], &[]);
        let edges = compute_relationships(&awards, &[], &[], &stats);
        assert_eq!(edges.len(), 2);

        let insights = compute_insights(&stats, &edges, &[], as_of());
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].kind, INSIGHT_CONCENTRATION);
        assert!(insights[0].detail.contains("DOD"));
    }

    #[test]
    fn closing_soon_only_within_a_week() {
        let opps = vec![
            rec(EntityKind::Opportunity, "N1", json!({"title": "Soon", "response_deadline": "2024-06-05"})),
            rec(EntityKind::Opportunity, "N2", json!({"title": "Later", "response_deadline": "2024-07-30"})),
            rec(EntityKind::Opportunity, "N3", json!({"title": "Past", "response_deadline": "2024-05-01"})),
        ];
        let insights = compute_insights(&[], &[], &opps, as_of());
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].subject, "N1");
    }

    #[test]
    fn exclusion_penalty_lowers_score() {
        let mut stat = EntityStat {
            recipient_key: "uei:U1".into(),
            name: "Acme".into(),
            uei: Some("U1".into()),
            award_count: 10,
            grant_count: 0,
            total_value: 1_000_000.0,
            agencies: ["DOD".to_string(), "NASA".to_string()].into_iter().collect(),
            excluded: false,
        };
        let clean = score_entity(&stat).score;
        stat.excluded = true;
        let penalized = score_entity(&stat).score;
        assert!(clean > penalized);
        assert!(clean <= 100);
    }

    #[test]
    fn health_scores_field_completeness() {
        let records = vec![
            award("A1", "U1", "Acme", "DOD", 1.0),
            rec(EntityKind::Award, "A2", json!({"recipient_name": "Beta", "agency": ""})),
        ];
        let snap = compute_health(&records, as_of());
        // 4/4 and 1/4 complete.
        assert_eq!(snap.quality_score, 63);
        assert_eq!(snap.record_count, 2);
        assert_eq!(snap.completeness["award"], 63);

        assert_eq!(compute_health(&[], as_of()).quality_score, 100);
    }

    #[test]
    fn network_links_top_entities_sharing_agencies() {
        let awards = vec![
            award("A1", "U1", "Acme", "DOD", 500.0),
            award("A2", "U2", "Beta", "DOD", 400.0),
            award("A3", "U3", "Gamma", "NASA", 300.0),
            award("A4", "U4", "Delta", "DOD", 1.0),
        ];
        let stats = compute_entity_stats(&awards, &[], &[], &[]);
        let edges = compute_network(&stats, 3);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].from, "uei:U1");
        assert_eq!(edges[0].to, "uei:U2");
    }

    #[test]
    fn audit_drops_orphans_and_expired_deadlines() {
        let stats = compute_entity_stats(&[award("A1", "U1", "Acme", "DOD", 5.0)], &[], &[], &[]);
        let edges = vec![
            Relationship { kind: EDGE_FUNDED_BY.into(), from: "uei:U1".into(), to: "DOD".into(), weight: 5.0, count: 1 },
            Relationship { kind: EDGE_FUNDED_BY.into(), from: "uei:GONE".into(), to: "DOD".into(), weight: 5.0, count: 1 },
        ];
        let insights = vec![Insight {
            kind: INSIGHT_CLOSING.into(),
            subject: "N9".into(),
            detail: String::new(),
            created_at: as_of(),
        }];
        let scores = vec![
            EntityScore { recipient_key: "uei:U1".into(), score: 40 },
            EntityScore { recipient_key: "uei:GONE".into(), score: 40 },
        ];
        let result = audit(&stats, &[], edges, insights, scores, as_of());
        assert_eq!(result.removed, 3);
        assert_eq!(result.edges.len(), 1);
        assert!(result.insights.is_empty());
        assert_eq!(result.scores.len(), 1);
    }

    #[test]
    fn procedure_names_round_trip() {
        for p in Procedure::ALL {
            assert_eq!(Procedure::parse(p.name()), Some(p));
        }
        assert_eq!(Procedure::parse("drop_everything"), None);
    }
}
