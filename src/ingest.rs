//! Ingestion orchestration.
//!
//! Fans out one unit of work per `(source, partition)` pair, runs the units
//! concurrently under a global ceiling, and folds every unit's outcome into
//! one [`IngestionRunResult`]. Each unit walks its partition's pages,
//! maps every raw record, and pushes the mapped records through the
//! [`UpsertSink`].
//!
//! Only a store that cannot be reached at all fails the call. Upstream,
//! mapping, write, and configuration problems are recorded as
//! [`SoftError`]s and the remaining units carry on.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connector::{Connector, ConnectorRegistry};
use crate::models::{
    Cursor, ErrorKind, IngestionRunResult, RunOptions, SoftError, SourceDescriptor,
    SourceOutcome, StepOutcome,
};
use crate::procedures::Procedure;
use crate::sink::UpsertSink;
use crate::store::sqlite::SqliteStore;
use crate::store::Store;

/// Steps run after a standalone sync so derived data tracks the new records.
pub const MAINTENANCE_STEPS: [Procedure; 3] = [
    Procedure::ResyncEntityStats,
    Procedure::DiscoverRelationships,
    Procedure::GenerateInsights,
];

/// Which partitions of which sources a Run covers.
#[derive(Debug, Clone, Default)]
pub struct PartitionPlan {
    sources: Vec<PlannedSource>,
}

#[derive(Debug, Clone)]
struct PlannedSource {
    id: String,
    partitions: Vec<String>,
    priority: Vec<String>,
}

impl PartitionPlan {
    /// Every partition of every descriptor whose family `options` includes.
    pub fn from_descriptors(descriptors: &[SourceDescriptor], options: &RunOptions) -> Self {
        let sources = descriptors
            .iter()
            .filter(|d| options.includes(d.family))
            .map(|d| PlannedSource {
                id: d.id.clone(),
                partitions: d.partitions.clone(),
                priority: d.priority_partitions.clone(),
            })
            .collect();
        Self { sources }
    }

    /// Keep only the named sources.
    pub fn only(mut self, ids: &[String]) -> Self {
        self.sources.retain(|s| ids.contains(&s.id));
        self
    }

    /// Replace one source's partition list.
    pub fn with_partitions(mut self, id: &str, partitions: Vec<String>) -> Self {
        if let Some(source) = self.sources.iter_mut().find(|s| s.id == id) {
            source.priority.retain(|p| partitions.contains(p));
            source.partitions = partitions;
        }
        self
    }

    pub fn source_ids(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.id.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Units in scheduling order: every source's priority partitions first,
    /// then the remaining partitions in declaration order.
    pub fn units(&self) -> Vec<(String, String)> {
        let mut head = Vec::new();
        let mut tail = Vec::new();
        for source in &self.sources {
            for p in &source.priority {
                if source.partitions.contains(p) {
                    head.push((source.id.clone(), p.clone()));
                }
            }
            for p in &source.partitions {
                if !source.priority.contains(p) {
                    tail.push((source.id.clone(), p.clone()));
                }
            }
        }
        head.extend(tail);
        head
    }
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Run the maintenance procedures after all units settle.
    pub maintenance: bool,
    /// Ceiling on concurrently running units.
    pub concurrency: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            maintenance: true,
            concurrency: 16,
        }
    }
}

/// Run one ingestion pass over `plan`.
pub async fn run_ingestion(
    registry: &ConnectorRegistry,
    store: Arc<dyn Store>,
    plan: &PartitionPlan,
    options: &IngestOptions,
) -> Result<IngestionRunResult> {
    let started = Instant::now();
    store
        .ping()
        .await
        .context("store is unreachable; ingestion not started")?;

    let mut result = IngestionRunResult::default();
    let mut skipped: Vec<String> = Vec::new();

    for id in plan.source_ids() {
        result.per_source.entry(id.to_string()).or_default();
        let problem = match registry.find(id) {
            None => Some(format!("no connector registered for source {}", id)),
            Some(connector) => connector.preflight().err(),
        };
        if let Some(message) = problem {
            warn!(source = id, error = %message, "Skipping source");
            result.absorb(
                id,
                SourceOutcome {
                    errors: vec![SoftError {
                        kind: ErrorKind::Config,
                        source: id.to_string(),
                        partition: None,
                        message,
                    }],
                    ..Default::default()
                },
            );
            skipped.push(id.to_string());
        }
    }

    let units: Vec<(Arc<dyn Connector>, String)> = plan
        .units()
        .into_iter()
        .filter(|(id, _)| !skipped.contains(id))
        .filter_map(|(id, partition)| registry.find(&id).map(|c| (c, partition)))
        .collect();

    info!(
        sources = plan.source_ids().len() - skipped.len(),
        units = units.len(),
        concurrency = options.concurrency,
        "Ingestion started"
    );

    let sink = UpsertSink::new(store.clone());
    // Unit futures are built up front so the whole pass stays Send.
    let units: Vec<_> = units
        .into_iter()
        .map(|(connector, partition)| run_unit(connector, partition, sink.clone()))
        .collect();
    let outcomes: Vec<(String, SourceOutcome)> = stream::iter(units)
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await;

    for (source, outcome) in outcomes {
        result.absorb(&source, outcome);
    }

    if options.maintenance {
        for step in MAINTENANCE_STEPS {
            result
                .maintenance
                .push(run_step(store.as_ref(), step.name(), &json!({})).await);
        }
    }

    result.duration_ms = started.elapsed().as_millis() as u64;
    info!(
        loaded = result.total_loaded,
        new = result.total_new,
        errors = result.errors.len(),
        duration_ms = result.duration_ms,
        "Ingestion finished"
    );
    Ok(result)
}

/// Walk one partition page by page until it is exhausted, fails, or hits
/// the source's page cap.
async fn run_unit(
    connector: Arc<dyn Connector>,
    partition: String,
    sink: UpsertSink,
) -> (String, SourceOutcome) {
    let source = connector.id().to_string();
    let max_pages = connector.descriptor().max_pages;
    let mut outcome = SourceOutcome {
        attempted: 1,
        ..Default::default()
    };
    let mut cursor = Cursor::Start;
    let mut first_drop: Option<String> = None;

    for _ in 0..max_pages {
        let page = match connector.fetch(&partition, &cursor).await {
            Ok(page) => page,
            Err(e) => {
                warn!(source = %source, partition = %partition, error = %e, "Fetch failed");
                outcome.errors.push(SoftError {
                    kind: ErrorKind::Upstream,
                    source: source.clone(),
                    partition: Some(partition.clone()),
                    message: e.to_string(),
                });
                break;
            }
        };

        for raw in &page.records {
            let mut record = match connector.map(raw) {
                Ok(record) => record,
                Err(reason) => {
                    debug!(source = %source, partition = %partition, %reason, "Dropped record");
                    outcome.dropped += 1;
                    first_drop.get_or_insert_with(|| reason.to_string());
                    continue;
                }
            };
            record.source = source.clone();
            let key = record.key.render();

            let written = sink.apply(record).await;
            if let Some(message) = written.error {
                outcome.errors.push(SoftError {
                    kind: ErrorKind::Write,
                    source: source.clone(),
                    partition: Some(partition.clone()),
                    message: format!("{}: {}", key, message),
                });
            } else if written.is_new {
                outcome.loaded += 1;
                outcome.new += 1;
            } else if written.applied {
                outcome.loaded += 1;
                outcome.updated += 1;
            } else {
                outcome.stale += 1;
            }
        }

        match page.next {
            Some(next) => cursor = next,
            None => break,
        }
    }

    // Drops are reported once per unit, not once per record.
    if let Some(reason) = first_drop {
        outcome.errors.push(SoftError {
            kind: ErrorKind::Mapping,
            source: source.clone(),
            partition: Some(partition.clone()),
            message: format!("{} record(s) dropped, first: {}", outcome.dropped, reason),
        });
    }

    info!(
        source = %source,
        partition = %partition,
        loaded = outcome.loaded,
        dropped = outcome.dropped,
        errors = outcome.errors.len(),
        "Unit finished"
    );
    (source, outcome)
}

/// Call one procedure and report it as a step, never failing.
pub async fn run_step(store: &dyn Store, name: &str, args: &serde_json::Value) -> StepOutcome {
    match store.call_procedure(name, args).await {
        Ok(value) => StepOutcome {
            step: name.to_string(),
            ok: true,
            affected: value.get("affected").and_then(|v| v.as_u64()),
            error: None,
        },
        Err(e) => {
            warn!(step = name, error = %e, "Step failed");
            StepOutcome {
                step: name.to_string(),
                ok: false,
                affected: None,
                error: Some(e.to_string()),
            }
        }
    }
}

/// `gdh sync`: one standalone ingestion pass with a printed summary.
pub async fn run_sync(
    config: &Config,
    options: &RunOptions,
    only: &[String],
    partitions: Option<Vec<String>>,
) -> Result<IngestionRunResult> {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(config).await?);
    let registry = ConnectorRegistry::from_config(config)?;

    let mut plan = PartitionPlan::from_descriptors(&registry.descriptors(), options);
    if !only.is_empty() {
        plan = plan.only(only);
    }
    if let Some(partitions) = partitions {
        let ids: Vec<String> = plan.source_ids().into_iter().map(String::from).collect();
        for id in ids {
            plan = plan.with_partitions(&id, partitions.clone());
        }
    }

    let ingest = IngestOptions {
        maintenance: true,
        concurrency: config.pipeline.concurrency,
    };
    let result = run_ingestion(&registry, store, &plan, &ingest).await?;
    print_summary(&result);
    Ok(result)
}

pub fn print_summary(result: &IngestionRunResult) {
    println!("sync");
    for (source, outcome) in &result.per_source {
        println!(
            "  {:<24} partitions: {:>3}  loaded: {:>6}  new: {:>6}  dropped: {:>4}  errors: {}",
            source,
            outcome.attempted,
            outcome.loaded,
            outcome.new,
            outcome.dropped,
            outcome.errors.len()
        );
    }
    for step in &result.maintenance {
        let status = if step.ok { "ok" } else { "failed" };
        println!("  maintenance {}: {}", step.step, status);
    }
    for err in &result.errors {
        println!(
            "  error [{:?}] {}{}: {}",
            err.kind,
            err.source,
            err.partition
                .as_deref()
                .map(|p| format!("/{}", p))
                .unwrap_or_default(),
            err.message
        );
    }
    println!(
        "  total loaded: {} (new {}) in {}ms",
        result.total_loaded, result.total_new, result.duration_ms
    );
    println!("ok");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RateLimitSpec, SourceCategory, SourceFamily, SourceKind};

    fn descriptor(id: &str, family: SourceFamily, partitions: &[&str], priority: &[&str]) -> SourceDescriptor {
        SourceDescriptor {
            id: id.to_string(),
            kind: SourceKind::UsaspendingAwards,
            category: SourceCategory::Contract,
            family,
            base_url: "http://localhost".into(),
            partitions: partitions.iter().map(|s| s.to_string()).collect(),
            priority_partitions: priority.iter().map(|s| s.to_string()).collect(),
            rate_limit: RateLimitSpec::default(),
            page_size: 10,
            max_pages: 1,
            credential_env: None,
            time_period: None,
        }
    }

    #[test]
    fn priority_partitions_are_scheduled_first() {
        let descs = vec![
            descriptor("awards", SourceFamily::Contracts, &["AK", "CA", "TX"], &["TX"]),
            descriptor("grants", SourceFamily::Grants, &["NY", "CA"], &["CA"]),
        ];
        let plan = PartitionPlan::from_descriptors(&descs, &RunOptions::default());
        let units: Vec<String> = plan
            .units()
            .into_iter()
            .map(|(s, p)| format!("{}/{}", s, p))
            .collect();
        assert_eq!(
            units,
            vec!["awards/TX", "grants/CA", "awards/AK", "awards/CA", "grants/NY"]
        );
    }

    #[test]
    fn run_options_narrow_the_plan() {
        let descs = vec![
            descriptor("awards", SourceFamily::Contracts, &["*"], &[]),
            descriptor("old", SourceFamily::Historical, &["*"], &[]),
            descriptor("entities", SourceFamily::Reference, &["*"], &[]),
        ];
        let options = RunOptions {
            contracts: false,
            ..Default::default()
        };
        let plan = PartitionPlan::from_descriptors(&descs, &options);
        assert_eq!(plan.source_ids(), vec!["entities"]);
    }

    #[test]
    fn partition_override_drops_stale_priorities() {
        let descs = vec![descriptor("awards", SourceFamily::Contracts, &["CA", "TX"], &["TX"])];
        let plan = PartitionPlan::from_descriptors(&descs, &RunOptions::default())
            .with_partitions("awards", vec!["CA".into()]);
        assert_eq!(plan.units(), vec![("awards".to_string(), "CA".to_string())]);
    }
}
