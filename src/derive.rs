//! Derivation engine.
//!
//! Runs the derivation procedures in a fixed order, one after another:
//!
//! ```text
//! resync_entity_stats → discover_relationships → [deep_network_analysis]
//!   → generate_insights → score_entities → [refresh_aggregates]
//!   → capture_health_snapshot
//! ```
//!
//! Each step may depend on what the previous one left in the store, so steps
//! never run concurrently. A failing step is recorded and the next one still
//! runs. When the Run ingested fewer records than the volume threshold, only
//! the health snapshot is taken.

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::{Config, PipelineConfig};
use crate::ingest::run_step;
use crate::models::{DerivationCycleResult, ErrorKind, SoftError, StepOutcome};
use crate::procedures::Procedure;
use crate::store::sqlite::SqliteStore;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct DeriveOptions {
    /// Minimum records ingested this Run before the full cycle runs.
    pub min_volume_threshold: u64,
    /// Add the pairwise network pass over the top entities.
    pub deep: bool,
    pub deep_top_n: usize,
    /// Recompute the per-agency totals.
    pub refresh_aggregates: bool,
    /// Run the full cycle regardless of ingested volume.
    pub force: bool,
}

impl DeriveOptions {
    pub fn from_config(pipeline: &PipelineConfig) -> Self {
        Self {
            min_volume_threshold: pipeline.min_volume_threshold,
            deep: false,
            deep_top_n: pipeline.deep_top_n,
            refresh_aggregates: false,
            force: false,
        }
    }

    /// The weekly variant: deep network analysis plus aggregate refresh.
    /// Not gated on ingested volume.
    pub fn weekly(mut self) -> Self {
        self.deep = true;
        self.refresh_aggregates = true;
        self.force = true;
        self
    }
}

fn plan(ingested: u64, options: &DeriveOptions) -> (bool, Vec<(Procedure, Value)>) {
    let below = !options.force && ingested < options.min_volume_threshold;
    let mut steps = Vec::new();
    if !below {
        steps.push((Procedure::ResyncEntityStats, json!({})));
        steps.push((Procedure::DiscoverRelationships, json!({})));
        if options.deep {
            steps.push((
                Procedure::DeepNetworkAnalysis,
                json!({ "top_n": options.deep_top_n }),
            ));
        }
        steps.push((Procedure::GenerateInsights, json!({})));
        steps.push((Procedure::ScoreEntities, json!({})));
        if options.refresh_aggregates {
            steps.push((Procedure::RefreshAggregates, json!({})));
        }
    }
    steps.push((Procedure::CaptureHealthSnapshot, json!({})));
    (below, steps)
}

/// Run one derivation cycle after a Run that ingested `ingested` records.
pub async fn run_derivation(
    store: &dyn Store,
    ingested: u64,
    options: &DeriveOptions,
) -> DerivationCycleResult {
    let (below_threshold, steps) = plan(ingested, options);
    let mut result = DerivationCycleResult {
        below_threshold,
        ..Default::default()
    };

    if below_threshold {
        info!(
            ingested,
            threshold = options.min_volume_threshold,
            "Below volume threshold, health snapshot only"
        );
    }

    for (procedure, args) in steps {
        if procedure == Procedure::CaptureHealthSnapshot {
            let outcome = capture_health(store, &mut result).await;
            result.steps.push(outcome);
            continue;
        }

        let outcome = run_step(store, procedure.name(), &args).await;
        let affected = outcome.ok.then_some(outcome.affected.unwrap_or(0));
        match procedure {
            Procedure::ResyncEntityStats => result.stats_resynced = affected,
            Procedure::DiscoverRelationships => result.relationships_discovered = affected,
            Procedure::DeepNetworkAnalysis => result.network_edges = affected,
            Procedure::GenerateInsights => result.insights_generated = affected,
            Procedure::ScoreEntities => result.entities_scored = affected,
            Procedure::RefreshAggregates => result.aggregates_refreshed = affected,
            Procedure::CaptureHealthSnapshot | Procedure::AuditCleanup => {}
        }
        result.steps.push(outcome);
    }

    info!(
        below_threshold = result.below_threshold,
        failed = result.steps.iter().filter(|s| !s.ok).count(),
        quality_score = ?result.quality_score,
        "Derivation finished"
    );
    result
}

/// Take a health snapshot and copy its id and score into `result`.
pub async fn capture_health(store: &dyn Store, result: &mut DerivationCycleResult) -> StepOutcome {
    let name = Procedure::CaptureHealthSnapshot.name();
    match store.call_procedure(name, &json!({})).await {
        Ok(value) => {
            result.health_snapshot_id = value
                .get("snapshot_id")
                .and_then(Value::as_str)
                .map(String::from);
            result.quality_score = value
                .get("quality_score")
                .and_then(Value::as_u64)
                .map(|s| s.min(100) as u8);
            StepOutcome {
                step: name.to_string(),
                ok: true,
                affected: value.get("record_count").and_then(Value::as_u64),
                error: None,
            }
        }
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

/// `gdh derive`: one full cycle over the current corpus, ignoring volume.
pub async fn run_derive(config: &Config, deep: bool) -> anyhow::Result<DerivationCycleResult> {
    let store = SqliteStore::open(config).await?;
    let mut options = DeriveOptions::from_config(&config.pipeline);
    if deep {
        options = options.weekly();
    }
    options.force = true;

    let result = run_derivation(&store, 0, &options).await;

    println!("derive{}", if deep { " (deep)" } else { "" });
    for step in &result.steps {
        match (&step.error, step.affected) {
            (Some(e), _) => println!("  {:<26} failed: {}", step.step, e),
            (None, Some(n)) => println!("  {:<26} {}", step.step, n),
            (None, None) => println!("  {:<26} ok", step.step),
        }
    }
    if let Some(score) = result.quality_score {
        println!("  quality score: {}", score);
    }
    println!("ok");

    store.close().await;
    Ok(result)
}

/// Failed steps as soft errors for the Run log.
pub fn step_errors(steps: &[StepOutcome]) -> Vec<SoftError> {
    steps
        .iter()
        .filter(|s| !s.ok)
        .map(|s| SoftError {
            kind: ErrorKind::Derivation,
            source: s.step.clone(),
            partition: None,
            message: s.error.clone().unwrap_or_default(),
        })
        .collect()
}
