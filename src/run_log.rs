//! Run log: the durable audit record of every pipeline Run.
//!
//! A [`RunLog`] is the mutable, in-progress view of a Run: phases and results
//! are appended as they complete. [`RunLog::finish`] consumes it and yields
//! the finished [`PipelineRun`], which has no mutators and is what gets
//! written to the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{
    DerivationCycleResult, IngestionRunResult, RunStatus, SoftError, TriggerKind,
};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Ingestion,
    Derivation,
    HealthCheck,
    AuditCleanup,
}

/// Timing and counts for one phase of a Run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub ok: bool,
    pub detail: serde_json::Value,
}

/// One execution of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub trigger: TriggerKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    /// Whether the Run held its cadence's exclusivity token.
    pub exclusive: bool,
    pub ingestion: Option<IngestionRunResult>,
    pub derivation: Option<DerivationCycleResult>,
    /// Hourly health check escalated to an audit cleanup.
    pub escalated: bool,
    pub phases: Vec<PhaseRecord>,
    pub errors: Vec<SoftError>,
}

pub struct RunLog {
    run: PipelineRun,
}

impl RunLog {
    pub fn start(trigger: TriggerKind) -> Self {
        let run = PipelineRun {
            id: Uuid::new_v4().to_string(),
            trigger,
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            exclusive: true,
            ingestion: None,
            derivation: None,
            escalated: false,
            phases: Vec::new(),
            errors: Vec::new(),
        };
        info!(run_id = %run.id, trigger = %trigger, "Pipeline run started");
        Self { run }
    }

    /// The Run as recorded so far, still `running`.
    pub fn current(&self) -> &PipelineRun {
        &self.run
    }

    pub fn phase(
        &mut self,
        phase: Phase,
        started_at: DateTime<Utc>,
        ok: bool,
        detail: serde_json::Value,
    ) {
        let duration_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
        self.run.phases.push(PhaseRecord {
            phase,
            started_at,
            duration_ms,
            ok,
            detail,
        });
    }

    pub fn record_ingestion(&mut self, result: IngestionRunResult) {
        self.run.errors.extend(result.errors.iter().cloned());
        self.run.ingestion = Some(result);
    }

    pub fn record_derivation(&mut self, result: DerivationCycleResult) {
        self.run.derivation = Some(result);
    }

    pub fn mark_escalated(&mut self) {
        self.run.escalated = true;
    }

    pub fn push_error(&mut self, err: SoftError) {
        self.run.errors.push(err);
    }

    /// Close the Run. The returned record is final.
    pub fn finish(mut self, status: RunStatus) -> PipelineRun {
        self.run.status = status;
        self.run.finished_at = Some(Utc::now());
        info!(
            run_id = %self.run.id,
            trigger = %self.run.trigger,
            status = ?status,
            errors = self.run.errors.len(),
            "Pipeline run finished"
        );
        self.run
    }
}

/// Write a Run to the store, replacing any earlier record with the same id.
/// Failure is logged, never propagated.
pub async fn persist(store: &dyn Store, run: &PipelineRun) {
    if let Err(e) = store.append_log(run).await {
        warn!(run_id = %run.id, error = %e, "Failed to append run log");
    }
}
