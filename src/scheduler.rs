//! Recurring Run scheduler.
//!
//! Four cadences, each with its own exclusivity token:
//!
//! | Cadence | Work |
//! |---------|------|
//! | hourly | health snapshot; below the threshold, audit cleanup plus a fresh snapshot |
//! | daily | ingestion, then the full derivation cycle |
//! | weekly | ingestion, then the deep derivation cycle with aggregate refresh |
//! | manual | ingestion with the caller's [`RunOptions`], then the full cycle |
//!
//! A trigger for a cadence that is already running is skipped on the spot,
//! never queued. Different cadences may overlap. Every trigger builds a fresh
//! [`PipelineRun`] and appends it to the store's run log.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{error, info};

use crate::config::{Config, PipelineConfig, SchedulerConfig};
use crate::connector::ConnectorRegistry;
use crate::derive::{self, DeriveOptions};
use crate::ingest::{self, IngestOptions, PartitionPlan};
use crate::models::{DerivationCycleResult, RunOptions, RunStatus, TriggerKind};
use crate::procedures::Procedure;
use crate::run_log::{self, Phase, PipelineRun, RunLog};
use crate::store::Store;

/// Set of cadences with a Run in progress.
#[derive(Clone, Default)]
pub struct CadenceLocks {
    held: Arc<Mutex<HashSet<TriggerKind>>>,
}

impl CadenceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the token for `kind`, or `None` if a Run of that cadence holds it.
    pub fn try_acquire(&self, kind: TriggerKind) -> Option<CadenceGuard> {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        if !held.insert(kind) {
            return None;
        }
        Some(CadenceGuard {
            kind,
            held: self.held.clone(),
        })
    }

    pub fn is_running(&self, kind: TriggerKind) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(&kind))
            .unwrap_or(false)
    }
}

/// Exclusivity token for one cadence. Released on drop.
pub struct CadenceGuard {
    kind: TriggerKind,
    held: Arc<Mutex<HashSet<TriggerKind>>>,
}

impl Drop for CadenceGuard {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        held.remove(&self.kind);
    }
}

#[derive(Debug)]
pub enum TriggerOutcome {
    Completed(PipelineRun),
    /// The cadence was already running; nothing was done.
    Skipped(TriggerKind),
}

pub struct Scheduler {
    registry: Arc<ConnectorRegistry>,
    store: Arc<dyn Store>,
    pipeline: PipelineConfig,
    schedule: SchedulerConfig,
    locks: CadenceLocks,
}

impl Scheduler {
    pub fn new(registry: Arc<ConnectorRegistry>, store: Arc<dyn Store>, config: &Config) -> Self {
        Self {
            registry,
            store,
            pipeline: config.pipeline.clone(),
            schedule: config.scheduler.clone(),
            locks: CadenceLocks::new(),
        }
    }

    pub fn locks(&self) -> &CadenceLocks {
        &self.locks
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ConnectorRegistry> {
        &self.registry
    }

    /// Run one cadence now, unless it is already running.
    ///
    /// `options` only applies to the manual cadence; scheduled cadences use
    /// the defaults. Fails only when the store cannot be reached; the failed
    /// Run is still logged.
    pub async fn trigger(&self, kind: TriggerKind, options: RunOptions) -> Result<TriggerOutcome> {
        let Some(_guard) = self.locks.try_acquire(kind) else {
            info!(trigger = %kind, "Run already in progress, skipping trigger");
            return Ok(TriggerOutcome::Skipped(kind));
        };

        let mut log = RunLog::start(kind);
        run_log::persist(self.store.as_ref(), log.current()).await;
        let outcome = match kind {
            TriggerKind::Hourly => {
                self.health_check(&mut log).await;
                Ok(())
            }
            TriggerKind::Daily => {
                let derive = DeriveOptions::from_config(&self.pipeline);
                self.ingest_and_derive(&mut log, &RunOptions::default(), false, &derive)
                    .await
            }
            TriggerKind::Weekly => {
                let derive = DeriveOptions::from_config(&self.pipeline).weekly();
                self.ingest_and_derive(&mut log, &RunOptions::default(), false, &derive)
                    .await
            }
            TriggerKind::Manual => {
                let derive = DeriveOptions::from_config(&self.pipeline);
                self.ingest_and_derive(&mut log, &options, true, &derive).await
            }
        };

        match outcome {
            Ok(()) => {
                let run = log.finish(RunStatus::Complete);
                run_log::persist(self.store.as_ref(), &run).await;
                Ok(TriggerOutcome::Completed(run))
            }
            Err(e) => {
                error!(trigger = %kind, error = %e, "Run failed");
                let run = log.finish(RunStatus::Failed);
                run_log::persist(self.store.as_ref(), &run).await;
                Err(e)
            }
        }
    }

    async fn ingest_and_derive(
        &self,
        log: &mut RunLog,
        options: &RunOptions,
        maintenance: bool,
        derive_options: &DeriveOptions,
    ) -> Result<()> {
        let plan = PartitionPlan::from_descriptors(&self.registry.descriptors(), options);
        let ingest_options = IngestOptions {
            maintenance,
            concurrency: self.pipeline.concurrency,
        };

        let started = Utc::now();
        let ingestion =
            ingest::run_ingestion(&self.registry, self.store.clone(), &plan, &ingest_options)
                .await;
        let ingestion = match ingestion {
            Ok(result) => result,
            Err(e) => {
                log.phase(Phase::Ingestion, started, false, json!({ "error": e.to_string() }));
                return Err(e);
            }
        };
        log.phase(
            Phase::Ingestion,
            started,
            true,
            json!({
                "loaded": ingestion.total_loaded,
                "new": ingestion.total_new,
                "errors": ingestion.errors.len(),
            }),
        );
        let ingested = ingestion.total_loaded;
        log.record_ingestion(ingestion);

        let started = Utc::now();
        let derivation = derive::run_derivation(self.store.as_ref(), ingested, derive_options).await;
        log.phase(
            Phase::Derivation,
            started,
            derivation.steps.iter().all(|s| s.ok),
            json!({
                "below_threshold": derivation.below_threshold,
                "steps": derivation.steps.len(),
                "quality_score": derivation.quality_score,
            }),
        );
        for err in derive::step_errors(&derivation.steps) {
            log.push_error(err);
        }
        log.record_derivation(derivation);
        Ok(())
    }

    /// Hourly: snapshot, and escalate to an audit pass when quality is low.
    async fn health_check(&self, log: &mut RunLog) {
        let mut cycle = DerivationCycleResult {
            below_threshold: true,
            ..Default::default()
        };

        let started = Utc::now();
        let step = derive::capture_health(self.store.as_ref(), &mut cycle).await;
        log.phase(
            Phase::HealthCheck,
            started,
            step.ok,
            json!({ "quality_score": cycle.quality_score }),
        );
        cycle.steps.push(step);

        let threshold = self.pipeline.health_threshold;
        let low = matches!(cycle.quality_score, Some(score) if score < threshold);
        if low {
            info!(
                quality_score = ?cycle.quality_score,
                threshold,
                "Quality below threshold, escalating to audit cleanup"
            );
            log.mark_escalated();

            let started = Utc::now();
            let audit =
                ingest::run_step(self.store.as_ref(), Procedure::AuditCleanup.name(), &json!({}))
                    .await;
            log.phase(
                Phase::AuditCleanup,
                started,
                audit.ok,
                json!({ "removed": audit.affected }),
            );
            cycle.steps.push(audit);

            let step = derive::capture_health(self.store.as_ref(), &mut cycle).await;
            cycle.steps.push(step);
        }

        for err in derive::step_errors(&cycle.steps) {
            log.push_error(err);
        }
        log.record_derivation(cycle);
    }

    fn spawn(self: &Arc<Self>, kind: TriggerKind) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.trigger(kind, RunOptions::default()).await {
                error!(trigger = %kind, error = %e, "Scheduled run failed");
            }
        });
    }

    /// Drive the cadences until ctrl-c.
    pub async fn run_forever(self: Arc<Self>) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Drive the cadences until `shutdown` resolves. Runs in progress are
    /// left to finish on their own tasks.
    pub async fn run_until<F>(self: Arc<Self>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut hourly = every(self.schedule.hourly_secs);
        let mut daily = every(self.schedule.daily_secs);
        let mut weekly = every(self.schedule.weekly_secs);

        info!(
            hourly_secs = self.schedule.hourly_secs,
            daily_secs = self.schedule.daily_secs,
            weekly_secs = self.schedule.weekly_secs,
            run_on_start = self.schedule.run_on_start,
            "Scheduler started"
        );
        if self.schedule.run_on_start {
            self.spawn(TriggerKind::Daily);
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = hourly.tick() => self.spawn(TriggerKind::Hourly),
                _ = daily.tick() => self.spawn(TriggerKind::Daily),
                _ = weekly.tick() => self.spawn(TriggerKind::Weekly),
                _ = &mut shutdown => {
                    info!("Shutdown signal received, scheduler stopping");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Interval whose first tick is one full period from now.
fn every(secs: u64) -> Interval {
    let period = Duration::from_secs(secs.max(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// `gdh schedule`: run the scheduler against the configured sources.
pub async fn run_schedule(config: &Config, store: Arc<dyn Store>) -> Result<()> {
    let registry = Arc::new(ConnectorRegistry::from_config(config)?);
    let scheduler = Arc::new(Scheduler::new(registry, store, config));
    scheduler.run_forever().await
}
