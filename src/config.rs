use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{
    RateLimitSpec, SourceCategory, SourceDescriptor, SourceFamily, SourceKind, TimePeriod,
};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Global ceiling on concurrently running (source, partition) units.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Minimum new/updated records before the full derivation cycle runs.
    #[serde(default = "default_min_volume")]
    pub min_volume_threshold: u64,
    /// Hourly runs escalate to an audit pass below this quality score.
    #[serde(default = "default_health_threshold")]
    pub health_threshold: u8,
    /// Entities considered by the weekly deep network analysis.
    #[serde(default = "default_deep_top_n")]
    pub deep_top_n: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            min_volume_threshold: default_min_volume(),
            health_threshold: default_health_threshold(),
            deep_top_n: default_deep_top_n(),
        }
    }
}

fn default_concurrency() -> usize {
    16
}
fn default_min_volume() -> u64 {
    11
}
fn default_health_threshold() -> u8 {
    70
}
fn default_deep_top_n() -> usize {
    25
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub run_on_start: bool,
    #[serde(default = "default_hourly_secs")]
    pub hourly_secs: u64,
    #[serde(default = "default_daily_secs")]
    pub daily_secs: u64,
    #[serde(default = "default_weekly_secs")]
    pub weekly_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            run_on_start: true,
            hourly_secs: default_hourly_secs(),
            daily_secs: default_daily_secs(),
            weekly_secs: default_weekly_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_hourly_secs() -> u64 {
    60 * 60
}
fn default_daily_secs() -> u64 {
    24 * 60 * 60
}
fn default_weekly_secs() -> u64 {
    7 * 24 * 60 * 60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

/// One `[sources.<id>]` table.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Defaults to the category implied by `kind`.
    #[serde(default)]
    pub category: Option<SourceCategory>,
    /// Defaults to the family implied by the category.
    #[serde(default)]
    pub family: Option<SourceFamily>,
    pub base_url: String,
    #[serde(default)]
    pub partitions: Vec<String>,
    #[serde(default)]
    pub priority_partitions: Vec<String>,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_source_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default)]
    pub credential_env: Option<String>,
    /// Only honored by USAspending sources.
    #[serde(default)]
    pub time_period: Option<TimePeriod>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_delay_ms() -> u64 {
    250
}
fn default_max_in_flight() -> usize {
    1
}
fn default_source_timeout_secs() -> u64 {
    15
}
fn default_page_size() -> u32 {
    100
}
fn default_max_pages() -> u32 {
    10
}

fn default_category(kind: SourceKind) -> SourceCategory {
    match kind {
        SourceKind::UsaspendingAwards | SourceKind::StateContracts => SourceCategory::Contract,
        SourceKind::UsaspendingGrants => SourceCategory::Grant,
        SourceKind::GrantsGov | SourceKind::SamOpportunities => SourceCategory::Opportunity,
        SourceKind::SamEntities => SourceCategory::Entity,
        SourceKind::SamExclusions => SourceCategory::Exclusion,
        SourceKind::FederalRegister => SourceCategory::Regulatory,
    }
}

impl SourceConfig {
    /// Resolve this table into an immutable descriptor.
    pub fn descriptor(&self, id: &str) -> SourceDescriptor {
        let category = self.category.unwrap_or_else(|| default_category(self.kind));
        let family = self.family.unwrap_or_else(|| match self.kind {
            SourceKind::StateContracts => SourceFamily::States,
            _ => category.default_family(),
        });
        let partitions = if self.partitions.is_empty() {
            vec!["*".to_string()]
        } else {
            self.partitions.clone()
        };
        SourceDescriptor {
            id: id.to_string(),
            kind: self.kind,
            category,
            family,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            partitions,
            priority_partitions: self.priority_partitions.clone(),
            rate_limit: RateLimitSpec {
                delay: Duration::from_millis(self.delay_ms),
                max_in_flight: self.max_in_flight,
                timeout: Duration::from_secs(self.timeout_secs),
            },
            page_size: self.page_size,
            max_pages: self.max_pages,
            credential_env: self.credential_env.clone(),
            time_period: self.time_period,
        }
    }
}

impl Config {
    /// Descriptors for every enabled source, in id order.
    pub fn descriptors(&self) -> Vec<SourceDescriptor> {
        self.sources
            .iter()
            .filter(|(_, cfg)| cfg.enabled)
            .map(|(id, cfg)| cfg.descriptor(id))
            .collect()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.pipeline.concurrency == 0 {
        bail!("pipeline.concurrency must be > 0");
    }
    if config.pipeline.health_threshold > 100 {
        bail!("pipeline.health_threshold must be in [0, 100]");
    }
    if config.pipeline.deep_top_n < 2 {
        bail!("pipeline.deep_top_n must be >= 2");
    }

    let sched = &config.scheduler;
    if sched.hourly_secs == 0 || sched.daily_secs == 0 || sched.weekly_secs == 0 {
        bail!("scheduler intervals must be > 0");
    }

    for (id, src) in &config.sources {
        if id.contains('|') || id.trim().is_empty() {
            bail!("source id '{}' must be non-empty and must not contain '|'", id);
        }
        if src.base_url.trim().is_empty() {
            bail!("sources.{}.base_url must not be empty", id);
        }
        if src.max_in_flight == 0 {
            bail!("sources.{}.max_in_flight must be > 0", id);
        }
        if src.timeout_secs == 0 {
            bail!("sources.{}.timeout_secs must be > 0", id);
        }
        if src.page_size == 0 || src.max_pages == 0 {
            bail!("sources.{}.page_size and max_pages must be > 0", id);
        }
        if let Some(period) = &src.time_period {
            if period.start_date > period.end_date {
                bail!("sources.{}.time_period starts after it ends", id);
            }
        }
        for p in &src.priority_partitions {
            if !src.partitions.contains(p) {
                bail!(
                    "sources.{}.priority_partitions contains '{}' which is not in partitions",
                    id,
                    p
                );
            }
        }
    }

    Ok(())
}
