//! Configured sources and their readiness.
//!
//! Used by `gdh sources` and `GET /sources`.

use anyhow::Result;
use serde::Serialize;

use crate::config::Config;
use crate::models::{SourceCategory, SourceDescriptor, SourceFamily, SourceKind};

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub id: String,
    pub kind: SourceKind,
    pub category: SourceCategory,
    pub family: SourceFamily,
    pub partitions: usize,
    /// `not_required`, `present`, or `missing`.
    pub credential: &'static str,
    pub ready: bool,
}

pub fn source_status(descriptor: &SourceDescriptor) -> SourceStatus {
    let credential = match &descriptor.credential_env {
        None => "not_required",
        Some(var) => match std::env::var(var) {
            Ok(v) if !v.trim().is_empty() => "present",
            _ => "missing",
        },
    };
    SourceStatus {
        id: descriptor.id.clone(),
        kind: descriptor.kind,
        category: descriptor.category,
        family: descriptor.family,
        partitions: descriptor.partitions.len(),
        credential,
        ready: credential != "missing",
    }
}

pub fn get_sources(descriptors: &[SourceDescriptor]) -> Vec<SourceStatus> {
    descriptors.iter().map(source_status).collect()
}

pub fn list_sources(config: &Config) -> Result<()> {
    let sources = get_sources(&config.descriptors());
    if sources.is_empty() {
        println!("No sources configured.");
        return Ok(());
    }

    println!(
        "{:<24} {:<20} {:<14} {:>10}  {:<13} READY",
        "SOURCE", "KIND", "FAMILY", "PARTITIONS", "CREDENTIAL"
    );
    for s in &sources {
        println!(
            "{:<24} {:<20} {:<14} {:>10}  {:<13} {}",
            s.id,
            s.kind.as_str(),
            format!("{:?}", s.family).to_lowercase(),
            s.partitions,
            s.credential,
            s.ready
        );
    }
    Ok(())
}
