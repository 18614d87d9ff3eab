//! Corpus statistics and health overview.
//!
//! Summarizes what the store holds: record counts per entity kind and per
//! source, the latest health snapshot, and recent Runs. Used by `gdh stats`
//! and `gdh runs`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::config::Config;
use crate::models::EntityKind;
use crate::store::sqlite::SqliteStore;
use crate::store::Store;

/// Per-source breakdown of record counts.
struct SourceStats {
    source: String,
    kind: String,
    records: i64,
    last_seen_ms: Option<i64>,
}

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let store = SqliteStore::open(config).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("govdata-harness — Store Stats");
    println!("=============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();

    let mut total = 0u64;
    for kind in EntityKind::ALL {
        let n = store.count(kind).await?;
        total += n;
        println!("  {:<13}{}", format!("{}:", kind), n);
    }
    println!("  {:<13}{}", "total:", total);

    match store.latest_health().await? {
        Some(snapshot) => {
            println!();
            println!(
                "  Quality:     {} / 100 ({} records, {})",
                snapshot.quality_score,
                snapshot.record_count,
                format_relative(snapshot.captured_at)
            );
            for (kind, pct) in &snapshot.completeness {
                println!("    {:<12} {:>3}% complete", kind, pct);
            }
        }
        None => {
            println!();
            println!("  Quality:     no snapshot yet");
        }
    }

    let source_rows = sqlx::query(
        r#"
        SELECT source, kind, COUNT(*) AS records, MAX(last_seen) AS last_seen
        FROM records
        GROUP BY source, kind
        ORDER BY records DESC
        "#,
    )
    .fetch_all(store.pool())
    .await?;

    let source_stats: Vec<SourceStats> = source_rows
        .iter()
        .map(|row| SourceStats {
            source: row.get("source"),
            kind: row.get("kind"),
            records: row.get("records"),
            last_seen_ms: row.get("last_seen"),
        })
        .collect();

    if !source_stats.is_empty() {
        println!();
        println!("  By source:");
        println!(
            "  {:<24} {:<12} {:>8}   {}",
            "SOURCE", "KIND", "RECORDS", "LAST SEEN"
        );
        println!("  {}", "-".repeat(64));

        for s in &source_stats {
            let seen = s
                .last_seen_ms
                .and_then(DateTime::from_timestamp_millis)
                .map(format_relative)
                .unwrap_or_else(|| "never".to_string());
            println!(
                "  {:<24} {:<12} {:>8}   {}",
                s.source, s.kind, s.records, seen
            );
        }
    }

    println!();
    store.close().await;
    Ok(())
}

/// `gdh runs`: print the most recent Runs, newest first.
pub async fn run_runs(config: &Config, limit: usize) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let runs = store.recent_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs recorded.");
        store.close().await;
        return Ok(());
    }

    println!(
        "{:<36}  {:<7}  {:<8}  {:>7}  {:>6}  {:>7}  {}",
        "RUN", "TRIGGER", "STATUS", "LOADED", "ERRORS", "QUALITY", "STARTED"
    );
    for run in &runs {
        let loaded = run
            .ingestion
            .as_ref()
            .map(|i| i.total_loaded.to_string())
            .unwrap_or_else(|| "-".to_string());
        let quality = run
            .derivation
            .as_ref()
            .and_then(|d| d.quality_score)
            .map(|q| q.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36}  {:<7}  {:<8}  {:>7}  {:>6}  {:>7}  {}",
            run.id,
            run.trigger.as_str(),
            format!("{:?}", run.status).to_lowercase(),
            loaded,
            run.errors.len(),
            quality,
            format_relative(run.started_at)
        );
    }

    store.close().await;
    Ok(())
}

/// Human-readable file size, e.g. `2.0 KB`.
fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Age of `ts` in the largest whole unit, falling back to the date once it
/// is more than a month old or in the future.
fn format_relative(ts: DateTime<Utc>) -> String {
    let age = Utc::now() - ts;
    let secs = age.num_seconds();
    if !(0..86_400 * 30).contains(&secs) {
        return ts.format("%Y-%m-%d %H:%M").to_string();
    }
    let (n, unit) = match secs {
        0..=59 => return "just now".to_string(),
        60..=3_599 => (age.num_minutes(), "min"),
        3_600..=86_399 => (age.num_hours(), "hour"),
        _ => (age.num_days(), "day"),
    };
    format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn relative_times() {
        assert_eq!(format_relative(Utc::now()), "just now");
        assert_eq!(format_relative(Utc::now() - Duration::minutes(5)), "5 mins ago");
        assert_eq!(format_relative(Utc::now() - Duration::hours(1)), "1 hour ago");
        assert_eq!(format_bytes(2048), "2.0 KB");
    }
}
