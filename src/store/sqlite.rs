//! SQLite-backed [`Store`] implementation.
//!
//! Records live in a single `records` table keyed by `(kind, natural_key)`
//! with the normalized fields as JSON. Derived tables are owned by the
//! procedures in [`crate::procedures`] and are replaced wholesale inside a
//! transaction each time a procedure runs.
//!
//! Timestamps are stored as Unix milliseconds.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::models::{CanonicalRecord, EntityKind, HealthSnapshot, NaturalKey, StoredRecord};
use crate::procedures::{
    self, AgencyTotal, DerivedStore, EntityScore, EntityStat, Insight, Relationship,
};
use crate::run_log::PipelineRun;

use super::{RecordFilter, Store, StoreUpsert};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and make sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {}", ms))
}

#[async_trait]
impl Store for SqliteStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("store ping failed")?;
        Ok(())
    }

    async fn upsert(&self, record: &CanonicalRecord) -> Result<StoreUpsert> {
        let kind = record.kind.as_str();
        let key = record.key.encode();
        let fields_json = serde_json::to_string(&record.fields)?;
        let updated = record.source_updated_at.map(millis);
        let seen = millis(record.last_seen);

        // Insert first so newness is decided by the primary key, not a prior read.
        let inserted = sqlx::query(
            r#"
            INSERT INTO records (kind, natural_key, source, fields_json, source_updated_at, first_seen, last_seen)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(kind, natural_key) DO NOTHING
            "#,
        )
        .bind(kind)
        .bind(&key)
        .bind(&record.source)
        .bind(&fields_json)
        .bind(updated)
        .bind(seen)
        .bind(seen)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(StoreUpsert {
                applied: true,
                was_new: true,
            });
        }

        // Same rule as `should_overwrite`: an older upstream timestamp never wins.
        let overwritten = sqlx::query(
            r#"
            UPDATE records SET
                source = ?,
                fields_json = ?,
                source_updated_at = ?,
                last_seen = MAX(last_seen, ?)
            WHERE kind = ? AND natural_key = ?
              AND (? IS NULL OR source_updated_at IS NULL OR source_updated_at <= ?)
            "#,
        )
        .bind(&record.source)
        .bind(&fields_json)
        .bind(updated)
        .bind(seen)
        .bind(kind)
        .bind(&key)
        .bind(updated)
        .bind(updated)
        .execute(&self.pool)
        .await?;

        if overwritten.rows_affected() == 1 {
            return Ok(StoreUpsert {
                applied: true,
                was_new: false,
            });
        }

        sqlx::query(
            "UPDATE records SET last_seen = MAX(last_seen, ?) WHERE kind = ? AND natural_key = ?",
        )
        .bind(seen)
        .bind(kind)
        .bind(&key)
        .execute(&self.pool)
        .await?;

        Ok(StoreUpsert {
            applied: false,
            was_new: false,
        })
    }

    async fn query(&self, kind: EntityKind, filter: &RecordFilter) -> Result<Vec<StoredRecord>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT natural_key, source, fields_json, source_updated_at, first_seen, last_seen \
             FROM records WHERE kind = ",
        );
        qb.push_bind(kind.as_str());
        if let Some(key) = &filter.key {
            qb.push(" AND natural_key = ").push_bind(key.encode());
        }
        if let Some(source) = &filter.source {
            qb.push(" AND source = ").push_bind(source.clone());
        }
        if let Some(since) = filter.seen_since {
            qb.push(" AND last_seen >= ").push_bind(millis(since));
        }
        qb.push(" ORDER BY natural_key");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let rendered: String = row.get("natural_key");
            let key = NaturalKey::decode(&rendered)
                .ok_or_else(|| anyhow!("stored natural key is not a JSON array of parts: {:?}", rendered))?;
            let fields_json: String = row.get("fields_json");
            let fields: Map<String, Value> = serde_json::from_str(&fields_json)
                .with_context(|| format!("corrupt fields_json for {}", rendered))?;
            let source_updated_at: Option<i64> = row.get("source_updated_at");

            out.push(StoredRecord {
                record: CanonicalRecord {
                    kind,
                    key,
                    fields,
                    source: row.get("source"),
                    source_updated_at: source_updated_at.map(from_millis).transpose()?,
                    last_seen: from_millis(row.get("last_seen"))?,
                },
                first_seen: from_millis(row.get("first_seen"))?,
            });
        }
        Ok(out)
    }

    async fn count(&self, kind: EntityKind) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE kind = ?")
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    async fn call_procedure(&self, name: &str, args: &Value) -> Result<Value> {
        procedures::execute(self, name, args).await
    }

    async fn append_log(&self, run: &PipelineRun) -> Result<()> {
        let run_json = serde_json::to_string(run)?;
        let status = serde_json::to_value(run.status)?;
        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (id, trigger_kind, status, started_at, finished_at, run_json)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                finished_at = excluded.finished_at,
                run_json = excluded.run_json
            "#,
        )
        .bind(&run.id)
        .bind(run.trigger.as_str())
        .bind(status.as_str().unwrap_or("unknown"))
        .bind(millis(run.started_at))
        .bind(run.finished_at.map(millis))
        .bind(&run_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<PipelineRun>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT run_json FROM pipeline_runs ORDER BY started_at DESC, rowid DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|json| serde_json::from_str(json).context("corrupt run_json"))
            .collect()
    }

    async fn latest_health(&self) -> Result<Option<HealthSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT id, quality_score, record_count, completeness_json, captured_at
            FROM health_snapshots
            ORDER BY captured_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let completeness_json: String = row.get("completeness_json");
        let score: i64 = row.get("quality_score");
        let record_count: i64 = row.get("record_count");
        Ok(Some(HealthSnapshot {
            id: row.get("id"),
            quality_score: score.clamp(0, 100) as u8,
            record_count: record_count as u64,
            completeness: serde_json::from_str(&completeness_json)?,
            captured_at: from_millis(row.get("captured_at"))?,
        }))
    }
}

#[async_trait]
impl DerivedStore for SqliteStore {
    async fn entity_stats(&self) -> Result<Vec<EntityStat>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT stat_json FROM entity_stats ORDER BY recipient_key")
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|json| serde_json::from_str(json).context("corrupt stat_json"))
            .collect()
    }

    async fn replace_entity_stats(&self, stats: &[EntityStat]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM entity_stats")
            .execute(&mut *tx)
            .await?;
        for stat in stats {
            sqlx::query("INSERT INTO entity_stats (recipient_key, stat_json) VALUES (?, ?)")
                .bind(&stat.recipient_key)
                .bind(serde_json::to_string(stat)?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn relationships(&self) -> Result<Vec<Relationship>> {
        let rows = sqlx::query(
            "SELECT kind, from_key, to_key, weight, count FROM relationships ORDER BY kind, from_key, to_key",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let count: i64 = row.get("count");
                Relationship {
                    kind: row.get("kind"),
                    from: row.get("from_key"),
                    to: row.get("to_key"),
                    weight: row.get("weight"),
                    count: count as u64,
                }
            })
            .collect())
    }

    async fn replace_relationships(&self, kinds: &[&str], edges: &[Relationship]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for kind in kinds {
            sqlx::query("DELETE FROM relationships WHERE kind = ?")
                .bind(*kind)
                .execute(&mut *tx)
                .await?;
        }
        for edge in edges {
            sqlx::query(
                r#"
                INSERT INTO relationships (kind, from_key, to_key, weight, count)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(kind, from_key, to_key) DO UPDATE SET
                    weight = excluded.weight,
                    count = excluded.count
                "#,
            )
            .bind(&edge.kind)
            .bind(&edge.from)
            .bind(&edge.to)
            .bind(edge.weight)
            .bind(edge.count as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insights(&self) -> Result<Vec<Insight>> {
        let rows =
            sqlx::query("SELECT kind, subject, detail, created_at FROM insights ORDER BY kind, subject")
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|row| {
                Ok(Insight {
                    kind: row.get("kind"),
                    subject: row.get("subject"),
                    detail: row.get("detail"),
                    created_at: from_millis(row.get("created_at"))?,
                })
            })
            .collect()
    }

    async fn replace_insights(&self, insights: &[Insight]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM insights").execute(&mut *tx).await?;
        for insight in insights {
            sqlx::query(
                r#"
                INSERT INTO insights (kind, subject, detail, created_at) VALUES (?, ?, ?, ?)
                ON CONFLICT(kind, subject) DO UPDATE SET detail = excluded.detail
                "#,
            )
            .bind(&insight.kind)
            .bind(&insight.subject)
            .bind(&insight.detail)
            .bind(millis(insight.created_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn scores(&self) -> Result<Vec<EntityScore>> {
        let rows = sqlx::query("SELECT recipient_key, score FROM entity_scores ORDER BY recipient_key")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let score: i64 = row.get("score");
                EntityScore {
                    recipient_key: row.get("recipient_key"),
                    score: score.clamp(0, 100) as u8,
                }
            })
            .collect())
    }

    async fn replace_scores(&self, scores: &[EntityScore]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM entity_scores")
            .execute(&mut *tx)
            .await?;
        for score in scores {
            sqlx::query("INSERT INTO entity_scores (recipient_key, score) VALUES (?, ?)")
                .bind(&score.recipient_key)
                .bind(score.score as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn replace_aggregates(&self, totals: &[AgencyTotal]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM agency_totals")
            .execute(&mut *tx)
            .await?;
        for total in totals {
            sqlx::query(
                "INSERT INTO agency_totals (agency, record_count, total_value) VALUES (?, ?, ?)",
            )
            .bind(&total.agency)
            .bind(total.record_count as i64)
            .bind(total.total_value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_health(&self, snapshot: &HealthSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO health_snapshots (id, quality_score, record_count, completeness_json, captured_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.id)
        .bind(snapshot.quality_score as i64)
        .bind(snapshot.record_count as i64)
        .bind(serde_json::to_string(&snapshot.completeness)?)
        .bind(millis(snapshot.captured_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
