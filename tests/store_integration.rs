use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use serde_json::{json, Map, Value};
use tempfile::TempDir;

use govdata_harness::config::{Config, DbConfig, PipelineConfig, SchedulerConfig, ServerConfig};
use govdata_harness::derive::{run_derivation, DeriveOptions};
use govdata_harness::models::{
    CanonicalRecord, EntityKind, NaturalKey, RunStatus, TriggerKind,
};
use govdata_harness::run_log::{self, RunLog};
use govdata_harness::sink::UpsertSink;
use govdata_harness::store::sqlite::SqliteStore;
use govdata_harness::store::{RecordFilter, Store};

fn test_config(tmp: &TempDir) -> Config {
    Config {
        db: DbConfig {
            path: tmp.path().join("data").join("gdh.sqlite"),
        },
        pipeline: PipelineConfig::default(),
        scheduler: SchedulerConfig::default(),
        server: ServerConfig::default(),
        sources: BTreeMap::new(),
    }
}

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn award(id: &str, recipient: &str, agency: &str, amount: f64) -> CanonicalRecord {
    CanonicalRecord {
        kind: EntityKind::Award,
        key: NaturalKey::new([id]).unwrap(),
        fields: fields(json!({
            "award_id": id,
            "recipient_name": recipient,
            "agency": agency,
            "amount": amount,
            "action_date": "2024-04-01",
        })),
        source: "awards".into(),
        source_updated_at: None,
        last_seen: Utc::now(),
    }
}

#[tokio::test]
async fn test_open_creates_database_and_is_repeatable() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);

    let store = SqliteStore::open(&cfg).await.unwrap();
    store.ping().await.unwrap();
    store.close().await;

    assert!(cfg.db.path.exists());
    let again = SqliteStore::open(&cfg).await.unwrap();
    assert_eq!(again.count(EntityKind::Award).await.unwrap(), 0);
    again.close().await;
}

#[tokio::test]
async fn test_upsert_is_idempotent_per_natural_key() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::open(&test_config(&tmp)).await.unwrap();

    let first = store.upsert(&award("A-1", "Acme", "DoD", 10.0)).await.unwrap();
    let second = store.upsert(&award("A-1", "Acme", "DoD", 25.0)).await.unwrap();

    assert!(first.was_new && first.applied);
    assert!(!second.was_new && second.applied);
    assert_eq!(store.count(EntityKind::Award).await.unwrap(), 1);

    let rows = store
        .query(EntityKind::Award, &RecordFilter::default())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].record.f64_field("amount"), Some(25.0));
    assert_eq!(rows[0].record.str_field("recipient_name"), Some("Acme"));
    assert!(rows[0].first_seen <= rows[0].record.last_seen);
}

#[tokio::test]
async fn test_older_upstream_version_does_not_overwrite() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::open(&test_config(&tmp)).await.unwrap();
    let newer = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let older = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    let mut current = award("A-1", "Acme", "DoD", 100.0);
    current.source_updated_at = Some(newer);
    store.upsert(&current).await.unwrap();

    let mut stale = award("A-1", "Acme", "DoD", 1.0);
    stale.source_updated_at = Some(older);
    stale.last_seen = Utc::now() + Duration::seconds(5);
    let result = store.upsert(&stale).await.unwrap();

    assert!(!result.applied);
    assert!(!result.was_new);
    let row = &store
        .query(EntityKind::Award, &RecordFilter::default())
        .await
        .unwrap()[0];
    assert_eq!(row.record.f64_field("amount"), Some(100.0));
    assert_eq!(row.record.source_updated_at, Some(newer));
    // Seeing the record again still counts as a sighting.
    assert_eq!(
        row.record.last_seen.timestamp_millis(),
        stale.last_seen.timestamp_millis()
    );
}

#[tokio::test]
async fn test_query_filters_by_key_and_source() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::open(&test_config(&tmp)).await.unwrap();
    store.upsert(&award("A-1", "Acme", "DoD", 1.0)).await.unwrap();
    let mut other = award("A-2", "Beta", "NASA", 2.0);
    other.source = "state_ca".into();
    store.upsert(&other).await.unwrap();

    let by_key = store
        .query(
            EntityKind::Award,
            &RecordFilter::key(NaturalKey::new(["A-2"]).unwrap()),
        )
        .await
        .unwrap();
    assert_eq!(by_key.len(), 1);
    assert_eq!(by_key[0].record.source, "state_ca");

    let by_source = store
        .query(
            EntityKind::Award,
            &RecordFilter {
                source: Some("awards".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(by_source.len(), 1);
    assert_eq!(by_source[0].record.key.render(), "A-1");

    assert!(store
        .query(EntityKind::Grant, &RecordFilter::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_keys_with_separator_in_parts_stay_distinct() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::open(&test_config(&tmp)).await.unwrap();
    let exclusion = |parts: [&str; 3]| CanonicalRecord {
        kind: EntityKind::Exclusion,
        key: NaturalKey::new(parts).unwrap(),
        fields: fields(json!({ "name": parts[0], "exclusion_type": parts[1] })),
        source: "exclusions".into(),
        source_updated_at: None,
        last_seen: Utc::now(),
    };
    let a = exclusion(["ACME|WEST", "Ineligible", "2024-01-02"]);
    let b = exclusion(["ACME", "WEST|Ineligible", "2024-01-02"]);

    assert!(store.upsert(&a).await.unwrap().was_new);
    assert!(store.upsert(&b).await.unwrap().was_new);
    assert_eq!(store.count(EntityKind::Exclusion).await.unwrap(), 2);

    let rows = store
        .query(EntityKind::Exclusion, &RecordFilter::key(b.key.clone()))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].record.key, b.key);
    assert_eq!(rows[0].record.str_field("exclusion_type"), Some("WEST|Ineligible"));
}

#[tokio::test]
async fn test_concurrent_sink_writes_count_new_once() {
    let tmp = TempDir::new().unwrap();
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&test_config(&tmp)).await.unwrap());
    let sink = UpsertSink::new(store.clone());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let sink = sink.clone();
        handles.push(tokio::spawn(async move {
            sink.apply(award("A-1", "Acme", "DoD", 5.0)).await
        }));
    }
    let mut new = 0;
    for h in handles {
        let outcome = h.await.unwrap();
        assert!(outcome.error.is_none(), "{:?}", outcome.error);
        if outcome.is_new {
            new += 1;
        }
    }

    assert_eq!(new, 1);
    assert_eq!(store.count(EntityKind::Award).await.unwrap(), 1);
}

#[tokio::test]
async fn test_full_derivation_cycle_on_sqlite() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::open(&test_config(&tmp)).await.unwrap();
    for i in 0..4 {
        store
            .upsert(&award(&format!("A-{}", i), "Acme Corp", "DoD", 1000.0))
            .await
            .unwrap();
    }
    store
        .upsert(&award("B-1", "Beta LLC", "NASA", 50.0))
        .await
        .unwrap();
    store
        .upsert(&CanonicalRecord {
            kind: EntityKind::Exclusion,
            key: NaturalKey::new(["BETA LLC", "Ineligible", "2023-05-01"]).unwrap(),
            fields: fields(json!({
                "name": "Beta LLC",
                "exclusion_type": "Ineligible",
                "activation_date": "2023-05-01",
            })),
            source: "exclusions".into(),
            source_updated_at: None,
            last_seen: Utc::now(),
        })
        .await
        .unwrap();

    let options = DeriveOptions::from_config(&PipelineConfig::default()).weekly();
    let result = run_derivation(&store, 0, &options).await;

    assert!(result.steps.iter().all(|s| s.ok), "{:?}", result.steps);
    assert_eq!(result.stats_resynced, Some(2));
    // Two funded-by edges plus one exclusion match.
    assert_eq!(result.relationships_discovered, Some(3));
    // Concentration for Acme, excluded recipient for Beta.
    assert_eq!(result.insights_generated, Some(2));
    assert_eq!(result.entities_scored, Some(2));
    assert_eq!(result.aggregates_refreshed, Some(2));
    assert_eq!(result.network_edges, Some(0));
    assert_eq!(result.quality_score, Some(100));

    let snapshot = store.latest_health().await.unwrap().unwrap();
    assert_eq!(Some(snapshot.id), result.health_snapshot_id);
    assert_eq!(snapshot.record_count, 6);

    // Derived tables are replaced, not appended to.
    let again = run_derivation(&store, 0, &options).await;
    assert_eq!(again.relationships_discovered, Some(3));
    assert_eq!(again.insights_generated, Some(2));
}

#[tokio::test]
async fn test_run_log_round_trip_newest_first() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::open(&test_config(&tmp)).await.unwrap();

    let daily = RunLog::start(TriggerKind::Daily).finish(RunStatus::Complete);
    run_log::persist(&store, &daily).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let manual = RunLog::start(TriggerKind::Manual).finish(RunStatus::Failed);
    run_log::persist(&store, &manual).await;

    let runs = store.recent_runs(10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].id, manual.id);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[1].trigger, TriggerKind::Daily);

    assert_eq!(store.recent_runs(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_running_run_is_updated_in_place_on_finish() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::open(&test_config(&tmp)).await.unwrap();

    let log = RunLog::start(TriggerKind::Weekly);
    run_log::persist(&store, log.current()).await;
    let runs = store.recent_runs(10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Running);

    let run = log.finish(RunStatus::Complete);
    run_log::persist(&store, &run).await;
    let runs = store.recent_runs(10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Complete);
    assert!(runs[0].finished_at.is_some());
}

#[tokio::test]
async fn test_unknown_procedure_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::open(&test_config(&tmp)).await.unwrap();
    assert!(store
        .call_procedure("drop_everything", &json!({}))
        .await
        .is_err());
}
