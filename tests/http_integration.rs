use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};

use govdata_harness::config::{Config, DbConfig, PipelineConfig, SchedulerConfig, ServerConfig};
use govdata_harness::connector::{Connector, ConnectorRegistry};
use govdata_harness::connector_http::HttpConnector;
use govdata_harness::error::FetchError;
use govdata_harness::models::{
    Cursor, EntityKind, RateLimitSpec, SourceCategory, SourceDescriptor, SourceFamily, SourceKind,
};
use govdata_harness::scheduler::Scheduler;
use govdata_harness::server;
use govdata_harness::store::memory::InMemoryStore;
use govdata_harness::store::Store;

const KEY_VAR: &str = "GDH_TEST_STATE_PORTAL_KEY";

// ─── Fake upstream ──────────────────────────────────────────────────

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

async fn serve(app: Router) -> u16 {
    let port = find_free_port();
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    wait_for_server(port).await;
    port
}

async fn documents(
    State(port): State<u16>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let page = params.get("page").map(String::as_str).unwrap_or("1");
    if page == "1" {
        Json(json!({
            "count": 3,
            "results": [
                { "document_number": "2024-00001", "title": "Rule one", "publication_date": "2024-01-02",
                  "agencies": [{ "name": "Defense Department" }] },
                { "document_number": "2024-00002", "title": "Rule two", "publication_date": "2024-01-03" },
            ],
            "next_page_url": format!("http://127.0.0.1:{}/documents.json?page=2&per_page=2", port),
        }))
    } else {
        Json(json!({
            "count": 3,
            "results": [
                { "document_number": "2024-00003", "title": "Rule three", "publication_date": "2024-01-04" },
            ],
        }))
    }
}

async fn contracts(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    if params.get("api_key").map(String::as_str) != Some("s3cret") {
        return (StatusCode::UNAUTHORIZED, "missing key").into_response();
    }
    let page: u32 = params.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
    let state = params.get("state").cloned().unwrap_or_else(|| "NY".to_string());
    let records: Vec<Value> = (0..3)
        .map(|i| {
            json!({
                "state": state.to_lowercase(),
                "contract_id": format!("P{}-{}", page, i),
                "vendor_name": "Acme Corp",
                "agency": "Transportation",
                "amount": "$1,500.00",
                "award_date": "2024-03-01",
            })
        })
        .collect();
    Json(json!({ "records": records, "has_more": page < 2 })).into_response()
}

async fn start_upstream() -> u16 {
    let port = find_free_port();
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/documents.json", get(documents))
        .route("/contracts", get(contracts))
        .route(
            "/limited/contracts",
            get(|| async { StatusCode::TOO_MANY_REQUESTS }),
        )
        .route(
            "/broken/contracts",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "database on fire") }),
        )
        .route("/garbled/contracts", get(|| async { "<html>not json</html>" }))
        .route(
            "/slow/contracts",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({ "records": [] }))
            }),
        )
        .with_state(port);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    wait_for_server(port).await;
    port
}

fn descriptor(id: &str, kind: SourceKind, base_url: String, partitions: &[&str]) -> SourceDescriptor {
    let (category, family, credential_env) = match kind {
        SourceKind::StateContracts => (
            SourceCategory::Contract,
            SourceFamily::States,
            Some(KEY_VAR.to_string()),
        ),
        _ => (SourceCategory::Regulatory, SourceFamily::Reference, None),
    };
    SourceDescriptor {
        id: id.to_string(),
        kind,
        category,
        family,
        base_url,
        partitions: partitions.iter().map(|s| s.to_string()).collect(),
        priority_partitions: vec![],
        rate_limit: RateLimitSpec {
            delay: Duration::from_millis(10),
            max_in_flight: 2,
            timeout: Duration::from_millis(500),
        },
        page_size: 2,
        max_pages: 5,
        credential_env,
        time_period: None,
    }
}

fn set_key() {
    std::env::set_var(KEY_VAR, "s3cret");
}

// ─── HttpConnector ──────────────────────────────────────────────────

#[tokio::test]
async fn test_follows_next_page_urls() {
    let port = start_upstream().await;
    let connector = HttpConnector::new(descriptor(
        "fr",
        SourceKind::FederalRegister,
        format!("http://127.0.0.1:{}", port),
        &["*"],
    ))
    .unwrap();

    let first = connector.fetch("*", &Cursor::Start).await.unwrap();
    assert_eq!(first.records.len(), 2);
    let Some(next) = first.next else {
        panic!("first page should link to the next one");
    };
    assert!(matches!(&next, Cursor::Page(url) if url.contains("page=2")));

    let second = connector.fetch("*", &next).await.unwrap();
    assert_eq!(second.records.len(), 1);
    assert!(second.next.is_none());

    let mapped = connector.map(&first.records[0]).unwrap();
    assert_eq!(mapped.kind, EntityKind::Regulation);
    assert_eq!(mapped.key.render(), "2024-00001");
    assert_eq!(mapped.str_field("agency"), Some("Defense Department"));
}

#[tokio::test]
async fn test_sends_credential_and_pages_by_flag() {
    set_key();
    let port = start_upstream().await;
    let connector = HttpConnector::new(descriptor(
        "states",
        SourceKind::StateContracts,
        format!("http://127.0.0.1:{}", port),
        &["TX"],
    ))
    .unwrap();
    assert!(connector.preflight().is_ok());

    let first = connector.fetch("TX", &Cursor::Start).await.unwrap();
    assert_eq!(first.records.len(), 3);
    assert_eq!(first.next, Some(Cursor::Page("2".into())));

    let second = connector.fetch("TX", &Cursor::Page("2".into())).await.unwrap();
    assert!(second.next.is_none());

    let mapped = connector.map(&second.records[0]).unwrap();
    assert_eq!(mapped.key.render(), "TX|P2-0");
    assert_eq!(mapped.f64_field("amount"), Some(1500.0));
    assert_eq!(mapped.source, "states");
}

#[tokio::test]
async fn test_upstream_failures_map_to_fetch_errors() {
    set_key();
    let port = start_upstream().await;
    let fetch = |prefix: &str| {
        let connector = HttpConnector::new(descriptor(
            "states",
            SourceKind::StateContracts,
            format!("http://127.0.0.1:{}/{}", port, prefix),
            &["*"],
        ))
        .unwrap();
        async move { connector.fetch("*", &Cursor::Start).await }
    };

    assert!(matches!(fetch("limited").await, Err(FetchError::RateLimited)));
    match fetch("broken").await {
        Err(FetchError::Status { status, message }) => {
            assert_eq!(status, 500);
            assert!(message.contains("database on fire"));
        }
        other => panic!("expected status error, got {:?}", other.map(|p| p.records.len())),
    }
    assert!(matches!(fetch("garbled").await, Err(FetchError::Malformed(_))));
    assert!(matches!(fetch("slow").await, Err(FetchError::Timeout { ms: 500 })));
}

#[tokio::test]
async fn test_missing_credential_fails_preflight() {
    let connector = HttpConnector::new(SourceDescriptor {
        credential_env: Some("GDH_TEST_KEY_THAT_IS_NEVER_SET".into()),
        time_period: None,
        ..descriptor(
            "states",
            SourceKind::StateContracts,
            "http://127.0.0.1:9".into(),
            &["*"],
        )
    })
    .unwrap();

    let err = connector.preflight().unwrap_err();
    assert!(err.contains("GDH_TEST_KEY_THAT_IS_NEVER_SET"));
}

// ─── HTTP trigger ───────────────────────────────────────────────────

fn test_config() -> Config {
    Config {
        db: DbConfig {
            path: PathBuf::from("unused.sqlite"),
        },
        pipeline: PipelineConfig::default(),
        scheduler: SchedulerConfig::default(),
        server: ServerConfig::default(),
        sources: BTreeMap::new(),
    }
}

async fn start_gdh(upstream: u16, store: Arc<InMemoryStore>) -> u16 {
    set_key();
    let mut registry = ConnectorRegistry::new();
    registry.register(Arc::new(
        HttpConnector::new(descriptor(
            "states",
            SourceKind::StateContracts,
            format!("http://127.0.0.1:{}", upstream),
            &["CA", "TX"],
        ))
        .unwrap(),
    ));
    registry.register(Arc::new(
        HttpConnector::new(descriptor(
            "fr",
            SourceKind::FederalRegister,
            format!("http://127.0.0.1:{}", upstream),
            &["*"],
        ))
        .unwrap(),
    ));
    let scheduler = Arc::new(Scheduler::new(Arc::new(registry), store, &test_config()));
    serve(server::router(scheduler)).await
}

#[tokio::test]
async fn test_post_ingest_runs_pipeline() {
    let upstream = start_upstream().await;
    let store = Arc::new(InMemoryStore::new());
    let port = start_gdh(upstream, store.clone()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://127.0.0.1:{}/ingest", port))
        .json(&json!({ "contracts": false, "unknown_option": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();

    // 2 states × 2 pages × 3 records, plus 3 regulations.
    assert_eq!(body["total_loaded"], 15);
    assert_eq!(body["total_new"], 15);
    assert!(body["run_id"].is_string());
    assert_eq!(body["errors"].as_array().unwrap().len(), 0);
    assert_eq!(body["per_source"]["states"]["attempted"], 2);
    assert_eq!(body["derivation"]["below_threshold"], false);
    assert!(body["derivation"]["quality_score"].is_u64());

    assert_eq!(store.count(EntityKind::Award).await.unwrap(), 12);
    assert_eq!(store.count(EntityKind::Regulation).await.unwrap(), 3);

    let runs: Value = client
        .get(format!("http://127.0.0.1:{}/runs?limit=5", port))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(runs["runs"].as_array().unwrap().len(), 1);
    assert_eq!(runs["runs"][0]["trigger"], "manual");
    assert_eq!(runs["runs"][0]["status"], "complete");

    let health: Value = client
        .get(format!("http://127.0.0.1:{}/health", port))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert!(health["quality_score"].is_u64());
}

#[tokio::test]
async fn test_post_ingest_with_empty_body_uses_defaults() {
    let upstream = start_upstream().await;
    let store = Arc::new(InMemoryStore::new());
    let port = start_gdh(upstream, store.clone()).await;

    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/ingest", port))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["total_loaded"], 15);
}

#[tokio::test]
async fn test_post_ingest_rejects_malformed_body() {
    let upstream = start_upstream().await;
    let port = start_gdh(upstream, Arc::new(InMemoryStore::new())).await;

    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/ingest", port))
        .header("content-type", "application/json")
        .body("{ not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_post_ingest_with_unreachable_store_is_500() {
    let upstream = start_upstream().await;
    let store = Arc::new(InMemoryStore::new());
    store.set_reachable(false);
    let port = start_gdh(upstream, store.clone()).await;

    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/ingest", port))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "setup_failed");

    let runs = store.recent_runs(1).await.unwrap();
    assert_eq!(runs.len(), 1);
}

#[tokio::test]
async fn test_sources_endpoint_lists_registry() {
    let upstream = start_upstream().await;
    let port = start_gdh(upstream, Arc::new(InMemoryStore::new())).await;

    let body: Value = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{}/sources", port))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let sources = body["sources"].as_array().unwrap();
    assert_eq!(sources.len(), 2);
    let fr = sources.iter().find(|s| s["id"] == "fr").unwrap();
    assert_eq!(fr["credential"], "not_required");
    assert_eq!(fr["kind"], "federal_register");
}
