//! HTTP trigger and read API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ingest` | Run the manual cadence with a [`RunOptions`] body |
//! | `GET`  | `/runs?limit=` | Recent Runs, newest first |
//! | `GET`  | `/sources` | Configured sources and credential status |
//! | `GET`  | `/health` | Health check (returns version and latest quality score) |
//!
//! `POST /ingest` always answers 200 once the Run settles, with every soft
//! failure listed in `errors`. A trigger that lands while a manual Run is in
//! progress answers 200 with `{"skipped": true}`. Only a setup failure (the
//! store cannot be reached) answers 500.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "invalid run options: ..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `setup_failed` (500), `internal` (500).

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::connector::ConnectorRegistry;
use crate::models::{DerivationCycleResult, IngestionRunResult, RunOptions, TriggerKind};
use crate::run_log::PipelineRun;
use crate::scheduler::{Scheduler, TriggerOutcome};
use crate::sources::{get_sources, SourceStatus};
use crate::store::sqlite::SqliteStore;
use crate::store::Store;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    scheduler: Arc<Scheduler>,
}

/// Build the router. Exposed so tests can serve it on an ephemeral port.
pub fn router(scheduler: Arc<Scheduler>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ingest", post(handle_ingest))
        .route("/runs", get(handle_runs))
        .route("/sources", get(handle_sources))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { scheduler })
}

/// Start the HTTP server on `[server].bind`.
///
/// With `with_scheduler`, the recurring cadences run in the same process and
/// share the manual cadence's exclusivity tokens with `POST /ingest`.
pub async fn run_server(config: &Config, with_scheduler: bool) -> anyhow::Result<()> {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(config).await?);
    let registry = Arc::new(ConnectorRegistry::from_config(config)?);
    if registry.is_empty() {
        warn!("No enabled sources configured; ingestion will load nothing");
    }
    let source_count = registry.len();
    let scheduler = Arc::new(Scheduler::new(registry, store, config));

    if with_scheduler {
        let background = scheduler.clone();
        tokio::spawn(async move {
            if let Err(e) = background.run_forever().await {
                warn!(error = %e, "Scheduler stopped");
            }
        });
    }

    let app = router(scheduler);
    let bind_addr = config.server.bind.clone();
    info!(bind = %bind_addr, sources = source_count, "HTTP server listening");
    println!("gdh server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn setup_failed(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "setup_failed".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ POST /ingest ============

#[derive(Serialize)]
struct IngestResponse {
    run_id: String,
    #[serde(flatten)]
    result: IngestionRunResult,
    derivation: Option<DerivationCycleResult>,
}

/// Handler for `POST /ingest`.
///
/// An empty body means default [`RunOptions`]. Unknown keys are ignored.
async fn handle_ingest(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, AppError> {
    let options: RunOptions = if body.iter().all(u8::is_ascii_whitespace) {
        RunOptions::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| bad_request(format!("invalid run options: {}", e)))?
    };

    let outcome = state
        .scheduler
        .trigger(TriggerKind::Manual, options)
        .await
        .map_err(|e| setup_failed(format!("{:#}", e)))?;

    match outcome {
        TriggerOutcome::Skipped(kind) => Ok(Json(json!({
            "skipped": true,
            "trigger": kind,
            "message": "a manual run is already in progress",
        }))
        .into_response()),
        TriggerOutcome::Completed(run) => {
            let PipelineRun {
                id,
                ingestion,
                derivation,
                ..
            } = run;
            let result = ingestion.ok_or_else(|| internal("run finished without ingestion"))?;
            Ok(Json(IngestResponse {
                run_id: id,
                result,
                derivation,
            })
            .into_response())
        }
    }
}

// ============ GET /runs ============

#[derive(Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct RunsResponse {
    runs: Vec<PipelineRun>,
}

async fn handle_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<RunsResponse>, AppError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    let runs = state
        .scheduler
        .store()
        .recent_runs(limit)
        .await
        .map_err(|e| internal(e.to_string()))?;
    Ok(Json(RunsResponse { runs }))
}

// ============ GET /sources ============

#[derive(Serialize)]
struct SourcesResponse {
    sources: Vec<SourceStatus>,
}

async fn handle_sources(State(state): State<AppState>) -> Json<SourcesResponse> {
    let descriptors = state.scheduler.registry().descriptors();
    Json(SourcesResponse {
        sources: get_sources(&descriptors),
    })
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    quality_score: Option<u8>,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let quality_score = match state.scheduler.store().latest_health().await {
        Ok(snapshot) => snapshot.map(|s| s.quality_score),
        Err(e) => {
            warn!(error = %e, "Failed to read latest health snapshot");
            None
        }
    };
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        quality_score,
    })
}
