//! # govdata-harness
//!
//! A multi-source ingestion and derivation pipeline for public procurement,
//! grant, opportunity, entity, and regulatory data.
//!
//! Connectors page through upstream APIs under per-source rate limits, map
//! every raw record to a canonical shape keyed by its natural identity, and
//! write it through an idempotent upsert sink. Once enough new data has
//! landed, an ordered derivation cycle recomputes entity statistics,
//! relationships, insights, scores, and a corpus health snapshot. A
//! scheduler drives hourly, daily, and weekly Runs with per-cadence
//! exclusivity; an HTTP endpoint triggers manual Runs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌────────────┐   ┌─────────┐
//! │  Connectors  │──▶│ Orchestrator │──▶│ Upsert Sink│──▶│  Store  │
//! │ (rate-limited)│  │ (fan-out)    │   │ (natural key)│  │ (SQLite)│
//! └──────────────┘   └──────┬───────┘   └────────────┘   └────┬────┘
//!                           │                                  │
//!                    ┌──────▼───────┐                   ┌──────▼──────┐
//!                    │  Scheduler   │──────────────────▶│ Derivation  │
//!                    │ + HTTP/CLI   │                   │ procedures  │
//!                    └──────────────┘                   └─────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed fetch and mapping errors |
//! | [`rate_limit`] | Per-connector delay, concurrency cap, and timeout |
//! | [`connector`] | `Connector` trait and registry |
//! | [`connector_http`] | Paged JSON-over-HTTP connector |
//! | [`mapping`] | Per-source request shapes and record mapping |
//! | [`sink`] | Idempotent upsert sink |
//! | [`ingest`] | Ingestion orchestrator |
//! | [`procedures`] | Derivation procedures run by the store |
//! | [`derive`] | Ordered derivation cycle |
//! | [`scheduler`] | Cadences and exclusivity tokens |
//! | [`run_log`] | Run audit records |
//! | [`store`] | Storage trait, SQLite and in-memory backends |
//! | [`server`] | HTTP trigger and read API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod connector;
pub mod connector_http;
pub mod db;
pub mod derive;
pub mod error;
pub mod ingest;
pub mod mapping;
pub mod migrate;
pub mod models;
pub mod procedures;
pub mod rate_limit;
pub mod run_log;
pub mod scheduler;
pub mod server;
pub mod sink;
pub mod sources;
pub mod stats;
pub mod store;
