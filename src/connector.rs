//! The connector trait and the registry the orchestrator draws from.
//!
//! A connector is a fixed `{fetch, map}` pair over one upstream source:
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            ConnectorRegistry             │
//! │  ┌──────────────┐   ┌─────────────────┐  │
//! │  │ HttpConnector│   │ Custom (tests,  │  │
//! │  │ per [sources]│   │ embedders)      │  │
//! │  └──────────────┘   └─────────────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!        run_ingestion() → UpsertSink → Store
//! ```
//!
//! Built-in connectors come from `[sources.<id>]` tables via
//! [`ConnectorRegistry::from_config`]; anything else implementing
//! [`Connector`] can be added with [`ConnectorRegistry::register`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::connector_http::HttpConnector;
use crate::error::{FetchError, MapError};
use crate::models::{CanonicalRecord, Cursor, Page, RawRecord, SourceDescriptor};

/// A paged upstream data source.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use govdata_harness::connector::Connector;
/// use govdata_harness::error::{FetchError, MapError};
/// use govdata_harness::models::{CanonicalRecord, Cursor, Page, RawRecord, SourceDescriptor};
///
/// pub struct Empty(SourceDescriptor);
///
/// #[async_trait]
/// impl Connector for Empty {
///     fn descriptor(&self) -> &SourceDescriptor { &self.0 }
///
///     async fn fetch(&self, _partition: &str, _cursor: &Cursor) -> Result<Page, FetchError> {
///         Ok(Page { records: vec![], next: None })
///     }
///
///     fn map(&self, _raw: &RawRecord) -> Result<CanonicalRecord, MapError> {
///         Err(MapError::NotAnObject)
///     }
/// }
/// ```
#[async_trait]
pub trait Connector: Send + Sync {
    fn descriptor(&self) -> &SourceDescriptor;

    /// Source id, used as the `source` tag on every record.
    fn id(&self) -> &str {
        &self.descriptor().id
    }

    /// Check that everything the source needs at run time is present.
    ///
    /// A failure skips the whole source for the Run with a `config` error.
    fn preflight(&self) -> Result<(), String> {
        Ok(())
    }

    /// Fetch one page of one partition.
    ///
    /// Implementations must go through their rate limiter for every upstream
    /// call. Errors are not retried inside a Run.
    async fn fetch(&self, partition: &str, cursor: &Cursor) -> Result<Page, FetchError>;

    /// Map one raw record. Pure: identical input yields identical output.
    fn map(&self, raw: &RawRecord) -> Result<CanonicalRecord, MapError>;
}

/// Registry of connectors, keyed by source id.
pub struct ConnectorRegistry {
    connectors: Vec<Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            connectors: Vec::new(),
        }
    }

    /// One [`HttpConnector`] per enabled `[sources.<id>]` table.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        for descriptor in config.descriptors() {
            registry.register(Arc::new(HttpConnector::new(descriptor)?));
        }
        Ok(registry)
    }

    /// Register a connector. A later registration replaces one with the same id.
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.retain(|c| c.id() != connector.id());
        self.connectors.push(connector);
    }

    pub fn find(&self, id: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.iter().find(|c| c.id() == id).cloned()
    }

    pub fn descriptors(&self) -> Vec<SourceDescriptor> {
        self.connectors
            .iter()
            .map(|c| c.descriptor().clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
