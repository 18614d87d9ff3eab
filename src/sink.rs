//! Upsert sink: the single write path from connectors into the store.
//!
//! The sink stamps `last_seen`, forwards the record to [`Store::upsert`], and
//! folds the result into an [`UpsertOutcome`]. A failed write is returned as
//! an outcome carrying the error text, never as an `Err`, so callers can keep
//! iterating over the rest of a page.

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use crate::models::{CanonicalRecord, UpsertOutcome};
use crate::store::Store;

#[derive(Clone)]
pub struct UpsertSink {
    store: Arc<dyn Store>,
}

impl UpsertSink {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Apply one record. Applying the same record again reports `is_new = false`.
    pub async fn apply(&self, mut record: CanonicalRecord) -> UpsertOutcome {
        record.last_seen = Utc::now();
        match self.store.upsert(&record).await {
            Ok(result) => UpsertOutcome {
                applied: result.applied,
                is_new: result.was_new,
                error: None,
            },
            Err(e) => {
                warn!(
                    kind = %record.kind,
                    key = %record.key,
                    source = %record.source,
                    error = %e,
                    "Upsert failed"
                );
                UpsertOutcome::failed(e.to_string())
            }
        }
    }

    /// Apply records in order. A failing row does not stop the batch.
    pub async fn apply_batch(&self, records: Vec<CanonicalRecord>) -> Vec<UpsertOutcome> {
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            outcomes.push(self.apply(record).await);
        }
        outcomes
    }
}
