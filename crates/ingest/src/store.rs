//! Persistence boundary for normalized price records.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use thiserror::Error;

use crate::models::{PriceKey, PriceRecord};

/// Errors reported by a [`PriceStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),
}

/// Idempotent persistence of price records.
///
/// Implementations upsert on the natural key
/// `(card_id, source, timestamp, condition)`: an existing row gets its price
/// fields and `updated_at` refreshed, a new key adds a row. A batch is
/// written atomically.
#[async_trait]
pub trait PriceStore: Send + Sync {
    /// Upsert `records`, returning the number of rows inserted or updated.
    async fn upsert_batch(&self, records: &[PriceRecord]) -> Result<usize, StoreError>;
}

/// A stored row with its bookkeeping timestamps.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredPrice {
    pub record: PriceRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Process-local [`PriceStore`] keyed by natural key.
#[derive(Default)]
pub struct InMemoryPriceStore {
    rows: Mutex<BTreeMap<PriceKey, StoredPrice>>,
}

impl InMemoryPriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_rows(&self) -> MutexGuard<'_, BTreeMap<PriceKey, StoredPrice>> {
        self.rows.lock().unwrap_or_else(|poisoned| {
            warn!("In-memory price store mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn len(&self) -> usize {
        self.lock_rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_rows().is_empty()
    }

    pub fn get(&self, key: &PriceKey) -> Option<StoredPrice> {
        self.lock_rows().get(key).cloned()
    }

    /// All stored records in natural-key order.
    pub fn records(&self) -> Vec<PriceRecord> {
        self.lock_rows()
            .values()
            .map(|row| row.record.clone())
            .collect()
    }
}

#[async_trait]
impl PriceStore for InMemoryPriceStore {
    async fn upsert_batch(&self, records: &[PriceRecord]) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut rows = self.lock_rows();

        for record in records {
            rows.entry(record.natural_key())
                .and_modify(|row| {
                    row.record = record.clone();
                    row.updated_at = now;
                })
                .or_insert_with(|| StoredPrice {
                    record: record.clone(),
                    created_at: now,
                    updated_at: now,
                });
        }
        Ok(records.len())
    }
}
