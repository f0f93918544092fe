use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::debug;
use std::sync::Arc;

use cardprice_ingest::store::StoredPrice;
use cardprice_ingest::{PriceRecord, PriceSource, PriceStore, StoreError};

use super::model::{format_timestamp, NewPriceRowDB, PriceRowDB};
use crate::db::{self, get_connection, spawn_writer, DbPool, WriteHandle};
use crate::errors::{Result, StorageError};
use crate::schema::price_history;
use crate::schema::price_history::dsl;

/// [`PriceStore`] backed by the `price_history` table.
///
/// Reads go through the pool; writes are serialized through the writer actor.
pub struct SqlitePriceStore {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl SqlitePriceStore {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self { pool, writer }
    }

    /// Open (creating if needed) the database at `db_path`, apply pending
    /// migrations and start the writer actor.
    pub fn open(db_path: &str) -> Result<Self> {
        db::init(db_path)?;
        let pool = db::create_pool(db_path)?;
        db::run_migrations(&pool)?;
        let writer = spawn_writer(pool.as_ref().clone());
        Ok(Self::new(pool, writer))
    }

    /// Insert or refresh `records`, all in one transaction.
    ///
    /// Rows go in one statement each; the writer runs the closure inside a
    /// single immediate transaction, so the batch is still all or nothing.
    pub async fn upsert(&self, records: &[PriceRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let written_at = format_timestamp(&Utc::now());
        let rows: Vec<NewPriceRowDB> = records
            .iter()
            .map(|record| NewPriceRowDB::from_record(record, &written_at))
            .collect();

        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<usize> {
                let mut total_upserted = 0;
                for row in &rows {
                    total_upserted += diesel::insert_into(price_history::table)
                        .values(row)
                        .on_conflict((dsl::card_id, dsl::source, dsl::timestamp, dsl::condition))
                        .do_update()
                        .set((
                            dsl::market_price.eq(&row.market_price),
                            dsl::price_low.eq(&row.price_low),
                            dsl::price_high.eq(&row.price_high),
                            dsl::currency.eq(&row.currency),
                            dsl::updated_at.eq(&row.updated_at),
                        ))
                        .execute(conn)?;
                }
                debug!("Upserted {} price row(s)", total_upserted);
                Ok(total_upserted)
            })
            .await
    }

    /// Delete observations last written before `cutoff`.
    pub async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff = format_timestamp(&cutoff);
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<usize> {
                let deleted =
                    diesel::delete(dsl::price_history.filter(dsl::updated_at.lt(&cutoff)))
                        .execute(conn)?;
                debug!("Deleted {} price row(s) written before {}", deleted, cutoff);
                Ok(deleted)
            })
            .await
    }

    /// The most recent observation for a card, optionally from one source.
    pub fn latest_for_card(
        &self,
        card_id: i64,
        source: Option<PriceSource>,
    ) -> Result<Option<StoredPrice>> {
        let mut conn = get_connection(&self.pool)?;

        let mut query = dsl::price_history
            .filter(dsl::card_id.eq(card_id))
            .select(PriceRowDB::as_select())
            .into_boxed();
        if let Some(source) = source {
            query = query.filter(dsl::source.eq(source.as_str()));
        }

        query
            .order((dsl::timestamp.desc(), dsl::id.desc()))
            .first::<PriceRowDB>(&mut conn)
            .optional()?
            .map(StoredPrice::try_from)
            .transpose()
    }

    /// Every observation for a card, oldest first.
    pub fn history_for_card(
        &self,
        card_id: i64,
        source: Option<PriceSource>,
    ) -> Result<Vec<StoredPrice>> {
        let mut conn = get_connection(&self.pool)?;

        let mut query = dsl::price_history
            .filter(dsl::card_id.eq(card_id))
            .select(PriceRowDB::as_select())
            .into_boxed();
        if let Some(source) = source {
            query = query.filter(dsl::source.eq(source.as_str()));
        }

        query
            .order((dsl::timestamp.asc(), dsl::id.asc()))
            .load::<PriceRowDB>(&mut conn)?
            .into_iter()
            .map(StoredPrice::try_from)
            .collect()
    }

    /// Number of stored observations.
    pub fn count(&self) -> Result<i64> {
        let mut conn = get_connection(&self.pool)?;
        Ok(dsl::price_history.count().get_result(&mut conn)?)
    }
}

#[async_trait]
impl PriceStore for SqlitePriceStore {
    async fn upsert_batch(&self, records: &[PriceRecord]) -> std::result::Result<usize, StoreError> {
        self.upsert(records).await.map_err(|e: StorageError| e.into())
    }
}
