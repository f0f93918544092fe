//! Database models for price history.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use diesel::prelude::*;
use rust_decimal::Decimal;

use cardprice_ingest::store::StoredPrice;
use cardprice_ingest::{Condition, PriceRecord, PriceSource};

use crate::errors::StorageError;

/// Canonical text form for stored instants: fixed width, so text order is
/// time order.
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("{} '{}': {}", field, value, e)))
}

fn parse_decimal(field: &str, value: &str) -> Result<Decimal, StorageError> {
    Decimal::from_str(value)
        .map_err(|e| StorageError::Corrupt(format!("{} '{}': {}", field, value, e)))
}

/// Database model for a stored price observation
#[derive(Queryable, Identifiable, Selectable, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::price_history)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PriceRowDB {
    pub id: i32,
    pub card_id: i64,
    pub source: String,
    pub market_price: String,
    pub price_low: String,
    pub price_high: String,
    pub condition: String,
    pub currency: String,
    pub timestamp: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Insertable model; `id` is assigned by SQLite.
#[derive(Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::price_history)]
pub struct NewPriceRowDB {
    pub card_id: i64,
    pub source: String,
    pub market_price: String,
    pub price_low: String,
    pub price_high: String,
    pub condition: String,
    pub currency: String,
    pub timestamp: String,
    pub created_at: String,
    pub updated_at: String,
}

impl NewPriceRowDB {
    pub fn from_record(record: &PriceRecord, written_at: &str) -> Self {
        Self {
            card_id: record.card_id,
            source: record.source.as_str().to_string(),
            market_price: record.market_price.normalize().to_string(),
            price_low: record.price_low.normalize().to_string(),
            price_high: record.price_high.normalize().to_string(),
            condition: record.condition.as_str().to_string(),
            currency: record.currency.clone(),
            timestamp: format_timestamp(&record.timestamp),
            created_at: written_at.to_string(),
            updated_at: written_at.to_string(),
        }
    }
}

impl TryFrom<PriceRowDB> for StoredPrice {
    type Error = StorageError;

    fn try_from(db: PriceRowDB) -> Result<Self, Self::Error> {
        let source = PriceSource::from_str(&db.source)
            .map_err(|_| StorageError::Corrupt(format!("source '{}'", db.source)))?;
        let condition = Condition::from_alias(&db.condition)
            .ok_or_else(|| StorageError::Corrupt(format!("condition '{}'", db.condition)))?;

        Ok(StoredPrice {
            record: PriceRecord {
                card_id: db.card_id,
                source,
                market_price: parse_decimal("market_price", &db.market_price)?,
                price_low: parse_decimal("price_low", &db.price_low)?,
                price_high: parse_decimal("price_high", &db.price_high)?,
                condition,
                currency: db.currency,
                timestamp: parse_timestamp("timestamp", &db.timestamp)?,
            },
            created_at: parse_timestamp("created_at", &db.created_at)?,
            updated_at: parse_timestamp("updated_at", &db.updated_at)?,
        })
    }
}
