//! Raw record validation and normalization.
//!
//! Turns the loosely typed rows produced by source clients into
//! [`PriceRecord`]s:
//! - `card_id` must be a positive integer (number or numeric string)
//! - `market_price` is required, non-negative and below a sanity ceiling
//! - missing `price_low` / `price_high` default to `market_price`
//! - missing timestamps default to the ingestion time
//! - unknown conditions fall back to near mint

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use log::debug;
use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;

use crate::models::{Condition, PriceRecord, PriceSource, RawPriceRecord, DEFAULT_CURRENCY};

/// Why a raw record was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    Missing(&'static str),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("{field} {value} exceeds ceiling {ceiling}")]
    AboveCeiling {
        field: &'static str,
        value: Decimal,
        ceiling: Decimal,
    },
}

impl ValidationError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Normalizer configuration.
#[derive(Clone, Debug)]
pub struct NormalizerConfig {
    /// Maximum allowed price value (for sanity check).
    pub max_price: Decimal,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            max_price: Decimal::from(100_000),
        }
    }
}

/// Validates raw source rows and builds canonical records.
#[derive(Clone, Debug, Default)]
pub struct PriceNormalizer {
    config: NormalizerConfig,
}

impl PriceNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn with_max_price(max_price: Decimal) -> Self {
        Self::with_config(NormalizerConfig { max_price })
    }

    /// Normalize a record, stamping undated rows with the current time.
    pub fn normalize(
        &self,
        raw: &RawPriceRecord,
        source: PriceSource,
    ) -> Result<PriceRecord, ValidationError> {
        self.normalize_at(raw, source, Utc::now())
    }

    /// Normalize a record, stamping undated rows with `ingested_at`.
    pub fn normalize_at(
        &self,
        raw: &RawPriceRecord,
        source: PriceSource,
        ingested_at: DateTime<Utc>,
    ) -> Result<PriceRecord, ValidationError> {
        let card_id = parse_card_id(raw.card_id.as_ref())?;

        let market_price = self
            .price_field("market_price", raw.market_price.as_ref())?
            .ok_or(ValidationError::Missing("market_price"))?;
        let price_low = self
            .price_field("price_low", raw.price_low.as_ref())?
            .unwrap_or(market_price);
        let price_high = self
            .price_field("price_high", raw.price_high.as_ref())?
            .unwrap_or(market_price);

        if price_low > price_high {
            return Err(ValidationError::invalid(
                "price_low",
                format!("{} is above price_high {}", price_low, price_high),
            ));
        }

        let condition = match raw.condition.as_deref() {
            Some(value) => Condition::from_alias(value).unwrap_or_else(|| {
                debug!(
                    "Normalizer: unknown condition '{}' from '{}', using {}",
                    value,
                    source,
                    Condition::default()
                );
                Condition::default()
            }),
            None => Condition::default(),
        };

        let timestamp = parse_timestamp(raw.timestamp.as_ref())?.unwrap_or(ingested_at);
        let currency = parse_currency(raw.currency.as_deref())?;

        Ok(PriceRecord {
            card_id,
            source,
            market_price,
            price_low,
            price_high,
            condition,
            currency,
            timestamp,
        })
    }

    fn price_field(
        &self,
        field: &'static str,
        value: Option<&Value>,
    ) -> Result<Option<Decimal>, ValidationError> {
        let Some(price) = parse_decimal(field, value)? else {
            return Ok(None);
        };

        if price.is_sign_negative() && !price.is_zero() {
            return Err(ValidationError::invalid(field, format!("{} is negative", price)));
        }
        if price > self.config.max_price {
            return Err(ValidationError::AboveCeiling {
                field,
                value: price,
                ceiling: self.config.max_price,
            });
        }
        Ok(Some(price))
    }
}

fn parse_card_id(value: Option<&Value>) -> Result<i64, ValidationError> {
    let id = match value {
        None | Some(Value::Null) => return Err(ValidationError::Missing("card_id")),
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(_) => None,
    };

    match id {
        Some(id) if id > 0 => Ok(id),
        Some(id) => Err(ValidationError::invalid(
            "card_id",
            format!("{} is not positive", id),
        )),
        None => Err(ValidationError::invalid("card_id", "not an integer")),
    }
}

/// Parse a number or a price string such as `"$1,234.50"`.
/// `null`, empty strings and `"N/A"` count as absent.
pub(crate) fn parse_decimal(field: &'static str, value: Option<&Value>) -> Result<Option<Decimal>, ValidationError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            let text = n.to_string();
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .map(Some)
                .map_err(|_| ValidationError::invalid(field, format!("'{}' is not a decimal", text)))
        }
        Some(Value::String(s)) => {
            let cleaned = s.replace(['$', ','], "");
            let cleaned = cleaned.trim();
            if cleaned.is_empty() || cleaned.eq_ignore_ascii_case("n/a") {
                return Ok(None);
            }
            Decimal::from_str(cleaned)
                .map(Some)
                .map_err(|_| ValidationError::invalid(field, format!("'{}' is not a decimal", s)))
        }
        Some(other) => Err(ValidationError::invalid(
            field,
            format!("unexpected value {}", other),
        )),
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD` (midnight UTC), naive date-times (UTC)
/// and integer Unix seconds.
fn parse_timestamp(value: Option<&Value>) -> Result<Option<DateTime<Utc>>, ValidationError> {
    let parsed = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => parse_timestamp_str(s.trim()),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        Some(_) => None,
    };

    parsed
        .map(Some)
        .ok_or_else(|| ValidationError::invalid("timestamp", format!("cannot parse {:?}", value)))
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn parse_currency(value: Option<&str>) -> Result<String, ValidationError> {
    let Some(raw) = value.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(DEFAULT_CURRENCY.to_string());
    };

    let code = raw.to_ascii_uppercase();
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(code)
    } else {
        Err(ValidationError::invalid(
            "currency",
            format!("'{}' is not an ISO 4217 code", raw),
        ))
    }
}
