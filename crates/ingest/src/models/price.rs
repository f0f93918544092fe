//! Canonical price record and its enumerations.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::IngestError;

/// Default ISO 4217 currency for records that do not state one.
pub const DEFAULT_CURRENCY: &str = "USD";

/// External price provider identifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    TcgPlayer,
    Ebay,
    Cardmarket,
    JustTcg,
    PriceCharting,
    Manual,
}

impl PriceSource {
    pub const ALL: [PriceSource; 6] = [
        PriceSource::TcgPlayer,
        PriceSource::Ebay,
        PriceSource::Cardmarket,
        PriceSource::JustTcg,
        PriceSource::PriceCharting,
        PriceSource::Manual,
    ];

    /// Stable identifier used in configuration, logs and storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TcgPlayer => "tcgplayer",
            Self::Ebay => "ebay",
            Self::Cardmarket => "cardmarket",
            Self::JustTcg => "justtcg",
            Self::PriceCharting => "pricecharting",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriceSource {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|source| source.as_str() == needle)
            .ok_or_else(|| IngestError::UnknownSource(s.to_string()))
    }
}

/// Physical condition of a graded or raw card.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Mint,
    #[default]
    NearMint,
    LightlyPlayed,
    ModeratelyPlayed,
    HeavilyPlayed,
    Damaged,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mint => "mint",
            Self::NearMint => "near_mint",
            Self::LightlyPlayed => "lightly_played",
            Self::ModeratelyPlayed => "moderately_played",
            Self::HeavilyPlayed => "heavily_played",
            Self::Damaged => "damaged",
        }
    }

    /// Short code used by marketplace APIs (`nm`, `lp`, ...).
    pub fn code(&self) -> &'static str {
        match self {
            Self::Mint => "m",
            Self::NearMint => "nm",
            Self::LightlyPlayed => "lp",
            Self::ModeratelyPlayed => "mp",
            Self::HeavilyPlayed => "hp",
            Self::Damaged => "dmg",
        }
    }

    /// Recognize a condition name, code or common spelling.
    pub fn from_alias(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        let condition = match normalized.as_str() {
            "mint" | "m" | "gem_mint" => Self::Mint,
            "near_mint" | "nm" | "nearmint" => Self::NearMint,
            "lightly_played" | "lp" | "excellent" => Self::LightlyPlayed,
            "moderately_played" | "mp" | "good" => Self::ModeratelyPlayed,
            "heavily_played" | "hp" | "played" => Self::HeavilyPlayed,
            "damaged" | "dmg" | "poor" => Self::Damaged,
            _ => return None,
        };
        Some(condition)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated price observation.
///
/// `(card_id, source, timestamp, condition)` is the natural key: storing a
/// record whose key already exists refreshes its prices instead of adding a row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceRecord {
    pub card_id: i64,
    pub source: PriceSource,
    pub market_price: Decimal,
    pub price_low: Decimal,
    pub price_high: Decimal,
    pub condition: Condition,
    pub currency: String,
    pub timestamp: DateTime<Utc>,
}

impl PriceRecord {
    pub fn natural_key(&self) -> PriceKey {
        PriceKey {
            card_id: self.card_id,
            source: self.source,
            timestamp: self.timestamp,
            condition: self.condition,
        }
    }
}

/// Natural key of a [`PriceRecord`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PriceKey {
    pub card_id: i64,
    pub source: PriceSource,
    pub timestamp: DateTime<Utc>,
    pub condition: Condition,
}
