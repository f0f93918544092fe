use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Loosely typed price row as produced by a source client.
///
/// Providers disagree on types (numbers vs. strings, dates vs. timestamps),
/// so every field is kept as raw JSON until the normalizer validates it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPriceRecord {
    #[serde(default)]
    pub card_id: Option<Value>,
    #[serde(default)]
    pub market_price: Option<Value>,
    #[serde(default)]
    pub price_low: Option<Value>,
    #[serde(default)]
    pub price_high: Option<Value>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

impl RawPriceRecord {
    pub fn new(card_id: impl Into<Value>) -> Self {
        Self {
            card_id: Some(card_id.into()),
            ..Default::default()
        }
    }

    pub fn market_price(mut self, value: impl Into<Value>) -> Self {
        self.market_price = Some(value.into());
        self
    }

    pub fn price_low(mut self, value: impl Into<Value>) -> Self {
        self.price_low = Some(value.into());
        self
    }

    pub fn price_high(mut self, value: impl Into<Value>) -> Self {
        self.price_high = Some(value.into());
        self
    }

    pub fn condition(mut self, value: impl Into<String>) -> Self {
        self.condition = Some(value.into());
        self
    }

    pub fn currency(mut self, value: impl Into<String>) -> Self {
        self.currency = Some(value.into());
        self
    }

    pub fn timestamp(mut self, value: impl Into<Value>) -> Self {
        self.timestamp = Some(value.into());
        self
    }
}
