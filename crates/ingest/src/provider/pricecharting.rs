//! PriceCharting price provider.
//!
//! One request per product: `GET /product/{id}/prices`. The API reports
//! loose, complete-in-box and new prices; the market price is their mean
//! and the low/high band their minimum and maximum. Products the API does
//! not know (404) are skipped rather than failing the whole fetch.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use super::http::{HttpTransport, DEFAULT_HTTP_TIMEOUT};
use super::traits::SourceClient;
use crate::errors::SourceFailure;
use crate::models::{PriceQuery, PriceSource, RawPriceRecord};
use crate::normalizer::parse_decimal;

const BASE_URL: &str = "https://www.pricecharting.com/api";

#[derive(Debug, Deserialize)]
struct PricesResponse {
    #[serde(rename = "loose-price")]
    loose_price: Option<Value>,
    #[serde(rename = "cib-price")]
    cib_price: Option<Value>,
    #[serde(rename = "new-price")]
    new_price: Option<Value>,
    #[serde(rename = "updated-at")]
    updated_at: Option<Value>,
}

impl PricesResponse {
    /// Prices that parse, ignoring blanks and garbage.
    fn prices(&self) -> Vec<Decimal> {
        [&self.loose_price, &self.cib_price, &self.new_price]
            .into_iter()
            .filter_map(|value| parse_decimal("price", value.as_ref()).ok().flatten())
            .collect()
    }
}

/// Mean of `prices`; `None` when empty or when the sum overflows.
fn mean(prices: &[Decimal]) -> Option<Decimal> {
    let total = prices
        .iter()
        .try_fold(Decimal::ZERO, |acc, price| acc.checked_add(*price))?;
    total.checked_div(Decimal::from(prices.len()))
}

pub struct PriceChartingClient {
    transport: HttpTransport,
}

impl PriceChartingClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, BASE_URL)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self::with_timeout(api_key, base_url, DEFAULT_HTTP_TIMEOUT)
    }

    pub fn with_timeout(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport: HttpTransport::new(
                PriceSource::PriceCharting,
                base_url,
                Some(api_key.into()),
                timeout,
            ),
        }
    }
}

#[async_trait]
impl SourceClient for PriceChartingClient {
    fn source(&self) -> PriceSource {
        PriceSource::PriceCharting
    }

    /// One request per listed card.
    fn request_units(&self, query: &PriceQuery) -> Vec<PriceQuery> {
        query
            .cards_for(PriceSource::PriceCharting)
            .map(|(card, _)| query.with_cards(vec![card.clone()]))
            .collect()
    }

    async fn fetch(&self, query: &PriceQuery) -> Result<Vec<RawPriceRecord>, SourceFailure> {
        let condition = query.condition.unwrap_or_default();
        let mut records = Vec::new();

        for (card, product_id) in query.cards_for(PriceSource::PriceCharting) {
            let path = format!("/product/{}/prices", product_id);
            let response: PricesResponse = match self.transport.get_json(&path, &[]).await {
                Ok(response) => response,
                Err(SourceFailure::Http { status: 404, .. }) => {
                    debug!("PriceCharting: no product '{}' for card {}", product_id, card.card_id);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let prices = response.prices();
            let mut record = RawPriceRecord::new(card.card_id)
                .condition(condition.as_str())
                .currency("USD");
            match (prices.iter().min(), prices.iter().max(), mean(&prices)) {
                (Some(low), Some(high), Some(mean)) => {
                    record = record
                        .market_price(mean.round_dp(2).to_string())
                        .price_low(low.to_string())
                        .price_high(high.to_string());
                }
                // Left without a market price, so the row is skipped as invalid
                _ => debug!(
                    "PriceCharting: no usable prices for product '{}'",
                    product_id
                ),
            }
            record.timestamp = response.updated_at;
            records.push(record);
        }

        Ok(records)
    }
}
