//! JustTCG price provider.
//!
//! Uses the batch endpoint `GET /prices/batch?ids=..&game=..&condition=..`,
//! which accepts up to 20 product ids per request. Cards are grouped by game
//! before chunking since the endpoint is scoped to one game per call.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use serde_json::Value;

use super::http::{HttpTransport, DEFAULT_HTTP_TIMEOUT};
use super::traits::SourceClient;
use crate::errors::SourceFailure;
use crate::models::{CardRef, Condition, PriceQuery, PriceSource, RawPriceRecord};

const BASE_URL: &str = "https://api.justtcg.com/v1";
const MAX_IDS_PER_REQUEST: usize = 20;

// ============================================================================
// API Response Structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    data: Vec<PriceEntry>,
}

#[derive(Debug, Deserialize)]
struct PriceEntry {
    /// JustTCG product id, echoed back from the request
    card_id: Option<Value>,
    market_price: Option<Value>,
    low_price: Option<Value>,
    high_price: Option<Value>,
    condition: Option<String>,
    currency: Option<String>,
    updated_at: Option<Value>,
}

// ============================================================================
// Client
// ============================================================================

pub struct JustTcgClient {
    transport: HttpTransport,
}

impl JustTcgClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, BASE_URL)
    }

    /// Point the client at another host (staging, or a mock server in tests).
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
                PriceSource::JustTcg,
                base_url,
                Some(api_key.into()),
                timeout,
            ),
        }
    }

    async fn fetch_chunk(
        &self,
        game: Option<&str>,
        cards: &[(&CardRef, &str)],
        condition: Condition,
    ) -> Result<Vec<RawPriceRecord>, SourceFailure> {
        let ids: Vec<&str> = cards.iter().map(|(_, id)| *id).collect();
        let mut params = vec![
            ("ids", ids.join(",")),
            ("condition", condition.code().to_string()),
        ];
        if let Some(game) = game {
            params.push(("game", game.to_string()));
        }

        let response: BatchResponse = self.transport.get_json("/prices/batch", &params).await?;

        let local_ids: HashMap<&str, i64> = cards
            .iter()
            .map(|(card, external)| (*external, card.card_id))
            .collect();

        Ok(response
            .data
            .into_iter()
            .map(|entry| {
                let card_id = entry
                    .card_id
                    .as_ref()
                    .and_then(external_id_text)
                    .and_then(|id| local_ids.get(id.as_str()).copied());
                if card_id.is_none() {
                    debug!("JustTCG: unrequested product {:?} in response", entry.card_id);
                }

                RawPriceRecord {
                    card_id: card_id.map(Value::from),
                    market_price: entry.market_price,
                    price_low: entry.low_price,
                    price_high: entry.high_price,
                    condition: entry.condition,
                    currency: entry.currency,
                    timestamp: entry.updated_at,
                }
            })
            .collect())
    }
}

/// Listed cards grouped by game, then chunked to the per-request id limit.
fn batches(query: &PriceQuery) -> Vec<(Option<&str>, Vec<(&CardRef, &str)>)> {
    let mut by_game: BTreeMap<Option<&str>, Vec<(&CardRef, &str)>> = BTreeMap::new();
    for (card, id) in query.cards_for(PriceSource::JustTcg) {
        by_game.entry(card.game.as_deref()).or_default().push((card, id));
    }

    by_game
        .into_iter()
        .flat_map(|(game, cards)| {
            cards
                .chunks(MAX_IDS_PER_REQUEST)
                .map(|chunk| (game, chunk.to_vec()))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn external_id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl SourceClient for JustTcgClient {
    fn source(&self) -> PriceSource {
        PriceSource::JustTcg
    }

    /// One request per game and chunk of at most 20 ids.
    fn request_units(&self, query: &PriceQuery) -> Vec<PriceQuery> {
        batches(query)
            .into_iter()
            .map(|(_, chunk)| {
                query.with_cards(chunk.into_iter().map(|(card, _)| card.clone()).collect())
            })
            .collect()
    }

    async fn fetch(&self, query: &PriceQuery) -> Result<Vec<RawPriceRecord>, SourceFailure> {
        let condition = query.condition.unwrap_or_default();

        let mut records = Vec::new();
        for (game, chunk) in batches(query) {
            records.extend(self.fetch_chunk(game, &chunk, condition).await?);
        }
        Ok(records)
    }
}
