//! What to ask the sources for.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Condition, PriceSource};
use crate::errors::{IngestError, Result};

/// A card known locally, with the identifiers each provider uses for it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardRef {
    /// Local card id stored on every price record.
    pub card_id: i64,
    /// Game slug understood by the providers (`pokemon`, `onepiece`, ...).
    #[serde(default)]
    pub game: Option<String>,
    /// Provider-specific product identifiers.
    #[serde(default)]
    pub external_ids: BTreeMap<PriceSource, String>,
}

impl CardRef {
    pub fn new(card_id: i64) -> Self {
        Self {
            card_id,
            game: None,
            external_ids: BTreeMap::new(),
        }
    }

    pub fn with_game(mut self, game: impl Into<String>) -> Self {
        self.game = Some(game.into());
        self
    }

    pub fn with_external_id(mut self, source: PriceSource, id: impl Into<String>) -> Self {
        self.external_ids.insert(source, id.into());
        self
    }

    /// Identifier of this card at `source`, if the card is listed there.
    pub fn external_id(&self, source: PriceSource) -> Option<&str> {
        self.external_ids.get(&source).map(String::as_str)
    }
}

/// One ingestion request: a single card refresh or a bulk batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceQuery {
    pub cards: Vec<CardRef>,
    /// Restrict to one condition; providers default to near mint.
    #[serde(default)]
    pub condition: Option<Condition>,
}

impl PriceQuery {
    /// Refresh prices for a single card.
    pub fn card(card: CardRef) -> Self {
        Self {
            cards: vec![card],
            condition: None,
        }
    }

    /// Bulk refresh a batch of cards.
    pub fn batch(cards: Vec<CardRef>) -> Self {
        Self {
            cards,
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Same condition filter, different cards.
    pub fn with_cards(&self, cards: Vec<CardRef>) -> Self {
        Self {
            cards,
            condition: self.condition,
        }
    }

    /// Cards that `source` can be asked about.
    pub fn cards_for(&self, source: PriceSource) -> impl Iterator<Item = (&CardRef, &str)> {
        self.cards
            .iter()
            .filter_map(move |card| card.external_id(source).map(|id| (card, id)))
    }

    /// Reject queries no source could answer.
    pub fn validate(&self) -> Result<()> {
        if self.cards.is_empty() {
            return Err(IngestError::InvalidQuery("no cards requested".to_string()));
        }
        if let Some(card) = self.cards.iter().find(|card| card.card_id <= 0) {
            return Err(IngestError::InvalidQuery(format!(
                "card id must be positive, got {}",
                card.card_id
            )));
        }
        Ok(())
    }
}
