//! Price source trait definition.

use async_trait::async_trait;

use crate::errors::SourceFailure;
use crate::models::{PriceQuery, PriceSource, RawPriceRecord};

/// A client for one external price provider.
///
/// Implementations own authentication, pagination and response decoding.
/// They make no retry or rate-limit decisions of their own. The pipeline
/// splits a query with [`SourceClient::request_units`] and wraps the `fetch`
/// of every unit in its limiter, breaker, retry loop and deadline.
///
/// # Example
///
/// ```ignore
/// use async_trait::async_trait;
/// use cardprice_ingest::{PriceQuery, PriceSource, RawPriceRecord, SourceClient, SourceFailure};
///
/// struct ManualSheet;
///
/// #[async_trait]
/// impl SourceClient for ManualSheet {
///     fn source(&self) -> PriceSource {
///         PriceSource::Manual
///     }
///
///     async fn fetch(&self, query: &PriceQuery) -> Result<Vec<RawPriceRecord>, SourceFailure> {
///         Ok(query
///             .cards
///             .iter()
///             .map(|card| RawPriceRecord::new(card.card_id).market_price("1.00"))
///             .collect())
///     }
/// }
/// ```
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// The provider this client talks to. Keys the per-source resilience state.
    fn source(&self) -> PriceSource;

    /// Fetch raw price rows for the cards in `query`.
    ///
    /// Cards the provider does not list are left out of the result.
    /// Failures must keep the HTTP status and any `Retry-After` hint so they
    /// can be classified.
    async fn fetch(&self, query: &PriceQuery) -> Result<Vec<RawPriceRecord>, SourceFailure>;

    /// Split `query` into sub-queries that each cost one upstream request.
    ///
    /// Each unit takes one rate-limit slot and gets its own deadline.
    /// Cards the provider does not list may be dropped; an empty list means
    /// there is nothing to ask. The default treats the whole query as one
    /// request.
    fn request_units(&self, query: &PriceQuery) -> Vec<PriceQuery> {
        vec![query.clone()]
    }
}
