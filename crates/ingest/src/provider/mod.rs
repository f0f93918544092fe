//! Price source clients.
//!
//! Each client speaks one provider's HTTP API and returns loosely typed
//! [`RawPriceRecord`](crate::models::RawPriceRecord)s. Resilience is layered
//! on by the pipeline, not here.

mod http;
mod justtcg;
mod pricecharting;
mod traits;

pub use http::DEFAULT_HTTP_TIMEOUT;
pub use justtcg::JustTcgClient;
pub use pricecharting::PriceChartingClient;
pub use traits::SourceClient;
