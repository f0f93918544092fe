//! Domain models for price ingestion.

mod price;
mod query;
mod raw;
mod result;

pub use price::{Condition, PriceKey, PriceRecord, PriceSource, DEFAULT_CURRENCY};
pub use query::{CardRef, PriceQuery};
pub use raw::RawPriceRecord;
pub use result::{FailedSource, FailedSourceKind, IngestionResult, SkippedRecord};
