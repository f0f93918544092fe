mod model;
mod repository;

pub use model::{format_timestamp, NewPriceRowDB, PriceRowDB};
pub use repository::SqlitePriceStore;
