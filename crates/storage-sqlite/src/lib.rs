//! SQLite storage implementation for cardprice.
//!
//! This crate provides the production [`PriceStore`](cardprice_ingest::PriceStore)
//! using Diesel ORM with SQLite:
//! - Database connection pooling and management
//! - Embedded Diesel migrations
//! - A single writer actor so every batch is one immediate transaction
//! - Read helpers for latest and historical prices
//!
//! ```text
//! ingest (pipeline, traits)
//!          │
//!          ▼
//!   storage-sqlite (this crate)
//!          │
//!          ▼
//!      SQLite DB
//! ```

pub mod db;
pub mod errors;
pub mod prices;
pub mod schema;

pub use db::{create_pool, get_connection, init, run_migrations, DbConnection, DbPool, WriteHandle};
pub use errors::{Result, StorageError};
pub use prices::SqlitePriceStore;
