//! Integration tests for `SqlitePriceStore` against a temporary database.

use cardprice_ingest::{Condition, PriceRecord, PriceSource, PriceStore};
use cardprice_storage_sqlite::SqlitePriceStore;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tempfile::TempDir;

fn open_store() -> (TempDir, SqlitePriceStore) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data").join("prices.db");
    let store = SqlitePriceStore::open(path.to_str().unwrap()).unwrap();
    (dir, store)
}

fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, day, 12, 0, 0).unwrap()
}

fn record(card_id: i64, source: PriceSource, day: u32, price: Decimal) -> PriceRecord {
    PriceRecord {
        card_id,
        source,
        market_price: price,
        price_low: price,
        price_high: price,
        condition: Condition::NearMint,
        currency: "USD".to_string(),
        timestamp: at(day),
    }
}

#[tokio::test]
async fn test_upsert_is_idempotent_on_natural_key() {
    let (_dir, store) = open_store();
    let batch = vec![
        record(1, PriceSource::JustTcg, 1, dec!(4.99)),
        record(2, PriceSource::JustTcg, 1, dec!(12.00)),
    ];

    assert_eq!(store.upsert_batch(&batch).await.unwrap(), 2);
    assert_eq!(store.upsert_batch(&batch).await.unwrap(), 2);
    assert_eq!(store.count().unwrap(), 2);
}

#[tokio::test]
async fn test_conflict_refreshes_prices_and_keeps_created_at() {
    let (_dir, store) = open_store();
    store
        .upsert_batch(&[record(7, PriceSource::Ebay, 3, dec!(10))])
        .await
        .unwrap();
    let first = store.latest_for_card(7, None).unwrap().unwrap();

    let mut refreshed = record(7, PriceSource::Ebay, 3, dec!(11.25));
    refreshed.price_high = dec!(14);
    store.upsert_batch(&[refreshed.clone()]).await.unwrap();

    let second = store.latest_for_card(7, None).unwrap().unwrap();
    assert_eq!(store.count().unwrap(), 1);
    assert_eq!(second.record, refreshed);
    assert_eq!(second.created_at, first.created_at);
    assert!(second.updated_at >= first.updated_at);
}

#[tokio::test]
async fn test_condition_and_source_are_part_of_the_key() {
    let (_dir, store) = open_store();
    let mut played = record(1, PriceSource::Cardmarket, 1, dec!(2));
    played.condition = Condition::HeavilyPlayed;

    store
        .upsert_batch(&[
            record(1, PriceSource::Cardmarket, 1, dec!(3)),
            played,
            record(1, PriceSource::TcgPlayer, 1, dec!(3)),
        ])
        .await
        .unwrap();
    assert_eq!(store.count().unwrap(), 3);
}

#[tokio::test]
async fn test_history_and_latest_queries() {
    let (_dir, store) = open_store();
    store
        .upsert_batch(&[
            record(5, PriceSource::JustTcg, 3, dec!(3)),
            record(5, PriceSource::JustTcg, 1, dec!(1)),
            record(5, PriceSource::PriceCharting, 2, dec!(2)),
            record(6, PriceSource::JustTcg, 9, dec!(99)),
        ])
        .await
        .unwrap();

    let history = store.history_for_card(5, None).unwrap();
    let prices: Vec<_> = history.iter().map(|p| p.record.market_price).collect();
    assert_eq!(prices, vec![dec!(1), dec!(2), dec!(3)]);

    let latest = store.latest_for_card(5, None).unwrap().unwrap();
    assert_eq!(latest.record.timestamp, at(3));

    let latest_pc = store
        .latest_for_card(5, Some(PriceSource::PriceCharting))
        .unwrap()
        .unwrap();
    assert_eq!(latest_pc.record.market_price, dec!(2));

    assert!(store.latest_for_card(404, None).unwrap().is_none());
    assert_eq!(
        store.history_for_card(5, Some(PriceSource::JustTcg)).unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_large_batch_is_written_in_one_call() {
    let (_dir, store) = open_store();
    let batch: Vec<_> = (1..=2_500)
        .map(|card_id| record(card_id, PriceSource::Manual, 1, dec!(1)))
        .collect();

    assert_eq!(store.upsert_batch(&batch).await.unwrap(), 2_500);
    assert_eq!(store.count().unwrap(), 2_500);
}

#[tokio::test]
async fn test_empty_batch_is_a_no_op() {
    let (_dir, store) = open_store();
    assert_eq!(store.upsert_batch(&[]).await.unwrap(), 0);
    assert_eq!(store.count().unwrap(), 0);
}

#[tokio::test]
async fn test_reopening_keeps_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("prices.db");
    let path = path.to_str().unwrap();

    {
        let store = SqlitePriceStore::open(path).unwrap();
        store
            .upsert_batch(&[record(1, PriceSource::Ebay, 1, dec!(5))])
            .await
            .unwrap();
    }

    let store = SqlitePriceStore::open(path).unwrap();
    assert_eq!(store.count().unwrap(), 1);
}

#[tokio::test]
async fn test_delete_before_prunes_rows_written_earlier() {
    let (_dir, store) = open_store();
    store
        .upsert_batch(&[
            record(1, PriceSource::JustTcg, 1, dec!(1)),
            record(2, PriceSource::JustTcg, 2, dec!(2)),
        ])
        .await
        .unwrap();

    let week_ago = Utc::now() - chrono::Duration::days(7);
    assert_eq!(store.delete_before(week_ago).await.unwrap(), 0);
    assert_eq!(store.count().unwrap(), 2);

    let later = Utc::now() + chrono::Duration::seconds(1);
    assert_eq!(store.delete_before(later).await.unwrap(), 2);
    assert_eq!(store.count().unwrap(), 0);
}

#[tokio::test]
async fn test_batch_with_repeated_key_keeps_last_row() {
    let (_dir, store) = open_store();
    let first = record(3, PriceSource::Manual, 4, dec!(1.50));
    let second = record(3, PriceSource::Manual, 4, dec!(1.75));

    assert_eq!(store.upsert_batch(&[first, second.clone()]).await.unwrap(), 2);
    assert_eq!(store.count().unwrap(), 1);
    assert_eq!(store.latest_for_card(3, None).unwrap().unwrap().record, second);
}
