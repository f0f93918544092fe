mod config;
mod main_lib;
mod scheduler;

use std::sync::Arc;

use cardprice_ingest::PriceQuery;
use config::{load_cards, Config};
use main_lib::{build_pipeline, init_tracing, open_store};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let config = Config::from_env()?;

    let cards = load_cards(&config.cards_path)?;
    tracing::info!("Loaded {} card(s) from {}", cards.len(), config.cards_path.display());
    let store = open_store(&config)?;
    let pipeline = Arc::new(build_pipeline(&config, Arc::clone(&store))?);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, cancelling in-flight refresh");
        }
        shutdown.cancel();
    });

    let retention = match config.retention_days {
        Some(days) => Some(tokio::spawn(scheduler::run_retention(
            store,
            days,
            cancel.clone(),
        ))),
        None => {
            tracing::info!("Price retention disabled, keeping every row");
            None
        }
    };

    scheduler::run(
        pipeline,
        PriceQuery::batch(cards),
        config.refresh_interval,
        cancel,
    )
    .await;

    if let Some(handle) = retention {
        handle.await?;
    }
    Ok(())
}
