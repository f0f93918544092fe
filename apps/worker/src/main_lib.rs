use std::sync::Arc;

use anyhow::{bail, Context};
use cardprice_ingest::{
    IngestConfig, IngestionPipeline, JustTcgClient, PriceChartingClient, PriceSource, SourceClient,
};
use cardprice_storage_sqlite::SqlitePriceStore;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

/// Install the global subscriber. `log` records from the library crates are
/// bridged through `tracing-log`.
pub fn init_tracing() {
    let log_format = std::env::var("CARDPRICE_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if log_format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .init();
    }
}

/// Clients for every source that has an API key configured.
pub fn build_clients(config: &Config) -> Vec<Arc<dyn SourceClient>> {
    let mut clients: Vec<Arc<dyn SourceClient>> = Vec::new();
    if let Some(key) = &config.justtcg_api_key {
        clients.push(Arc::new(JustTcgClient::new(key.clone())));
    }
    if let Some(key) = &config.pricecharting_api_key {
        clients.push(Arc::new(PriceChartingClient::new(key.clone())));
    }
    clients
}

pub fn load_ingest_config(config: &Config) -> anyhow::Result<IngestConfig> {
    match &config.ingest_config_path {
        Some(path) => IngestConfig::load(path)
            .with_context(|| format!("Failed to load ingest config {}", path.display())),
        None => Ok(IngestConfig::default()),
    }
}

pub fn open_store(config: &Config) -> anyhow::Result<Arc<SqlitePriceStore>> {
    let store = SqlitePriceStore::open(&config.db_path)
        .with_context(|| format!("Failed to open price database {}", config.db_path))?;
    tracing::info!("Database path in use: {}", config.db_path);
    Ok(Arc::new(store))
}

pub fn build_pipeline(
    config: &Config,
    store: Arc<SqlitePriceStore>,
) -> anyhow::Result<IngestionPipeline> {
    let clients = build_clients(config);
    if clients.is_empty() {
        bail!(
            "No price source configured: set CARDPRICE_JUSTTCG_API_KEY or CARDPRICE_PRICECHARTING_API_KEY"
        );
    }

    let mut ingest_config = load_ingest_config(config)?;
    for client in &clients {
        ingest_config.ensure_source(client.source());
    }

    let pipeline = clients
        .into_iter()
        .fold(IngestionPipeline::from_config(&ingest_config, store), |pipeline, client| {
            pipeline.with_client(client)
        });

    let sources: Vec<&'static str> = pipeline
        .available_sources()
        .iter()
        .map(PriceSource::as_str)
        .collect();
    tracing::info!("Price sources enabled: {}", sources.join(", "));

    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn config(dir: &tempfile::TempDir) -> Config {
        Config {
            db_path: dir.path().join("prices.db").to_string_lossy().into_owned(),
            ingest_config_path: None,
            cards_path: PathBuf::from("cards.json"),
            refresh_interval: Duration::from_secs(60),
            retention_days: Some(90),
            justtcg_api_key: None,
            pricecharting_api_key: None,
        }
    }

    #[test]
    fn test_build_clients_follows_api_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        assert!(build_clients(&config).is_empty());

        config.pricecharting_api_key = Some("pc".to_string());
        let sources: Vec<_> = build_clients(&config).iter().map(|c| c.source()).collect();
        assert_eq!(sources, vec![PriceSource::PriceCharting]);
    }

    #[tokio::test]
    async fn test_build_pipeline_requires_a_source() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let store = open_store(&config).unwrap();
        assert!(build_pipeline(&config, store).is_err());
    }

    #[tokio::test]
    async fn test_build_pipeline_registers_configured_sources() {
        let dir = tempfile::tempdir().unwrap();
        let ingest_path = dir.path().join("ingest.toml");
        std::fs::write(
            &ingest_path,
            "fetch_timeout = 10\n\n[[sources]]\nname = \"justtcg\"\nrequests_per_window = 10\n",
        )
        .unwrap();

        let mut config = config(&dir);
        config.ingest_config_path = Some(ingest_path);
        config.justtcg_api_key = Some("jt".to_string());
        config.pricecharting_api_key = Some("pc".to_string());

        let store = open_store(&config).unwrap();
        let pipeline = build_pipeline(&config, store).unwrap();
        assert_eq!(
            pipeline.available_sources(),
            vec![PriceSource::JustTcg, PriceSource::PriceCharting]
        );
        let justtcg = pipeline.registry().get(PriceSource::JustTcg).unwrap();
        assert_eq!(justtcg.config().requests_per_window, 10);
    }
}
