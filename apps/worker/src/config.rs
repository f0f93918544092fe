//! Worker settings from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use cardprice_ingest::CardRef;

const DEFAULT_DB_PATH: &str = "./data/cardprice.db";
const DEFAULT_CARDS_PATH: &str = "./cards.json";
const DEFAULT_REFRESH_SECS: u64 = 60 * 60;
const DEFAULT_RETENTION_DAYS: u32 = 90;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub db_path: String,
    /// Optional TOML file with per-source resilience settings.
    pub ingest_config_path: Option<PathBuf>,
    /// JSON array of cards to refresh.
    pub cards_path: PathBuf,
    pub refresh_interval: Duration,
    /// Price rows untouched for this many days are pruned. `None` keeps everything.
    pub retention_days: Option<u32>,
    pub justtcg_api_key: Option<String>,
    pub pricecharting_api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let refresh_secs = match non_empty("CARDPRICE_REFRESH_SECS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("CARDPRICE_REFRESH_SECS must be whole seconds, got '{}'", raw))?,
            None => DEFAULT_REFRESH_SECS,
        };
        if refresh_secs == 0 {
            bail!("CARDPRICE_REFRESH_SECS must be positive");
        }

        let retention_days = match non_empty("CARDPRICE_RETENTION_DAYS") {
            Some(raw) => raw.trim().parse::<u32>().with_context(|| {
                format!("CARDPRICE_RETENTION_DAYS must be whole days, got '{}'", raw)
            })?,
            None => DEFAULT_RETENTION_DAYS,
        };

        Ok(Self {
            db_path: non_empty("CARDPRICE_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            ingest_config_path: non_empty("CARDPRICE_CONFIG").map(PathBuf::from),
            cards_path: non_empty("CARDPRICE_CARDS")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CARDS_PATH)),
            refresh_interval: Duration::from_secs(refresh_secs),
            retention_days: (retention_days > 0).then_some(retention_days),
            justtcg_api_key: non_empty("CARDPRICE_JUSTTCG_API_KEY"),
            pricecharting_api_key: non_empty("CARDPRICE_PRICECHARTING_API_KEY"),
        })
    }
}

/// Read the card list, a JSON array of `{"cardId", "game", "externalIds"}` objects.
pub fn load_cards(path: &Path) -> anyhow::Result<Vec<CardRef>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read card list {}", path.display()))?;
    let cards: Vec<CardRef> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse card list {}", path.display()))?;
    if cards.is_empty() {
        bail!("Card list {} is empty", path.display());
    }
    Ok(cards)
}
