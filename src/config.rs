use std::env;

use crate::detector::DetectorConfig;

/// Runtime configuration shared by every job binary.
///
/// Required variables: `MERCHANT_NO`, `API_SECRET`. Everything else has a
/// production default.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite database path (`RVMFLOW_DB_PATH`).
    pub db_path: String,
    /// Vendor cloud base URL (`VENDOR_API_BASE`).
    pub vendor_base_url: String,
    /// Merchant identifier sent in the `merchant-no` header.
    pub merchant_no: String,
    /// Shared secret used for request signing. Never logged.
    pub api_secret: String,
    /// Per-request timeout for vendor calls, in seconds.
    pub vendor_timeout_secs: u64,
    /// Users fetched concurrently per harvest batch.
    pub harvest_batch_size: usize,
    /// Max users claimed per harvest run.
    pub harvest_user_limit: u32,
    /// Disposal records requested per user.
    pub harvest_page_size: u32,
    /// Hours a user stays off the harvest queue after a sync.
    pub sync_cooldown_hours: i64,
    /// Balance drift tolerated before the reconciler reacts, in points.
    pub dead_band: f64,
    pub detector: DetectorConfig,
}

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let merchant_no = env::var("MERCHANT_NO")
            .map_err(|_| ConfigError::MissingVariable("MERCHANT_NO".to_string()))?;

        let api_secret = env::var("API_SECRET")
            .map_err(|_| ConfigError::MissingVariable("API_SECRET".to_string()))?;

        let vendor_base_url =
            env::var("VENDOR_API_BASE").unwrap_or_else(|_| "https://api.autogcm.com".to_string());

        if !vendor_base_url.starts_with("http://") && !vendor_base_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "VENDOR_API_BASE must start with http:// or https://".to_string(),
            ));
        }

        let db_path =
            env::var("RVMFLOW_DB_PATH").unwrap_or_else(|_| "data/rvmflow.db".to_string());

        let vendor_timeout_secs = env::var("VENDOR_TIMEOUT_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse::<u64>()
            .unwrap_or(5);

        let harvest_batch_size = env::var("HARVEST_BATCH_SIZE")
            .unwrap_or_else(|_| "5".to_string())
            .parse::<usize>()
            .unwrap_or(5)
            .max(1);

        let harvest_user_limit = env::var("HARVEST_USER_LIMIT")
            .unwrap_or_else(|_| "50".to_string())
            .parse::<u32>()
            .unwrap_or(50);

        let harvest_page_size = env::var("HARVEST_PAGE_SIZE")
            .unwrap_or_else(|_| "50".to_string())
            .parse::<u32>()
            .unwrap_or(50);

        let sync_cooldown_hours = env::var("SYNC_COOLDOWN_HOURS")
            .unwrap_or_else(|_| "2".to_string())
            .parse::<i64>()
            .unwrap_or(2);

        let dead_band = env::var("BALANCE_DEAD_BAND")
            .unwrap_or_else(|_| "0.5".to_string())
            .parse::<f64>()
            .unwrap_or(0.5);

        Ok(Self {
            db_path,
            vendor_base_url,
            merchant_no,
            api_secret,
            vendor_timeout_secs,
            harvest_batch_size,
            harvest_user_limit,
            harvest_page_size,
            sync_cooldown_hours,
            dead_band,
            detector: DetectorConfig::from_env(),
        })
    }
}
