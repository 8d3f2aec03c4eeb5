//! Balance Sync Binary - Mirror Reconciliation Job
//!
//! Fetches each user's authoritative vendor balance and reconciles it
//! against the locally derived mirror. External spending is corrected with
//! a one-time wallet deduction plus ledger and sentinel rows.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin sync_balance
//! ```
//!
//! ## Environment Variables
//!
//! - MERCHANT_NO - Vendor merchant identifier (required)
//! - API_SECRET - Vendor signing secret (required)
//! - VENDOR_API_BASE - Vendor API base URL (default: https://api.autogcm.com)
//! - RVMFLOW_DB_PATH - SQLite database path (default: data/rvmflow.db)
//! - BALANCE_DEAD_BAND - Tolerated drift in points (default: 0.5)
//! - HARVEST_BATCH_SIZE - Concurrent balance fetches (default: 5)
//! - RUST_LOG - Logging level (optional, default: info)

use std::sync::Arc;

use rvmflow::config::AppConfig;
use rvmflow::jobs;
use rvmflow::store::Store;
use rvmflow::vendor::VendorClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    dotenv::dotenv().ok();

    let config = AppConfig::from_env()?;

    log::info!("⚖️ Starting balance sync");
    log::info!("   Vendor: {}", config.vendor_base_url);
    log::info!("   Database: {}", config.db_path);
    log::info!("   Dead band: ±{} pts", config.dead_band);

    let store = Store::open(&config.db_path)?;
    let vendor = Arc::new(VendorClient::new(&config)?);

    let summary = jobs::run_balance_sync(&store, vendor, &config).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
