//! Machine Poll Binary - Live Bin Weight Sampling
//!
//! Queries the vendor position API for every active machine, syncs the
//! stored bin weights, and runs drop detection per compartment.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin poll_machines
//! ```
//!
//! ## Environment Variables
//!
//! - MERCHANT_NO - Vendor merchant identifier (required)
//! - API_SECRET - Vendor signing secret (required)
//! - VENDOR_API_BASE - Vendor API base URL (default: https://api.autogcm.com)
//! - RVMFLOW_DB_PATH - SQLite database path (default: data/rvmflow.db)
//! - VENDOR_TIMEOUT_SECS - Per-request timeout (default: 5)
//! - POLL_DEDUP_WINDOW_SECS - Repeat-drop dedup horizon (default: 2700)
//! - WEIGHT_SYNC_EPSILON_KG - Minimum movement worth persisting (default: 0.05)
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

    log::info!("📡 Starting machine poll");
    log::info!("   Vendor: {}", config.vendor_base_url);
    log::info!("   Database: {}", config.db_path);

    let store = Store::open(&config.db_path)?;
    let vendor = Arc::new(VendorClient::new(&config)?);

    let summary = jobs::run_machine_poll(&store, vendor, &config).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
