//! Harvest Binary - Disposal Record Import Job
//!
//! Pulls each queued user's recent disposal records from the vendor cloud,
//! imports them idempotently, and runs cleaning detection per record.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin harvest
//! ```
//!
//! ## Environment Variables
//!
//! - MERCHANT_NO - Vendor merchant identifier (required)
//! - API_SECRET - Vendor signing secret (required)
//! - VENDOR_API_BASE - Vendor API base URL (default: https://api.autogcm.com)
//! - RVMFLOW_DB_PATH - SQLite database path (default: data/rvmflow.db)
//! - HARVEST_USER_LIMIT - Max users claimed per run (default: 50)
//! - HARVEST_BATCH_SIZE - Concurrent users per batch (default: 5)
//! - HARVEST_PAGE_SIZE - Records fetched per user (default: 50)
//! - SYNC_COOLDOWN_HOURS - Hours before a user re-queues (default: 2)
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

    log::info!("🚜 Starting record harvest");
    log::info!("   Vendor: {}", config.vendor_base_url);
    log::info!("   Database: {}", config.db_path);
    log::info!(
        "   Queue: up to {} users, {} concurrent",
        config.harvest_user_limit,
        config.harvest_batch_size
    );

    let store = Store::open(&config.db_path)?;
    let vendor = Arc::new(VendorClient::new(&config)?);

    let summary = jobs::run_harvest(&store, vendor, &config).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
