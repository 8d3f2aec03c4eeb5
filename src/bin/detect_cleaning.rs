//! Cleaning Rescan Binary - Historical Weight Sweep
//!
//! Walks each active machine's stored bin-weight snapshots and records any
//! collection events the incremental paths missed. Safe to re-run: the
//! time-window dedup makes a full rescan converge on the same result set.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin detect_cleaning
//! ```
//!
//! ## Environment Variables
//!
//! - MERCHANT_NO - Vendor merchant identifier (required)
//! - API_SECRET - Vendor signing secret (required)
//! - RVMFLOW_DB_PATH - SQLite database path (default: data/rvmflow.db)
//! - RESCAN_WINDOW_HOURS - Snapshot history depth (default: 24)
//! - CLEANING_FULL_THRESHOLD_KG - Loaded-bin threshold (default: 0.5)
//! - CLEANING_EMPTY_THRESHOLD_KG - Emptied threshold (default: 1.0)
//! - UCO_EMPTY_THRESHOLD_KG - Emptied threshold, UCO tanks (default: 2.0)
//! - UCO_DEVICES - Comma-separated UCO device numbers
//! - RUST_LOG - Logging level (optional, default: info)

use rvmflow::config::AppConfig;
use rvmflow::jobs;
use rvmflow::store::Store;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    dotenv::dotenv().ok();

    let config = AppConfig::from_env()?;

    log::info!("🧹 Starting cleaning rescan");
    log::info!("   Database: {}", config.db_path);
    log::info!("   Window: {}h", config.detector.rescan_window_hours);

    let store = Store::open(&config.db_path)?;

    let summary = jobs::run_cleaning_scan(&store, &config)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
