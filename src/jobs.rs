//! Batch jobs behind the trigger surface.
//!
//! Each job is one short-lived invocation: claim work from the store, fan
//! out over the vendor API in fixed-size batches, write results, return a
//! JSON-serializable summary. Nothing survives in memory between runs; the
//! store carries all coordination state (`last_synced_at` claims, unique
//! keys, dedup windows).
//!
//! Per-unit failures are counted and logged, never propagated: one user
//! with a flaky vendor response must not sink the other nine in the batch.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;

use crate::config::AppConfig;
use crate::detector::CleaningDetector;
use crate::importer::{ImportOutcome, IncomingRecord, RecordImporter, SOURCE_CRON};
use crate::reconciler::{BalanceReconciler, SyncStatus, UserSyncResult};
use crate::store::models::{current_timestamp, User};
use crate::store::{Store, StoreError};
use crate::vendor::VendorApi;

/// `run_harvest` output, printed as the job's JSON summary.
#[derive(Debug, Default, Serialize)]
pub struct HarvestSummary {
    pub success: bool,
    /// Users actually worked on this run.
    pub processed: u32,
    /// New submission rows written.
    pub imported: u32,
    /// PENDING rows repaired to VERIFIED.
    pub verified: u32,
    /// Cleaning events detected along the way.
    pub cleanings: u32,
    /// Users whose fetch or import failed (they re-queue after cooldown).
    pub errors: u32,
    /// Users still waiting after this run's claim.
    pub remaining_in_queue: i64,
}

#[derive(Debug, Default, Serialize)]
pub struct CleaningScanSummary {
    pub success: bool,
    pub machines_scanned: u32,
    pub events_detected: u32,
    pub errors: u32,
}

#[derive(Debug, Default, Serialize)]
pub struct MachinePollSummary {
    pub success: bool,
    pub machines_checked: u32,
    pub cleaning_events_detected: u32,
    pub errors: u32,
}

#[derive(Debug, Serialize)]
pub struct BalanceSyncSummary {
    pub success: bool,
    pub matched: u32,
    pub risk_detected: u32,
    pub missing_records: u32,
    pub errors: u32,
    pub results: Vec<UserSyncResult>,
}

/// Pull the harvest queue: users never synced or past the cooldown, oldest
/// first, capped at `harvest_user_limit`. Each user is claimed (timestamp
/// stamped) before their vendor fetch starts, so an overlapping run skips
/// them rather than double-importing.
pub async fn run_harvest(
    store: &Store,
    vendor: Arc<dyn VendorApi>,
    config: &AppConfig,
) -> Result<HarvestSummary, StoreError> {
    let now = current_timestamp();
    let cutoff = now - config.sync_cooldown_hours * 3600;
    let queue = store.stale_users(cutoff, config.harvest_user_limit)?;
    let machines = Arc::new(store.machine_map()?);
    let importer = RecordImporter::new(
        store.clone(),
        CleaningDetector::new(config.detector.clone()),
    );

    let mut summary = HarvestSummary::default();
    log::info!("🚜 Harvest: {} users queued", queue.len());

    for chunk in queue.chunks(config.harvest_batch_size) {
        let mut tasks: JoinSet<(String, Result<ImportOutcome, String>)> = JoinSet::new();
        for user in chunk {
            // claim before you process
            store.claim_user_sync(&user.id, now)?;

            let vendor = vendor.clone();
            let importer = importer.clone();
            let machines = machines.clone();
            let user = user.clone();
            let page_size = config.harvest_page_size;
            tasks.spawn(async move {
                let outcome = harvest_user(&user, vendor, &importer, &machines, page_size).await;
                (user.id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((user_id, Ok(outcome))) => {
                    summary.processed += 1;
                    summary.imported += outcome.imported;
                    summary.verified += outcome.verified;
                    summary.cleanings += outcome.cleanings;
                    if outcome.imported > 0 || outcome.verified > 0 {
                        log::info!(
                            "📥 {}: {} imported, {} verified, {} cleanings",
                            user_id,
                            outcome.imported,
                            outcome.verified,
                            outcome.cleanings
                        );
                    }
                }
                Ok((user_id, Err(message))) => {
                    summary.processed += 1;
                    summary.errors += 1;
                    log::warn!("⚠️ {}: harvest failed: {}", user_id, message);
                }
                Err(e) => {
                    summary.errors += 1;
                    log::error!("❌ Harvest task panicked: {}", e);
                }
            }
        }
    }

    summary.remaining_in_queue = store.count_stale_users(cutoff)?;
    summary.success = true;
    Ok(summary)
}

async fn harvest_user(
    user: &User,
    vendor: Arc<dyn VendorApi>,
    importer: &RecordImporter,
    machines: &HashMap<String, crate::store::Machine>,
    page_size: u32,
) -> Result<ImportOutcome, String> {
    let records = vendor
        .fetch_disposal_records(&user.phone, page_size)
        .await
        .map_err(|e| e.to_string())?;

    let incoming: Vec<IncomingRecord> = records
        .iter()
        .filter_map(|r| IncomingRecord::from_vendor(r, SOURCE_CRON))
        .collect();

    importer
        .import_batch(user, incoming, machines)
        .map_err(|e| e.to_string())
}

/// Sweep every active machine's stored snapshot history for collection
/// events the incremental paths missed. Purely local, no vendor calls.
pub fn run_cleaning_scan(
    store: &Store,
    config: &AppConfig,
) -> Result<CleaningScanSummary, StoreError> {
    let detector = CleaningDetector::new(config.detector.clone());
    let machines = store.active_machines()?;
    let now = current_timestamp();

    let mut summary = CleaningScanSummary::default();
    for machine in &machines {
        match detector.scan_device_history(store, machine, now) {
            Ok(detected) => {
                summary.machines_scanned += 1;
                summary.events_detected += detected;
            }
            Err(e) => {
                summary.errors += 1;
                log::error!("❌ {}: history scan failed: {}", machine.device_no, e);
            }
        }
    }

    log::info!(
        "🧹 Rescan: {} machines, {} new events",
        summary.machines_scanned,
        summary.events_detected
    );
    summary.success = true;
    Ok(summary)
}

/// Poll live bin weights across the active fleet and run drop detection
/// per compartment. Device fetches fan out in harvest-sized batches.
pub async fn run_machine_poll(
    store: &Store,
    vendor: Arc<dyn VendorApi>,
    config: &AppConfig,
) -> Result<MachinePollSummary, StoreError> {
    let detector = CleaningDetector::new(config.detector.clone());
    let machines = store.active_machines()?;
    let now = current_timestamp();

    let mut summary = MachinePollSummary::default();
    for chunk in machines.chunks(config.harvest_batch_size) {
        let mut tasks: JoinSet<(String, Result<Vec<crate::vendor::BinPosition>, String>)> =
            JoinSet::new();
        for machine in chunk {
            let vendor = vendor.clone();
            let device_no = machine.device_no.clone();
            tasks.spawn(async move {
                let bins = vendor
                    .fetch_device_position(&device_no)
                    .await
                    .map_err(|e| e.to_string());
                (device_no, bins)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (device_no, bins) = match joined {
                Ok(result) => result,
                Err(e) => {
                    summary.errors += 1;
                    log::error!("❌ Poll task panicked: {}", e);
                    continue;
                }
            };
            let bins = match bins {
                Ok(bins) => bins,
                Err(message) => {
                    summary.errors += 1;
                    log::warn!("⚠️ {}: position fetch failed: {}", device_no, message);
                    continue;
                }
            };

            summary.machines_checked += 1;
            // re-read so the stored weights include this run's earlier syncs
            let Some(machine) = store.machine_by_device(&device_no)? else {
                continue;
            };
            for bin in &bins {
                match detector.check_live_weight(store, &machine, bin.position_no, bin.weight, now)
                {
                    Ok(true) => summary.cleaning_events_detected += 1,
                    Ok(false) => {}
                    Err(e) => {
                        summary.errors += 1;
                        log::error!(
                            "❌ {} pos {}: weight check failed: {}",
                            device_no,
                            bin.position_no,
                            e
                        );
                    }
                }
            }
        }
    }

    log::info!(
        "📡 Poll: {} machines, {} cleanings",
        summary.machines_checked,
        summary.cleaning_events_detected
    );
    summary.success = true;
    Ok(summary)
}

/// Reconcile every user's mirror balance against the vendor. Balance
/// fetches fan out in batches; store mutations stay on this task so each
/// correction commits before the next user is considered.
pub async fn run_balance_sync(
    store: &Store,
    vendor: Arc<dyn VendorApi>,
    config: &AppConfig,
) -> Result<BalanceSyncSummary, StoreError> {
    let reconciler = BalanceReconciler::new(store.clone(), config.dead_band);
    let users = store.all_users()?;
    let user_ids: Vec<String> = users.iter().map(|u| u.id.clone()).collect();
    let inputs = reconciler.load_mirror_inputs(&user_ids)?;
    let wallets = store.wallets_for_users(&user_ids)?;

    let mut results = Vec::with_capacity(users.len());
    for chunk in users.chunks(config.harvest_batch_size) {
        let mut tasks: JoinSet<(String, Result<f64, String>)> = JoinSet::new();
        for user in chunk {
            let vendor = vendor.clone();
            let user_id = user.id.clone();
            let phone = user.phone.clone();
            tasks.spawn(async move {
                let balance = vendor
                    .fetch_balance(&phone)
                    .await
                    .map_err(|e| e.to_string());
                (user_id, balance)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((user_id, Ok(vendor_balance))) => {
                    let user_inputs = inputs.get(&user_id).copied().unwrap_or_default();
                    results.push(reconciler.reconcile_user(
                        &user_id,
                        vendor_balance,
                        &user_inputs,
                        wallets.get(&user_id),
                    ));
                }
                Ok((user_id, Err(message))) => {
                    // never reconcile against a guessed balance
                    log::warn!("⚠️ {}: balance fetch failed: {}", user_id, message);
                    results.push(UserSyncResult::error(&user_id, message));
                }
                Err(e) => {
                    log::error!("❌ Balance task panicked: {}", e);
                }
            }
        }
    }

    let mut summary = BalanceSyncSummary {
        success: true,
        matched: 0,
        risk_detected: 0,
        missing_records: 0,
        errors: 0,
        results,
    };
    for result in &summary.results {
        match result.status {
            SyncStatus::Matched => summary.matched += 1,
            SyncStatus::RiskDetected => summary.risk_detected += 1,
            SyncStatus::MissingRecords => summary.missing_records += 1,
            SyncStatus::MissingWallet | SyncStatus::DbError | SyncStatus::Error => {
                summary.errors += 1
            }
        }
    }
    log::info!(
        "⚖️ Balance sync: {} matched, {} corrected, {} awaiting import, {} errors",
        summary.matched,
        summary.risk_detected,
        summary.missing_records,
        summary.errors
    );
    Ok(summary)
}
