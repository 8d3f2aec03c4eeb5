//! End-to-end flow over the real store with a mocked vendor cloud:
//! harvest → cleaning detection → webhook replay → balance reconciliation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use rvmflow::config::AppConfig;
use rvmflow::detector::{CleaningDetector, DetectorConfig};
use rvmflow::importer::RecordImporter;
use rvmflow::jobs;
use rvmflow::reconciler::SyncStatus;
use rvmflow::store::{Machine, ReviewStatus, Store, User};
use rvmflow::vendor::{BinPosition, VendorApi, VendorDisposalRecord, VendorError};
use rvmflow::webhook::WebhookHandler;

/// Canned vendor cloud. Phones listed in `failing` error out on every call,
/// standing in for timeouts and 5xx responses.
#[derive(Default)]
struct MockVendor {
    records: Mutex<HashMap<String, Vec<VendorDisposalRecord>>>,
    balances: Mutex<HashMap<String, f64>>,
    failing: Vec<String>,
}

impl MockVendor {
    fn fail_for(&self, phone: &str) -> Option<VendorError> {
        if self.failing.iter().any(|p| p == phone) {
            Some(VendorError::Api {
                endpoint: "/mock",
                code: 503,
                msg: "vendor unavailable".to_string(),
            })
        } else {
            None
        }
    }

    fn set_balance(&self, phone: &str, balance: f64) {
        self.balances
            .lock()
            .unwrap()
            .insert(phone.to_string(), balance);
    }
}

#[async_trait]
impl VendorApi for MockVendor {
    async fn fetch_balance(&self, phone: &str) -> Result<f64, VendorError> {
        if let Some(err) = self.fail_for(phone) {
            return Err(err);
        }
        self.balances
            .lock()
            .unwrap()
            .get(phone)
            .copied()
            .ok_or(VendorError::MalformedResponse("no balance for phone"))
    }

    async fn fetch_disposal_records(
        &self,
        phone: &str,
        _page_size: u32,
    ) -> Result<Vec<VendorDisposalRecord>, VendorError> {
        if let Some(err) = self.fail_for(phone) {
            return Err(err);
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(phone)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_device_position(
        &self,
        _device_no: &str,
    ) -> Result<Vec<BinPosition>, VendorError> {
        Ok(Vec::new())
    }
}

fn vendor_record(id: &str, time: &str, weight: f64, points: f64, bin: f64) -> VendorDisposalRecord {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "deviceNo": "dev-1",
        "weight": weight,
        "integral": points,
        "createTime": time,
        "positionWeight": bin,
        "rubbishLogDetailsVOList": [{"rubbishName": "PET bottle"}]
    }))
    .unwrap()
}

/// Vendor-format timestamp `h` hours in the past, so snapshots land inside
/// the rescan window.
fn hours_ago(h: i64) -> String {
    (chrono::Utc::now() - chrono::Duration::hours(h))
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn test_config() -> AppConfig {
    AppConfig {
        db_path: ":memory:".to_string(),
        vendor_base_url: "https://mock".to_string(),
        merchant_no: "m-1".to_string(),
        api_secret: "secret".to_string(),
        vendor_timeout_secs: 5,
        harvest_batch_size: 2,
        harvest_user_limit: 50,
        harvest_page_size: 50,
        sync_cooldown_hours: 2,
        dead_band: 0.5,
        detector: DetectorConfig::with_defaults(),
    }
}

fn seed_fleet(store: &Store) {
    store
        .upsert_machine(&Machine {
            device_no: "dev-1".to_string(),
            merchant_id: "merch-1".to_string(),
            name: "Lobby unit".to_string(),
            is_active: true,
            bin1_waste_type: Some("Plastic".to_string()),
            rate_plastic: 1.0,
            ..Machine::default()
        })
        .unwrap();
    store
        .upsert_user(&User {
            id: "u-1".to_string(),
            vendor_user_no: Some("vno-1".to_string()),
            phone: "0100".to_string(),
            nickname: Some("Aina".to_string()),
            last_synced_at: None,
        })
        .unwrap();
    store
        .upsert_user(&User {
            id: "u-2".to_string(),
            vendor_user_no: Some("vno-2".to_string()),
            phone: "0200".to_string(),
            nickname: None,
            last_synced_at: None,
        })
        .unwrap();
}

#[tokio::test]
async fn harvest_imports_detects_and_contains_failures() {
    let store = Store::open_in_memory().unwrap();
    seed_fleet(&store);
    let config = test_config();

    let vendor = Arc::new(MockVendor {
        failing: vec!["0200".to_string()],
        ..MockVendor::default()
    });
    vendor.records.lock().unwrap().insert(
        "0100".to_string(),
        vec![
            // loaded bin, then near-empty: one collection in between
            vendor_record("r-1", &hours_ago(6), 2.0, 2.0, 4.5),
            vendor_record("r-2", &hours_ago(2), 1.0, 1.0, 0.3),
        ],
    );

    let summary = jobs::run_harvest(&store, vendor.clone(), &config)
        .await
        .unwrap();
    assert!(summary.success);
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.imported, 2);
    // u-2's vendor failure is contained, not batch-fatal
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.remaining_in_queue, 0);

    let row = store.submission_by_vendor_id("r-1").unwrap().unwrap();
    assert_eq!(row.status, ReviewStatus::Verified);
    assert_eq!(row.calculated_value, 2.0);

    // both snapshots arrived in one page, so the window closes in the
    // historical rescan rather than the incremental path
    let scan = jobs::run_cleaning_scan(&store, &config).unwrap();
    assert_eq!(scan.events_detected, 1);

    let cleanings = store.cleanings_for_device("dev-1").unwrap();
    assert_eq!(cleanings.len(), 1);
    assert_eq!(cleanings[0].bag_weight_collected, 4.5);

    // both users are claimed: an immediate overlapping run finds no work
    let overlap = jobs::run_harvest(&store, vendor.clone(), &config)
        .await
        .unwrap();
    assert_eq!(overlap.processed, 0);

    // after the cooldown the same page replays without any new writes
    let mut requeue = test_config();
    requeue.sync_cooldown_hours = -1;
    let replay = jobs::run_harvest(&store, vendor, &requeue).await.unwrap();
    assert_eq!(replay.processed, 2);
    assert_eq!(replay.imported, 0);
    assert_eq!(replay.cleanings, 0);
    assert_eq!(store.submission_count().unwrap(), 2);

    // the rescan is idempotent too
    let rescan = jobs::run_cleaning_scan(&store, &config).unwrap();
    assert_eq!(rescan.events_detected, 0);
    assert_eq!(store.cleaning_count().unwrap(), 1);
}

#[tokio::test]
async fn webhook_and_harvest_share_one_record_identity() {
    let store = Store::open_in_memory().unwrap();
    seed_fleet(&store);
    let config = test_config();

    // the push arrives first
    let handler = WebhookHandler::new(
        store.clone(),
        RecordImporter::new(store.clone(), CleaningDetector::with_defaults()),
    );
    handler
        .handle(&serde_json::json!({
            "type": "PUT",
            "deviceNo": "dev-1",
            "putId": "r-9",
            "userId": "vno-1",
            "totalWeight": 1.5,
            "integral": 1.5,
            "positionWeight": 2.0,
            "createTime": "2025-03-14 09:00:00",
            "rubbishLogDetailsVOList": [{"rubbishName": "PET bottle"}]
        }))
        .unwrap();
    assert_eq!(store.submission_count().unwrap(), 1);

    // the periodic pull then lists the same record
    let vendor = Arc::new(MockVendor::default());
    vendor.records.lock().unwrap().insert(
        "0100".to_string(),
        vec![vendor_record("r-9", "2025-03-14 09:00:00", 1.5, 1.5, 2.0)],
    );
    let summary = jobs::run_harvest(&store, vendor, &config).await.unwrap();
    assert_eq!(summary.imported, 0);
    assert_eq!(store.submission_count().unwrap(), 1);

    let row = store.submission_by_vendor_id("r-9").unwrap().unwrap();
    assert_eq!(row.source, "WEBHOOK");
    assert_eq!(row.user_id.as_deref(), Some("u-1"));
}

#[tokio::test]
async fn balance_sync_corrects_once_and_converges() {
    let store = Store::open_in_memory().unwrap();
    seed_fleet(&store);
    let config = test_config();

    // harvest first so u-1 holds 3.0 pts of verified earnings
    let vendor = Arc::new(MockVendor {
        failing: vec!["0200".to_string()],
        ..MockVendor::default()
    });
    vendor.records.lock().unwrap().insert(
        "0100".to_string(),
        vec![
            vendor_record("r-1", "2025-03-14 08:00:00", 2.0, 2.0, 4.5),
            vendor_record("r-2", "2025-03-14 12:00:00", 1.0, 1.0, 0.3),
        ],
    );
    jobs::run_harvest(&store, vendor.clone(), &config)
        .await
        .unwrap();
    store.create_wallet("u-1", "merch-1", 3.0).unwrap();

    // the user spent 1.5 pts in the vendor app
    vendor.set_balance("0100", 1.5);
    let summary = jobs::run_balance_sync(&store, vendor.clone(), &config)
        .await
        .unwrap();
    assert_eq!(summary.risk_detected, 1);
    assert_eq!(summary.errors, 1); // u-2's fetch failure, reported not fatal

    let corrected = summary
        .results
        .iter()
        .find(|r| r.user_id == "u-1")
        .unwrap();
    assert_eq!(corrected.status, SyncStatus::RiskDetected);
    assert_eq!(corrected.adjustment, Some(1.5));

    let wallet = store.wallet_for_user("u-1").unwrap().unwrap();
    assert_eq!(wallet.current_balance, 1.5);
    assert_eq!(store.ledger_for_user("u-1").unwrap().len(), 1);
    assert_eq!(store.withdrawals_for_user("u-1").unwrap().len(), 1);

    // unchanged vendor balance: the correction must not reapply
    let again = jobs::run_balance_sync(&store, vendor, &config)
        .await
        .unwrap();
    let settled = again.results.iter().find(|r| r.user_id == "u-1").unwrap();
    assert_eq!(settled.status, SyncStatus::Matched);
    assert_eq!(store.ledger_for_user("u-1").unwrap().len(), 1);
    assert_eq!(
        store.wallet_for_user("u-1").unwrap().unwrap().current_balance,
        1.5
    );
}
