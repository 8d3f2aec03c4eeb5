//! Wallet balance reconciliation.
//!
//! The vendor's app balance is authoritative: users spend points in the
//! vendor app where this system cannot see individual transactions. The
//! local mirror is rebuilt from first principles every run:
//!
//! ```text
//! mirror = sum(verified earnings) + sum(external ledger entries)
//! ```
//!
//! Only the ledger carries past corrections, and each correction is written
//! to the ledger exactly once, so the mirror converges onto the vendor
//! balance instead of drifting further per run. Sentinel withdrawal rows
//! exist for reporting only and never feed back into the formula.

use std::collections::HashMap;

use serde::Serialize;

use crate::store::models::{current_timestamp, round2, Wallet};
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    /// Vendor and mirror agree within the dead band.
    Matched,
    /// Vendor is lower: external spending detected and corrected.
    RiskDetected,
    /// Vendor is higher: earnings not harvested yet. Never corrected here;
    /// the importer will close the gap.
    MissingRecords,
    /// Correction needed but the user holds no mirror wallet.
    MissingWallet,
    /// Correction attempted but the write failed.
    DbError,
    /// Vendor balance could not be fetched.
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserSyncResult {
    pub user_id: String,
    pub status: SyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_balance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror_balance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjustment: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl UserSyncResult {
    pub fn error(user_id: &str, message: String) -> Self {
        Self {
            user_id: user_id.to_string(),
            status: SyncStatus::Error,
            vendor_balance: None,
            mirror_balance: None,
            adjustment: None,
            message: Some(message),
        }
    }
}

/// Mirror formula inputs, bulk-loadable for a whole batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct MirrorInputs {
    pub verified_earnings: f64,
    pub external_ledger: f64,
}

pub struct BalanceReconciler {
    store: Store,
    /// Drift tolerated before any reaction, in points. Covers vendor-side
    /// rounding of fractional awards.
    dead_band: f64,
}

impl BalanceReconciler {
    pub fn new(store: Store, dead_band: f64) -> Self {
        Self { store, dead_band }
    }

    pub fn mirror_balance(inputs: &MirrorInputs) -> f64 {
        round2(inputs.verified_earnings + inputs.external_ledger)
    }

    /// Two grouped queries instead of 2N point lookups.
    pub fn load_mirror_inputs(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, MirrorInputs>, StoreError> {
        let earnings = self.store.sum_verified_values(user_ids)?;
        let ledgers = self.store.sum_external_ledgers(user_ids)?;
        let mut map = HashMap::with_capacity(user_ids.len());
        for id in user_ids {
            map.insert(
                id.clone(),
                MirrorInputs {
                    verified_earnings: earnings.get(id).copied().unwrap_or(0.0),
                    external_ledger: ledgers.get(id).copied().unwrap_or(0.0),
                },
            );
        }
        Ok(map)
    }

    /// Compare one user's vendor balance against the mirror and react.
    /// The wallet comes pre-resolved (batch runs bulk-load them via
    /// `wallets_for_users`). Mutates the store only on the RiskDetected
    /// path; every other outcome is read-only.
    pub fn reconcile_user(
        &self,
        user_id: &str,
        vendor_balance: f64,
        inputs: &MirrorInputs,
        wallet: Option<&Wallet>,
    ) -> UserSyncResult {
        let mirror = Self::mirror_balance(inputs);
        let difference = round2(vendor_balance - mirror);

        let base = UserSyncResult {
            user_id: user_id.to_string(),
            status: SyncStatus::Matched,
            vendor_balance: Some(vendor_balance),
            mirror_balance: Some(mirror),
            adjustment: None,
            message: None,
        };

        if difference < -self.dead_band {
            // user spent in the vendor app; pull the mirror down once
            let Some(wallet) = wallet else {
                log::warn!("⚠️ {}: {:.2} pts external spend but no wallet", user_id, -difference);
                return UserSyncResult {
                    status: SyncStatus::MissingWallet,
                    message: Some("no mirror wallet to correct".to_string()),
                    ..base
                };
            };

            match self
                .store
                .apply_external_deduction(wallet, difference, current_timestamp())
            {
                Ok(new_balance) => {
                    log::info!(
                        "💰 {}: external spend {:.2} pts, wallet {:.2} -> {:.2}",
                        user_id,
                        -difference,
                        wallet.current_balance,
                        new_balance
                    );
                    UserSyncResult {
                        status: SyncStatus::RiskDetected,
                        adjustment: Some(-difference),
                        message: Some(format!("{:.2} pts spent externally; mirror corrected", -difference)),
                        ..base
                    }
                }
                Err(e) => {
                    log::error!("❌ {}: deduction failed: {}", user_id, e);
                    UserSyncResult {
                        status: SyncStatus::DbError,
                        message: Some(e.to_string()),
                        ..base
                    }
                }
            }
        } else if difference > self.dead_band {
            UserSyncResult {
                status: SyncStatus::MissingRecords,
                message: Some(format!(
                    "mirror behind vendor by {:.2} pts; awaiting record import",
                    difference
                )),
                ..base
            }
        } else {
            base
        }
    }

    /// Single-user form loading its own inputs and wallet.
    pub fn reconcile_single(
        &self,
        user_id: &str,
        vendor_balance: f64,
    ) -> Result<UserSyncResult, StoreError> {
        let inputs = MirrorInputs {
            verified_earnings: self.store.sum_verified_value(user_id)?,
            external_ledger: self.store.sum_external_ledger(user_id)?,
        };
        let wallet = self.store.wallet_for_user(user_id)?;
        Ok(self.reconcile_user(user_id, vendor_balance, &inputs, wallet.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{NewSubmission, ReviewStatus};
    use crate::store::EXTERNAL_SYNC_MARKER;

    fn seed_earnings(store: &Store, user_id: &str, vendor_id: &str, value: f64) {
        store
            .insert_submissions(&[NewSubmission {
                vendor_record_id: vendor_id.to_string(),
                user_id: Some(user_id.to_string()),
                phone: None,
                device_no: "dev-1".to_string(),
                waste_type: "Plastic".to_string(),
                weight: 1.0,
                calculated_value: value,
                machine_points: value,
                status: ReviewStatus::Verified,
                bin_weight_snapshot: 2.0,
                photo_url: None,
                source: "CRON_JOB".to_string(),
                submitted_at: 1_000,
            }])
            .unwrap();
    }

    #[test]
    fn matched_inside_dead_band() {
        let store = Store::open_in_memory().unwrap();
        seed_earnings(&store, "u-1", "r-1", 100.0);
        let recon = BalanceReconciler::new(store.clone(), 0.5);

        // exactly on the band edge still matches
        let result = recon.reconcile_single("u-1", 99.5).unwrap();
        assert_eq!(result.status, SyncStatus::Matched);
        assert_eq!(result.mirror_balance, Some(100.0));

        let result = recon.reconcile_single("u-1", 100.5).unwrap();
        assert_eq!(result.status, SyncStatus::Matched);
    }

    #[test]
    fn vendor_ahead_reports_missing_records_without_mutation() {
        let store = Store::open_in_memory().unwrap();
        seed_earnings(&store, "u-1", "r-1", 50.0);
        store.create_wallet("u-1", "m-1", 50.0).unwrap();
        let recon = BalanceReconciler::new(store.clone(), 0.5);

        let result = recon.reconcile_single("u-1", 80.0).unwrap();
        assert_eq!(result.status, SyncStatus::MissingRecords);

        // no correction of any kind may be written
        assert_eq!(store.wallet_for_user("u-1").unwrap().unwrap().current_balance, 50.0);
        assert!(store.ledger_for_user("u-1").unwrap().is_empty());
        assert!(store.withdrawals_for_user("u-1").unwrap().is_empty());
    }

    #[test]
    fn external_spend_corrects_mirror_once() {
        let store = Store::open_in_memory().unwrap();
        seed_earnings(&store, "u-1", "r-1", 150.0);
        store.create_wallet("u-1", "m-1", 150.0).unwrap();
        let recon = BalanceReconciler::new(store.clone(), 0.5);

        let result = recon.reconcile_single("u-1", 100.0).unwrap();
        assert_eq!(result.status, SyncStatus::RiskDetected);
        assert_eq!(result.adjustment, Some(50.0));
        assert_eq!(result.mirror_balance, Some(150.0));

        let wallet = store.wallet_for_user("u-1").unwrap().unwrap();
        assert_eq!(wallet.current_balance, 100.0);

        let ledger = store.ledger_for_user("u-1").unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].amount, -50.0);

        let withdrawals = store.withdrawals_for_user("u-1").unwrap();
        assert_eq!(withdrawals.len(), 1);
        assert_eq!(withdrawals[0].status, EXTERNAL_SYNC_MARKER);

        // second run with the same vendor balance: ledger already explains
        // the gap, mirror = 150 - 50 = 100, nothing more to deduct
        let again = recon.reconcile_single("u-1", 100.0).unwrap();
        assert_eq!(again.status, SyncStatus::Matched);
        assert_eq!(again.mirror_balance, Some(100.0));
        assert_eq!(store.ledger_for_user("u-1").unwrap().len(), 1);
        assert_eq!(store.withdrawals_for_user("u-1").unwrap().len(), 1);
    }

    #[test]
    fn missing_wallet_blocks_correction() {
        let store = Store::open_in_memory().unwrap();
        seed_earnings(&store, "u-1", "r-1", 150.0);
        let recon = BalanceReconciler::new(store.clone(), 0.5);

        let result = recon.reconcile_single("u-1", 100.0).unwrap();
        assert_eq!(result.status, SyncStatus::MissingWallet);
        assert!(store.ledger_for_user("u-1").unwrap().is_empty());
    }

    #[test]
    fn further_spending_keeps_converging() {
        let store = Store::open_in_memory().unwrap();
        seed_earnings(&store, "u-1", "r-1", 150.0);
        store.create_wallet("u-1", "m-1", 150.0).unwrap();
        let recon = BalanceReconciler::new(store.clone(), 0.5);

        recon.reconcile_single("u-1", 100.0).unwrap();
        // user spends another 25.4 pts in the vendor app
        let result = recon.reconcile_single("u-1", 74.6).unwrap();
        assert_eq!(result.status, SyncStatus::RiskDetected);
        assert_eq!(result.adjustment, Some(25.4));

        let wallet = store.wallet_for_user("u-1").unwrap().unwrap();
        assert_eq!(wallet.current_balance, 74.6);
        assert_eq!(store.ledger_for_user("u-1").unwrap().len(), 2);

        let settled = recon.reconcile_single("u-1", 74.6).unwrap();
        assert_eq!(settled.status, SyncStatus::Matched);
    }

    #[test]
    fn batch_form_uses_bulk_loaded_wallets() {
        let store = Store::open_in_memory().unwrap();
        seed_earnings(&store, "u-1", "r-1", 150.0);
        seed_earnings(&store, "u-2", "r-2", 40.0);
        // u-1 holds two wallets; the correction must land on the larger one
        store.create_wallet("u-1", "m-low", 5.0).unwrap();
        store.create_wallet("u-1", "m-main", 150.0).unwrap();
        let recon = BalanceReconciler::new(store.clone(), 0.5);

        let ids = vec!["u-1".to_string(), "u-2".to_string()];
        let inputs = recon.load_mirror_inputs(&ids).unwrap();
        let wallets = store.wallets_for_users(&ids).unwrap();

        let corrected = recon.reconcile_user("u-1", 100.0, &inputs["u-1"], wallets.get("u-1"));
        assert_eq!(corrected.status, SyncStatus::RiskDetected);
        assert_eq!(corrected.adjustment, Some(50.0));
        let main = store.wallet_for_user("u-1").unwrap().unwrap();
        assert_eq!(main.merchant_id, "m-main");
        assert_eq!(main.current_balance, 100.0);

        // u-2 has earnings but no wallet: reported, never auto-created
        let blocked = recon.reconcile_user("u-2", 10.0, &inputs["u-2"], wallets.get("u-2"));
        assert_eq!(blocked.status, SyncStatus::MissingWallet);
        assert!(store.wallet_for_user("u-2").unwrap().is_none());
    }

    #[test]
    fn batch_inputs_default_to_zero_for_unknown_users() {
        let store = Store::open_in_memory().unwrap();
        seed_earnings(&store, "u-1", "r-1", 10.0);
        let recon = BalanceReconciler::new(store.clone(), 0.5);

        let inputs = recon
            .load_mirror_inputs(&["u-1".to_string(), "ghost".to_string()])
            .unwrap();
        assert_eq!(inputs["u-1"].verified_earnings, 10.0);
        assert_eq!(inputs["ghost"].verified_earnings, 0.0);
        assert_eq!(BalanceReconciler::mirror_balance(&inputs["ghost"]), 0.0);
    }
}
