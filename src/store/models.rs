//! Row types shared across the store and the processing pipeline.

use serde::Serialize;

/// App user mirrored from the vendor cloud. `phone` is the join key used by
/// every vendor endpoint.
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub vendor_user_no: Option<String>,
    pub phone: String,
    pub nickname: Option<String>,
    /// Epoch seconds of the last harvest claim. None = never synced.
    pub last_synced_at: Option<i64>,
}

/// RVM unit. Bin positions are 1-based; single-compartment machines only
/// populate position 1.
#[derive(Debug, Clone, Default)]
pub struct Machine {
    pub id: i64,
    pub device_no: String,
    pub merchant_id: String,
    pub name: String,
    pub zone: Option<String>,
    pub is_active: bool,
    pub is_manual_offline: bool,
    pub bin1_waste_type: Option<String>,
    pub bin2_waste_type: Option<String>,
    /// Last known bin weight per position, kg.
    pub bin1_weight_kg: f64,
    pub bin2_weight_kg: f64,
    /// Points per kg by waste class.
    pub rate_plastic: f64,
    pub rate_can: f64,
    pub rate_paper: f64,
    pub rate_uco: f64,
    pub rate_glass: f64,
}

impl Machine {
    /// Points-per-kg rate for a waste label. Substring match so machine
    /// labels like "Plastik / Aluminium Can" still resolve.
    pub fn rate_for(&self, waste_type: &str) -> f64 {
        let key = waste_type.to_lowercase();
        if key.contains("paper") {
            self.rate_paper
        } else if key.contains("uco") || key.contains("oil") {
            self.rate_uco
        } else if key.contains("glass") {
            self.rate_glass
        } else if key.contains("can") {
            self.rate_can
        } else {
            self.rate_plastic
        }
    }

    pub fn bin_weight(&self, position: i64) -> f64 {
        match position {
            2 => self.bin2_weight_kg,
            _ => self.bin1_weight_kg,
        }
    }

    pub fn bin_label(&self, position: i64) -> Option<&str> {
        match position {
            2 => self.bin2_waste_type.as_deref(),
            _ => self.bin1_waste_type.as_deref(),
        }
    }
}

/// Waste classes priced by the machines. Vendor record details carry free-form
/// bilingual names; `classify` folds them onto this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WasteType {
    Paper,
    AluminiumCan,
    Glass,
    Uco,
    Plastic,
}

impl WasteType {
    /// Keyword classification over the vendor's material name. Unrecognized
    /// names fall back to Plastic, the most common stream.
    pub fn classify(name: &str) -> Self {
        let key = name.to_lowercase();
        if key.contains("paper") || name.contains('纸') {
            WasteType::Paper
        } else if key.contains("can") || name.contains('罐') {
            WasteType::AluminiumCan
        } else if key.contains("glass") || name.contains('玻') {
            WasteType::Glass
        } else if key.contains("oil") || name.contains('油') {
            WasteType::Uco
        } else {
            WasteType::Plastic
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            WasteType::Paper => "Paper",
            WasteType::AluminiumCan => "Aluminium Can",
            WasteType::Glass => "Glass",
            WasteType::Uco => "UCO",
            WasteType::Plastic => "Plastic",
        }
    }
}

/// Review lifecycle of an imported disposal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewStatus {
    /// Imported with zero vendor points; awaiting confirmation.
    Pending,
    /// Vendor confirmed the award (or a later fetch repaired it).
    Verified,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "PENDING",
            ReviewStatus::Verified => "VERIFIED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "VERIFIED" => ReviewStatus::Verified,
            _ => ReviewStatus::Pending,
        }
    }
}

/// Slim projection used for batch dedup lookups.
#[derive(Debug, Clone)]
pub struct SubmissionRow {
    pub id: i64,
    pub vendor_record_id: String,
    pub status: ReviewStatus,
}

/// Fully priced disposal record ready for insert.
#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub vendor_record_id: String,
    pub user_id: Option<String>,
    pub phone: Option<String>,
    pub device_no: String,
    pub waste_type: String,
    /// Vendor-reported disposal weight, kg.
    pub weight: f64,
    /// Local price: weight x machine rate, rounded to 2dp.
    pub calculated_value: f64,
    /// Points the vendor awarded at machine time.
    pub machine_points: f64,
    pub status: ReviewStatus,
    /// Bin fill level reported alongside the disposal, kg.
    pub bin_weight_snapshot: f64,
    pub photo_url: Option<String>,
    pub source: String,
    pub submitted_at: i64,
}

/// One weight telemetry point for a device. The detector compares
/// chronologically adjacent observations to find collection events.
#[derive(Debug, Clone)]
pub struct WeightObservation {
    /// Epoch seconds.
    pub at: i64,
    /// Bin fill level, kg.
    pub bin_weight: f64,
    /// Disposal weight paired with this snapshot (0 for live polls).
    pub disposal_weight: f64,
    pub waste_type: Option<String>,
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewCleaning {
    pub device_no: String,
    pub merchant_id: Option<String>,
    pub waste_type: String,
    /// Weight of the bag removed, kg (the pre-collection bin level).
    pub bag_weight_collected: f64,
    pub cleaned_at: i64,
    pub photo_url: Option<String>,
    pub cleaner_name: String,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct CleaningRecord {
    pub id: i64,
    pub device_no: String,
    pub merchant_id: Option<String>,
    pub waste_type: String,
    pub bag_weight_collected: f64,
    pub cleaned_at: i64,
    pub photo_url: Option<String>,
    pub cleaner_name: String,
    pub status: String,
}

/// Local mirror wallet. A user may hold one wallet per merchant.
#[derive(Debug, Clone)]
pub struct Wallet {
    pub id: i64,
    pub user_id: String,
    pub merchant_id: String,
    pub current_balance: f64,
}

#[derive(Debug, Clone)]
pub struct WalletTransaction {
    pub id: i64,
    pub user_id: String,
    pub merchant_id: String,
    pub amount: f64,
    pub balance_after: f64,
    pub transaction_type: String,
    pub description: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct WithdrawalRow {
    pub id: i64,
    pub user_id: String,
    pub amount: f64,
    pub status: String,
    pub bank_name: String,
    pub account_number: String,
    pub account_holder_name: String,
    pub created_at: i64,
}

/// Wallet ledger entry kinds. The mirror balance sums the external kinds
/// only; verified earnings come from submission_reviews directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionType {
    ExternalSpend,
    ExternalSync,
    ManualAdjustment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::ExternalSpend => "EXTERNAL_SPEND",
            TransactionType::ExternalSync => "EXTERNAL_SYNC",
            TransactionType::ManualAdjustment => "MANUAL_ADJUSTMENT",
        }
    }
}

/// Sentinel values marking reconciler-generated withdrawal rows so they
/// never count as real payout requests.
pub const EXTERNAL_SYNC_MARKER: &str = "EXTERNAL_SYNC";
pub const EXTERNAL_SYNC_HOLDER: &str = "External Spending";

pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Round to 2 decimal places. All point amounts are stored rounded so mirror
/// sums stay comparable against the vendor's 2dp balances.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
