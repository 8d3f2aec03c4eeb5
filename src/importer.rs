//! Idempotent disposal-record import.
//!
//! Vendor pages overlap from run to run on purpose (the poll window is wider
//! than the poll interval, so nothing slips through between runs). The
//! UNIQUE vendor record id plus `INSERT OR IGNORE` makes the overlap free:
//! re-importing a page writes nothing and changes nothing.

use std::collections::HashMap;

use crate::detector::CleaningDetector;
use crate::store::models::{
    current_timestamp, round2, Machine, NewSubmission, ReviewStatus, SubmissionRow, User,
    WasteType, WeightObservation,
};
use crate::store::{Store, StoreError};
use crate::vendor::types::{parse_vendor_time, VendorDisposalRecord};

/// Source tags recorded on imported rows.
pub const SOURCE_CRON: &str = "CRON_JOB";
pub const SOURCE_WEBHOOK: &str = "WEBHOOK";

/// Vendor record normalized for import: timestamp parsed, material name
/// flattened. Construction fails only when the vendor timestamp is garbage;
/// a record that cannot be ordered cannot be windowed either.
#[derive(Debug, Clone)]
pub struct IncomingRecord {
    pub vendor_record_id: String,
    pub device_no: String,
    pub weight: f64,
    pub machine_points: f64,
    pub photo_url: Option<String>,
    pub bin_weight_snapshot: f64,
    pub material_name: Option<String>,
    pub submitted_at: i64,
    pub source: String,
}

impl IncomingRecord {
    pub fn from_vendor(record: &VendorDisposalRecord, source: &str) -> Option<Self> {
        let submitted_at = parse_vendor_time(&record.create_time)?;
        Some(Self {
            vendor_record_id: record.id.clone(),
            device_no: record.device_no.clone(),
            weight: record.weight,
            machine_points: record.integral,
            photo_url: record.img_url.clone(),
            bin_weight_snapshot: record.position_weight,
            material_name: record.material_name().map(str::to_string),
            submitted_at,
            source: source.to_string(),
        })
    }

    fn observation(&self, waste_label: &str) -> WeightObservation {
        WeightObservation {
            at: self.submitted_at,
            bin_weight: self.bin_weight_snapshot,
            disposal_weight: self.weight,
            waste_type: Some(waste_label.to_string()),
            photo_url: self.photo_url.clone(),
        }
    }
}

/// What became of a single record pushed through `import_one`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordAction {
    Imported,
    Verified,
    AlreadyKnown,
    UnknownDevice,
}

#[derive(Debug, Clone, Default)]
pub struct ImportOutcome {
    /// Rows actually written (duplicates excluded).
    pub imported: u32,
    /// PENDING rows repaired to VERIFIED.
    pub verified: u32,
    /// Cleaning events detected along the way.
    pub cleanings: u32,
    pub skipped_unknown_device: u32,
}

#[derive(Clone)]
pub struct RecordImporter {
    store: Store,
    detector: CleaningDetector,
}

impl RecordImporter {
    pub fn new(store: Store, detector: CleaningDetector) -> Self {
        Self { store, detector }
    }

    /// Import one user's harvest page. Records are sorted oldest-first so
    /// weight windows line up, deduped against the store in one query, and
    /// inserted in one transaction at the end.
    pub fn import_batch(
        &self,
        user: &User,
        mut records: Vec<IncomingRecord>,
        machines: &HashMap<String, Machine>,
    ) -> Result<ImportOutcome, StoreError> {
        let mut outcome = ImportOutcome::default();
        if records.is_empty() {
            return Ok(outcome);
        }
        records.sort_by_key(|r| r.submitted_at);

        let ids: Vec<String> = records
            .iter()
            .map(|r| r.vendor_record_id.clone())
            .collect();
        let existing = self.store.reviews_by_vendor_ids(&ids)?;

        let mut fresh: Vec<NewSubmission> = Vec::new();
        for record in &records {
            if let Some(sub) = self.process_record(
                record,
                existing.get(record.vendor_record_id.as_str()),
                Some(user.id.as_str()),
                Some(user.phone.as_str()),
                machines,
                &mut outcome,
            )? {
                fresh.push(sub);
            }
        }

        outcome.imported = self.store.insert_submissions(&fresh)?;
        Ok(outcome)
    }

    /// Import a single record immediately (webhook path). Same rules as the
    /// batch path, including the cleaning check, but the insert happens
    /// right away so the record becomes a baseline for the next event.
    pub fn import_one(
        &self,
        user_id: Option<&str>,
        phone: Option<&str>,
        record: &IncomingRecord,
        machines: &HashMap<String, Machine>,
    ) -> Result<RecordAction, StoreError> {
        let existing = self.store.review_by_vendor_id(&record.vendor_record_id)?;
        let mut outcome = ImportOutcome::default();
        let planned = self.process_record(
            record,
            existing.as_ref(),
            user_id,
            phone,
            machines,
            &mut outcome,
        )?;

        match planned {
            Some(sub) => {
                let inserted = self.store.insert_submissions(std::slice::from_ref(&sub))?;
                if inserted > 0 {
                    Ok(RecordAction::Imported)
                } else {
                    Ok(RecordAction::AlreadyKnown)
                }
            }
            None if outcome.verified > 0 => Ok(RecordAction::Verified),
            None if outcome.skipped_unknown_device > 0 => Ok(RecordAction::UnknownDevice),
            None => Ok(RecordAction::AlreadyKnown),
        }
    }

    /// Shared per-record pipeline: cleaning check, repair-or-skip for known
    /// ids, classify and price for fresh ones. Returns the row to insert,
    /// or None when the record resolved without one.
    fn process_record(
        &self,
        record: &IncomingRecord,
        existing: Option<&SubmissionRow>,
        user_id: Option<&str>,
        phone: Option<&str>,
        machines: &HashMap<String, Machine>,
        outcome: &mut ImportOutcome,
    ) -> Result<Option<NewSubmission>, StoreError> {
        let Some(machine) = machines.get(&record.device_no) else {
            log::debug!(
                "❓ Record {} references unknown device {}, skipping",
                record.vendor_record_id,
                record.device_no
            );
            outcome.skipped_unknown_device += 1;
            return Ok(None);
        };

        let material = record.material_name.as_deref().unwrap_or("");
        let waste = WasteType::classify(material).label();

        // Telemetry first: even an already-imported record can close a
        // cleaning window against older history
        if self
            .detector
            .check_record(&self.store, machine, &record.observation(waste))?
        {
            outcome.cleanings += 1;
        }

        if let Some(row) = existing {
            if row.status == ReviewStatus::Pending && record.machine_points > 0.0 {
                self.store.verify_submission(
                    row.id,
                    record.weight,
                    record.machine_points,
                    current_timestamp(),
                )?;
                log::info!(
                    "✅ Verified pending record {} ({} pts)",
                    record.vendor_record_id,
                    record.machine_points
                );
                outcome.verified += 1;
            }
            return Ok(None);
        }

        let rate = machine.rate_for(waste);
        let status = if record.machine_points > 0.0 {
            ReviewStatus::Verified
        } else {
            ReviewStatus::Pending
        };

        Ok(Some(NewSubmission {
            vendor_record_id: record.vendor_record_id.clone(),
            user_id: user_id.map(str::to_string),
            phone: phone.map(str::to_string),
            device_no: record.device_no.clone(),
            waste_type: waste.to_string(),
            weight: record.weight,
            calculated_value: round2(record.weight * rate),
            machine_points: record.machine_points,
            status,
            bin_weight_snapshot: record.bin_weight_snapshot,
            photo_url: record.photo_url.clone(),
            source: record.source.clone(),
            submitted_at: record.submitted_at,
        }))
    }
}
