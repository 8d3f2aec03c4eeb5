//! Disposal record persistence.
//!
//! `vendor_record_id` is UNIQUE and every insert goes through
//! `INSERT OR IGNORE`, so replaying a vendor page is a no-op.

use std::collections::HashMap;

use rusqlite::{params, params_from_iter, OptionalExtension, Row};

use super::models::{NewSubmission, ReviewStatus, SubmissionRow, WeightObservation};
use super::{repeat_vars, Store, StoreError};

/// Full review row, used by diagnostics and tests.
#[derive(Debug, Clone)]
pub struct SubmissionDetail {
    pub id: i64,
    pub vendor_record_id: String,
    pub user_id: Option<String>,
    pub device_no: String,
    pub waste_type: String,
    pub weight: f64,
    pub calculated_value: f64,
    pub machine_points: f64,
    pub status: ReviewStatus,
    pub bin_weight_snapshot: f64,
    pub source: String,
    pub submitted_at: i64,
    pub reviewed_at: Option<i64>,
}

fn row_to_detail(row: &Row) -> rusqlite::Result<SubmissionDetail> {
    let status: String = row.get(8)?;
    Ok(SubmissionDetail {
        id: row.get(0)?,
        vendor_record_id: row.get(1)?,
        user_id: row.get(2)?,
        device_no: row.get(3)?,
        waste_type: row.get(4)?,
        weight: row.get(5)?,
        calculated_value: row.get(6)?,
        machine_points: row.get(7)?,
        status: ReviewStatus::parse(&status),
        bin_weight_snapshot: row.get(9)?,
        source: row.get(10)?,
        submitted_at: row.get(11)?,
        reviewed_at: row.get(12)?,
    })
}

const DETAIL_COLS: &str = "id, vendor_record_id, user_id, device_no, waste_type, weight, \
     calculated_value, machine_points, status, bin_weight_snapshot, source, \
     submitted_at, reviewed_at";

fn row_to_observation(row: &Row) -> rusqlite::Result<WeightObservation> {
    Ok(WeightObservation {
        at: row.get(0)?,
        bin_weight: row.get(1)?,
        disposal_weight: row.get(2)?,
        waste_type: Some(row.get(3)?),
        photo_url: row.get(4)?,
    })
}

impl Store {
    /// Bulk dedup lookup for one harvest page.
    pub fn reviews_by_vendor_ids(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, SubmissionRow>, StoreError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT id, vendor_record_id, status FROM submission_reviews
             WHERE vendor_record_id IN ({})",
            repeat_vars(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut map = HashMap::new();
        let rows = stmt.query_map(params_from_iter(ids.iter()), |row| {
            let status: String = row.get(2)?;
            Ok(SubmissionRow {
                id: row.get(0)?,
                vendor_record_id: row.get(1)?,
                status: ReviewStatus::parse(&status),
            })
        })?;
        for row in rows {
            let row = row?;
            map.insert(row.vendor_record_id.clone(), row);
        }
        Ok(map)
    }

    pub fn review_by_vendor_id(
        &self,
        vendor_record_id: &str,
    ) -> Result<Option<SubmissionRow>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, vendor_record_id, status FROM submission_reviews
                 WHERE vendor_record_id = ?1",
                params![vendor_record_id],
                |row| {
                    let status: String = row.get(2)?;
                    Ok(SubmissionRow {
                        id: row.get(0)?,
                        vendor_record_id: row.get(1)?,
                        status: ReviewStatus::parse(&status),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Insert a priced batch in one transaction. Returns how many rows were
    /// actually written; duplicates are silently ignored.
    pub fn insert_submissions(&self, subs: &[NewSubmission]) -> Result<u32, StoreError> {
        if subs.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut inserted = 0u32;
        for sub in subs {
            let changed = tx.execute(
                "INSERT OR IGNORE INTO submission_reviews
                    (vendor_record_id, user_id, phone, device_no, waste_type, weight,
                     calculated_value, machine_points, status, bin_weight_snapshot,
                     photo_url, source, submitted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    sub.vendor_record_id,
                    sub.user_id,
                    sub.phone,
                    sub.device_no,
                    sub.waste_type,
                    sub.weight,
                    sub.calculated_value,
                    sub.machine_points,
                    sub.status.as_str(),
                    sub.bin_weight_snapshot,
                    sub.photo_url,
                    sub.source,
                    sub.submitted_at,
                ],
            )?;
            inserted += changed as u32;
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Late verification: the vendor finally reported points for a record we
    /// imported as PENDING.
    pub fn verify_submission(
        &self,
        id: i64,
        weight: f64,
        machine_points: f64,
        reviewed_at: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE submission_reviews
             SET status = ?1, weight = ?2, machine_points = ?3, reviewed_at = ?4
             WHERE id = ?5",
            params![
                ReviewStatus::Verified.as_str(),
                weight,
                machine_points,
                reviewed_at,
                id
            ],
        )?;
        Ok(())
    }

    /// Lifetime verified earnings for one user.
    pub fn sum_verified_value(&self, user_id: &str) -> Result<f64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let sum = conn.query_row(
            "SELECT COALESCE(SUM(calculated_value), 0) FROM submission_reviews
             WHERE user_id = ?1 AND status = 'VERIFIED'",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    /// Verified earnings for a batch of users in one query.
    pub fn sum_verified_values(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, f64>, StoreError> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT user_id, COALESCE(SUM(calculated_value), 0) FROM submission_reviews
             WHERE status = 'VERIFIED' AND user_id IN ({})
             GROUP BY user_id",
            repeat_vars(user_ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut map = HashMap::new();
        let rows = stmt.query_map(params_from_iter(user_ids.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?;
        for row in rows {
            let (user_id, sum) = row?;
            map.insert(user_id, sum);
        }
        Ok(map)
    }

    /// Most recent weight observations for a device strictly before `before`,
    /// newest first. The detector walks these to find a usable baseline.
    pub fn recent_snapshots_before(
        &self,
        device_no: &str,
        before: i64,
        limit: u32,
    ) -> Result<Vec<WeightObservation>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT submitted_at, bin_weight_snapshot, weight, waste_type, photo_url
             FROM submission_reviews
             WHERE device_no = ?1 AND submitted_at < ?2
             ORDER BY submitted_at DESC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![device_no, before, limit], row_to_observation)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Chronological observations for a device since `since`, for rescans.
    pub fn device_snapshots_since(
        &self,
        device_no: &str,
        since: i64,
    ) -> Result<Vec<WeightObservation>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT submitted_at, bin_weight_snapshot, weight, waste_type, photo_url
             FROM submission_reviews
             WHERE device_no = ?1 AND submitted_at >= ?2
             ORDER BY submitted_at ASC",
        )?;
        let rows = stmt
            .query_map(params![device_no, since], row_to_observation)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn submission_by_vendor_id(
        &self,
        vendor_record_id: &str,
    ) -> Result<Option<SubmissionDetail>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM submission_reviews WHERE vendor_record_id = ?1",
                    DETAIL_COLS
                ),
                params![vendor_record_id],
                row_to_detail,
            )
            .optional()?;
        Ok(row)
    }

    pub fn submission_count(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row("SELECT COUNT(*) FROM submission_reviews", [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(vendor_id: &str, user: &str, at: i64) -> NewSubmission {
        NewSubmission {
            vendor_record_id: vendor_id.to_string(),
            user_id: Some(user.to_string()),
            phone: Some("0100".to_string()),
            device_no: "dev-1".to_string(),
            waste_type: "Plastic".to_string(),
            weight: 1.2,
            calculated_value: 1.8,
            machine_points: 1.8,
            status: ReviewStatus::Verified,
            bin_weight_snapshot: 4.0,
            photo_url: None,
            source: "CRON_JOB".to_string(),
            submitted_at: at,
        }
    }

    #[test]
    fn duplicate_vendor_ids_insert_once() {
        let store = Store::open_in_memory().unwrap();
        let batch = vec![submission("r-1", "u-1", 100), submission("r-1", "u-1", 100)];
        assert_eq!(store.insert_submissions(&batch).unwrap(), 1);

        // Replaying the whole batch later writes nothing
        assert_eq!(store.insert_submissions(&batch).unwrap(), 0);
        assert_eq!(store.submission_count().unwrap(), 1);
    }

    #[test]
    fn verify_updates_status_and_points() {
        let store = Store::open_in_memory().unwrap();
        let mut sub = submission("r-1", "u-1", 100);
        sub.status = ReviewStatus::Pending;
        sub.machine_points = 0.0;
        store.insert_submissions(&[sub]).unwrap();

        let row = store.review_by_vendor_id("r-1").unwrap().unwrap();
        assert_eq!(row.status, ReviewStatus::Pending);

        store.verify_submission(row.id, 1.2, 6.0, 500).unwrap();
        let detail = store.submission_by_vendor_id("r-1").unwrap().unwrap();
        assert_eq!(detail.status, ReviewStatus::Verified);
        assert_eq!(detail.machine_points, 6.0);
        assert_eq!(detail.reviewed_at, Some(500));
    }

    #[test]
    fn verified_sum_ignores_pending_rows() {
        let store = Store::open_in_memory().unwrap();
        let mut pending = submission("r-1", "u-1", 100);
        pending.status = ReviewStatus::Pending;
        pending.calculated_value = 99.0;
        let verified = submission("r-2", "u-1", 200);
        store.insert_submissions(&[pending, verified]).unwrap();

        assert_eq!(store.sum_verified_value("u-1").unwrap(), 1.8);

        let sums = store
            .sum_verified_values(&["u-1".to_string(), "u-2".to_string()])
            .unwrap();
        assert_eq!(sums.get("u-1"), Some(&1.8));
        assert_eq!(sums.get("u-2"), None);
    }

    #[test]
    fn snapshot_queries_respect_order_and_bounds() {
        let store = Store::open_in_memory().unwrap();
        let batch = vec![
            submission("r-1", "u-1", 100),
            submission("r-2", "u-1", 200),
            submission("r-3", "u-1", 300),
        ];
        store.insert_submissions(&batch).unwrap();

        let before = store.recent_snapshots_before("dev-1", 300, 10).unwrap();
        let times: Vec<i64> = before.iter().map(|o| o.at).collect();
        assert_eq!(times, vec![200, 100]);

        let since = store.device_snapshots_since("dev-1", 200).unwrap();
        let times: Vec<i64> = since.iter().map(|o| o.at).collect();
        assert_eq!(times, vec![200, 300]);
    }
}
