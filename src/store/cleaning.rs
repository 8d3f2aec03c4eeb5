//! Cleaning event persistence and window dedup queries.

use rusqlite::{params, Row};

use super::models::{CleaningRecord, NewCleaning};
use super::{Store, StoreError};

fn row_to_record(row: &Row) -> rusqlite::Result<CleaningRecord> {
    Ok(CleaningRecord {
        id: row.get(0)?,
        device_no: row.get(1)?,
        merchant_id: row.get(2)?,
        waste_type: row.get(3)?,
        bag_weight_collected: row.get(4)?,
        cleaned_at: row.get(5)?,
        photo_url: row.get(6)?,
        cleaner_name: row.get(7)?,
        status: row.get(8)?,
    })
}

impl Store {
    pub fn insert_cleaning(&self, cleaning: &NewCleaning, now: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO cleaning_records
                (device_no, merchant_id, waste_type, bag_weight_collected, cleaned_at,
                 photo_url, cleaner_name, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                cleaning.device_no,
                cleaning.merchant_id,
                cleaning.waste_type,
                cleaning.bag_weight_collected,
                cleaning.cleaned_at,
                cleaning.photo_url,
                cleaning.cleaner_name,
                cleaning.status,
                now,
            ],
        )?;
        Ok(())
    }

    /// True if a cleaning is already logged in the half-open window
    /// (`after`, `until`]. Rescans over the same history dedup through this.
    pub fn cleaning_exists_between(
        &self,
        device_no: &str,
        after: i64,
        until: i64,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let exists = conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM cleaning_records
                WHERE device_no = ?1 AND cleaned_at > ?2 AND cleaned_at <= ?3
             )",
            params![device_no, after, until],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// True if a cleaning for the same waste stream was logged at or after
    /// `since`. Used by the live poller, which has no previous-observation
    /// timestamp to bound the window with.
    pub fn recent_cleaning_exists(
        &self,
        device_no: &str,
        waste_type: &str,
        since: i64,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let exists = conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM cleaning_records
                WHERE device_no = ?1 AND waste_type = ?2 AND cleaned_at >= ?3
             )",
            params![device_no, waste_type, since],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn cleanings_for_device(
        &self,
        device_no: &str,
    ) -> Result<Vec<CleaningRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, device_no, merchant_id, waste_type, bag_weight_collected,
                    cleaned_at, photo_url, cleaner_name, status
             FROM cleaning_records
             WHERE device_no = ?1
             ORDER BY cleaned_at ASC",
        )?;
        let rows = stmt
            .query_map(params![device_no], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn cleaning_count(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row("SELECT COUNT(*) FROM cleaning_records", [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }
}
