//! Machine registry queries plus the verbatim machine event log.

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension, Row};

use super::models::Machine;
use super::{Store, StoreError};

/// Raw machine event as received on the webhook, stored before any
/// interpretation.
#[derive(Debug, Clone)]
pub struct MachineLogRow {
    pub id: i64,
    pub device_no: String,
    pub event_type: String,
    pub payload: String,
    pub vendor_user_no: Option<String>,
    pub created_at: i64,
}

const MACHINE_COLS: &str = "id, device_no, merchant_id, name, zone, is_active, is_manual_offline, \
     bin1_waste_type, bin2_waste_type, bin1_weight_kg, bin2_weight_kg, \
     rate_plastic, rate_can, rate_paper, rate_uco, rate_glass";

fn row_to_machine(row: &Row) -> rusqlite::Result<Machine> {
    Ok(Machine {
        id: row.get(0)?,
        device_no: row.get(1)?,
        merchant_id: row.get(2)?,
        name: row.get(3)?,
        zone: row.get(4)?,
        is_active: row.get(5)?,
        is_manual_offline: row.get(6)?,
        bin1_waste_type: row.get(7)?,
        bin2_waste_type: row.get(8)?,
        bin1_weight_kg: row.get(9)?,
        bin2_weight_kg: row.get(10)?,
        rate_plastic: row.get(11)?,
        rate_can: row.get(12)?,
        rate_paper: row.get(13)?,
        rate_uco: row.get(14)?,
        rate_glass: row.get(15)?,
    })
}

impl Store {
    /// Register or refresh a machine. Registry fields are overwritten;
    /// last known bin weights are preserved on conflict so a re-register
    /// never clobbers poll state.
    pub fn upsert_machine(&self, machine: &Machine) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO machines
                (device_no, merchant_id, name, zone, is_active, is_manual_offline,
                 bin1_waste_type, bin2_waste_type, bin1_weight_kg, bin2_weight_kg,
                 rate_plastic, rate_can, rate_paper, rate_uco, rate_glass)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(device_no) DO UPDATE SET
                merchant_id = excluded.merchant_id,
                name = excluded.name,
                zone = excluded.zone,
                is_active = excluded.is_active,
                is_manual_offline = excluded.is_manual_offline,
                bin1_waste_type = excluded.bin1_waste_type,
                bin2_waste_type = excluded.bin2_waste_type,
                rate_plastic = excluded.rate_plastic,
                rate_can = excluded.rate_can,
                rate_paper = excluded.rate_paper,
                rate_uco = excluded.rate_uco,
                rate_glass = excluded.rate_glass",
            params![
                machine.device_no,
                machine.merchant_id,
                machine.name,
                machine.zone,
                machine.is_active,
                machine.is_manual_offline,
                machine.bin1_waste_type,
                machine.bin2_waste_type,
                machine.bin1_weight_kg,
                machine.bin2_weight_kg,
                machine.rate_plastic,
                machine.rate_can,
                machine.rate_paper,
                machine.rate_uco,
                machine.rate_glass,
            ],
        )?;
        Ok(())
    }

    pub fn machine_by_device(&self, device_no: &str) -> Result<Option<Machine>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let machine = conn
            .query_row(
                &format!("SELECT {} FROM machines WHERE device_no = ?1", MACHINE_COLS),
                params![device_no],
                row_to_machine,
            )
            .optional()?;
        Ok(machine)
    }

    /// Machines eligible for polling and rescans.
    pub fn active_machines(&self) -> Result<Vec<Machine>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM machines WHERE is_active = 1 ORDER BY device_no",
            MACHINE_COLS
        ))?;
        let machines = stmt
            .query_map([], row_to_machine)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(machines)
    }

    /// Whole fleet keyed by device number, for O(1) lookups during imports.
    pub fn machine_map(&self) -> Result<HashMap<String, Machine>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM machines", MACHINE_COLS))?;
        let mut map = HashMap::new();
        let rows = stmt.query_map([], row_to_machine)?;
        for machine in rows {
            let machine = machine?;
            map.insert(machine.device_no.clone(), machine);
        }
        Ok(map)
    }

    pub fn update_bin_weight(
        &self,
        device_no: &str,
        position: i64,
        weight_kg: f64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let sql = match position {
            2 => "UPDATE machines SET bin2_weight_kg = ?1 WHERE device_no = ?2",
            _ => "UPDATE machines SET bin1_weight_kg = ?1 WHERE device_no = ?2",
        };
        conn.execute(sql, params![weight_kg, device_no])?;
        Ok(())
    }

    pub fn set_machine_active(&self, device_no: &str, active: bool) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE machines SET is_active = ?1 WHERE device_no = ?2",
            params![active, device_no],
        )?;
        Ok(())
    }

    /// Append a raw machine event. The payload is stored verbatim as JSON
    /// text before any routing decision is made.
    pub fn insert_machine_log(
        &self,
        device_no: &str,
        event_type: &str,
        payload: &serde_json::Value,
        vendor_user_no: Option<&str>,
        now: i64,
    ) -> Result<(), StoreError> {
        let payload_text = serde_json::to_string(payload)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO machine_logs (device_no, event_type, payload, vendor_user_no, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![device_no, event_type, payload_text, vendor_user_no, now],
        )?;
        Ok(())
    }

    pub fn machine_logs_for_device(
        &self,
        device_no: &str,
    ) -> Result<Vec<MachineLogRow>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, device_no, event_type, payload, vendor_user_no, created_at
             FROM machine_logs WHERE device_no = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![device_no], |row| {
                Ok(MachineLogRow {
                    id: row.get(0)?,
                    device_no: row.get(1)?,
                    event_type: row.get(2)?,
                    payload: row.get(3)?,
                    vendor_user_no: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
