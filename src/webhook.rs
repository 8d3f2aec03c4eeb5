//! Inbound machine event intake.
//!
//! The vendor pushes events per machine action: `PUT` when a user deposits
//! material, `OVERFLOW` when a bin reports full. Every payload is appended
//! to `machine_logs` verbatim before any routing, so the raw feed survives
//! even when derived processing rejects the event. A `PUT` then runs the
//! exact per-record import path the harvester uses; a record must land in
//! the same state whether it arrived by push or by pull.

use serde::Deserialize;

use crate::importer::{IncomingRecord, RecordAction, RecordImporter, SOURCE_WEBHOOK};
use crate::store::models::current_timestamp;
use crate::store::{Store, StoreError};
use crate::vendor::types::{
    de_f64_lenient, de_opt_string_lenient, de_string_lenient, parse_vendor_time, DisposalDetail,
};

/// Typed view over a vendor push payload, tagged by `type`. Anything the
/// tag does not match folds into `Unknown` and is log-only.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum WebhookEvent {
    #[serde(rename = "PUT")]
    Put(PutEvent),
    #[serde(rename = "OVERFLOW")]
    Overflow(OverflowEvent),
    #[serde(other)]
    Unknown,
}

/// Disposal push. `putId` is the same identity as the harvest listing's
/// record id, which is what makes push/pull dedup work.
#[derive(Debug, Clone, Deserialize)]
pub struct PutEvent {
    #[serde(rename = "deviceNo")]
    pub device_no: String,
    #[serde(rename = "putId", deserialize_with = "de_string_lenient")]
    pub put_id: String,
    /// Vendor-side user number, used to attribute the record locally.
    #[serde(default, rename = "userId", deserialize_with = "de_opt_string_lenient")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default, rename = "totalWeight", deserialize_with = "de_f64_lenient")]
    pub total_weight: f64,
    #[serde(default, deserialize_with = "de_f64_lenient")]
    pub integral: f64,
    #[serde(default, rename = "imgUrl")]
    pub img_url: Option<String>,
    #[serde(default, rename = "positionWeight", deserialize_with = "de_f64_lenient")]
    pub position_weight: f64,
    #[serde(default, rename = "createTime")]
    pub create_time: Option<String>,
    #[serde(default, rename = "rubbishLogDetailsVOList")]
    pub details: Vec<DisposalDetail>,
}

/// Bin-full push. The machine stops accepting until ops collects the bag.
#[derive(Debug, Clone, Deserialize)]
pub struct OverflowEvent {
    #[serde(rename = "deviceNo")]
    pub device_no: String,
    #[serde(default, rename = "positionNo")]
    pub position_no: i64,
    #[serde(default)]
    pub description: Option<String>,
}

/// What the handler did with one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Put(RecordAction),
    /// PUT without a matching local user; logged, not imported.
    UnknownUser,
    OverflowFlagged,
    /// Unknown event type, or a PUT missing its required fields.
    LoggedOnly,
}

pub struct WebhookHandler {
    store: Store,
    importer: RecordImporter,
}

impl WebhookHandler {
    pub fn new(store: Store, importer: RecordImporter) -> Self {
        Self { store, importer }
    }

    /// Log-then-route. The verbatim `machine_logs` insert happens for every
    /// payload, including ones the typed parse rejects.
    pub fn handle(&self, payload: &serde_json::Value) -> Result<WebhookOutcome, StoreError> {
        let device_no = payload
            .get("deviceNo")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let event_type = payload
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("UNKNOWN");
        let vendor_user_no = match payload.get("userId") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        self.store.insert_machine_log(
            device_no,
            event_type,
            payload,
            vendor_user_no.as_deref(),
            current_timestamp(),
        )?;

        match serde_json::from_value::<WebhookEvent>(payload.clone()) {
            Ok(WebhookEvent::Put(event)) => self.handle_put(event),
            Ok(WebhookEvent::Overflow(event)) => self.handle_overflow(event),
            Ok(WebhookEvent::Unknown) => {
                log::info!("📨 {}: unhandled event type {}", device_no, event_type);
                Ok(WebhookOutcome::LoggedOnly)
            }
            Err(e) => {
                log::warn!("⚠️ {}: malformed {} payload: {}", device_no, event_type, e);
                Ok(WebhookOutcome::LoggedOnly)
            }
        }
    }

    fn handle_put(&self, event: PutEvent) -> Result<WebhookOutcome, StoreError> {
        let user = match &event.user_id {
            Some(no) => self.store.user_by_vendor_no(no)?,
            None => None,
        };
        let user = match (user, &event.phone) {
            (Some(u), _) => Some(u),
            (None, Some(phone)) => self.store.user_by_phone(phone)?,
            (None, None) => None,
        };
        let Some(user) = user else {
            log::warn!(
                "👤 PUT {} on {}: no local user for vendor no {:?} / phone {:?}",
                event.put_id,
                event.device_no,
                event.user_id,
                event.phone
            );
            return Ok(WebhookOutcome::UnknownUser);
        };

        let submitted_at = event
            .create_time
            .as_deref()
            .and_then(parse_vendor_time)
            .unwrap_or_else(current_timestamp);
        let record = IncomingRecord {
            vendor_record_id: event.put_id,
            device_no: event.device_no,
            weight: event.total_weight,
            machine_points: event.integral,
            photo_url: event.img_url,
            bin_weight_snapshot: event.position_weight,
            material_name: event
                .details
                .iter()
                .filter_map(|d| d.rubbish_name.clone())
                .next(),
            submitted_at,
            source: SOURCE_WEBHOOK.to_string(),
        };

        let machines = self.store.machine_map()?;
        let action =
            self.importer
                .import_one(Some(&user.id), Some(&user.phone), &record, &machines)?;
        Ok(WebhookOutcome::Put(action))
    }

    fn handle_overflow(&self, event: OverflowEvent) -> Result<WebhookOutcome, StoreError> {
        log::warn!(
            "🗑️ {} pos {}: bin full{}",
            event.device_no,
            event.position_no,
            event
                .description
                .as_deref()
                .map(|d| format!(" ({})", d))
                .unwrap_or_default()
        );
        // offline until ops collects the bag and re-enables the unit
        self.store.set_machine_active(&event.device_no, false)?;
        Ok(WebhookOutcome::OverflowFlagged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::CleaningDetector;
    use crate::store::models::{Machine, ReviewStatus, User};

    fn handler(store: &Store) -> WebhookHandler {
        WebhookHandler::new(
            store.clone(),
            RecordImporter::new(store.clone(), CleaningDetector::with_defaults()),
        )
    }

    fn seed(store: &Store) {
        store
            .upsert_user(&User {
                id: "u-1".to_string(),
                vendor_user_no: Some("vno-9".to_string()),
                phone: "0100".to_string(),
                nickname: None,
                last_synced_at: None,
            })
            .unwrap();
        store
            .upsert_machine(&Machine {
                device_no: "dev-1".to_string(),
                merchant_id: "m-1".to_string(),
                is_active: true,
                rate_plastic: 1.5,
                ..Machine::default()
            })
            .unwrap();
    }

    fn put_payload(put_id: &str) -> serde_json::Value {
        serde_json::json!({
            "type": "PUT",
            "deviceNo": "dev-1",
            "putId": put_id,
            "userId": "vno-9",
            "totalWeight": "2.0",
            "integral": 3,
            "positionWeight": 5.5,
            "createTime": "2025-03-14 08:30:00",
            "rubbishLogDetailsVOList": [{"rubbishName": "PET bottle"}]
        })
    }

    #[test]
    fn put_logs_verbatim_and_imports() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);

        let outcome = handler(&store).handle(&put_payload("w-1")).unwrap();
        assert_eq!(outcome, WebhookOutcome::Put(RecordAction::Imported));

        let logs = store.machine_logs_for_device("dev-1").unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].event_type, "PUT");
        assert_eq!(logs[0].vendor_user_no.as_deref(), Some("vno-9"));
        // the stored payload is the raw JSON, re-parseable
        let echoed: serde_json::Value = serde_json::from_str(&logs[0].payload).unwrap();
        assert_eq!(echoed["putId"], "w-1");

        let row = store.submission_by_vendor_id("w-1").unwrap().unwrap();
        assert_eq!(row.user_id.as_deref(), Some("u-1"));
        assert_eq!(row.source, SOURCE_WEBHOOK);
        assert_eq!(row.status, ReviewStatus::Verified);
        // 2.0kg x 1.5 pts/kg
        assert_eq!(row.calculated_value, 3.0);
    }

    #[test]
    fn replayed_put_is_deduped_but_still_logged() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);
        let h = handler(&store);

        h.handle(&put_payload("w-1")).unwrap();
        let outcome = h.handle(&put_payload("w-1")).unwrap();
        assert_eq!(outcome, WebhookOutcome::Put(RecordAction::AlreadyKnown));

        assert_eq!(store.submission_count().unwrap(), 1);
        // both deliveries remain in the raw log
        assert_eq!(store.machine_logs_for_device("dev-1").unwrap().len(), 2);
    }

    #[test]
    fn put_falls_back_to_phone_lookup() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);

        let mut payload = put_payload("w-2");
        payload["userId"] = serde_json::Value::Null;
        payload["phone"] = serde_json::json!("0100");

        let outcome = handler(&store).handle(&payload).unwrap();
        assert_eq!(outcome, WebhookOutcome::Put(RecordAction::Imported));
        let row = store.submission_by_vendor_id("w-2").unwrap().unwrap();
        assert_eq!(row.user_id.as_deref(), Some("u-1"));
    }

    #[test]
    fn put_without_local_user_only_logs() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);

        let mut payload = put_payload("w-3");
        payload["userId"] = serde_json::json!("stranger");
        payload["phone"] = serde_json::Value::Null;

        let outcome = handler(&store).handle(&payload).unwrap();
        assert_eq!(outcome, WebhookOutcome::UnknownUser);
        assert!(store.submission_by_vendor_id("w-3").unwrap().is_none());
        assert_eq!(store.machine_logs_for_device("dev-1").unwrap().len(), 1);
    }

    #[test]
    fn overflow_takes_machine_offline() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);

        let payload = serde_json::json!({
            "type": "OVERFLOW",
            "deviceNo": "dev-1",
            "positionNo": 1,
            "description": "bin level 98%"
        });
        let outcome = handler(&store).handle(&payload).unwrap();
        assert_eq!(outcome, WebhookOutcome::OverflowFlagged);

        let machine = store.machine_by_device("dev-1").unwrap().unwrap();
        assert!(!machine.is_active);
        assert_eq!(store.machine_logs_for_device("dev-1").unwrap()[0].event_type, "OVERFLOW");
    }

    #[test]
    fn unknown_event_types_are_log_only() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);

        let payload = serde_json::json!({
            "type": "HEARTBEAT",
            "deviceNo": "dev-1",
            "uptime": 86400
        });
        let outcome = handler(&store).handle(&payload).unwrap();
        assert_eq!(outcome, WebhookOutcome::LoggedOnly);
        assert_eq!(store.machine_logs_for_device("dev-1").unwrap().len(), 1);
    }

    #[test]
    fn malformed_put_still_reaches_the_raw_log() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);

        // PUT without its putId cannot be routed
        let payload = serde_json::json!({"type": "PUT", "deviceNo": "dev-1"});
        let outcome = handler(&store).handle(&payload).unwrap();
        assert_eq!(outcome, WebhookOutcome::LoggedOnly);
        assert_eq!(store.machine_logs_for_device("dev-1").unwrap().len(), 1);
        assert_eq!(store.submission_count().unwrap(), 0);
    }
}
