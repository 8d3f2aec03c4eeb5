//! Bin-cleaning detection from weight telemetry.
//!
//! Machines never report "bin emptied" explicitly. The only evidence is the
//! bin weight dropping from a loaded level to near-empty between two
//! observations. One rule covers all three telemetry paths (record import,
//! historical rescan, live poll):
//!
//! ```text
//! prev.bin_weight > full_threshold
//!   AND curr.bin_weight < empty_threshold (per device class)
//!   AND curr.bin_weight < prev.bin_weight
//! ```
//!
//! The bag weight credited to the cleaner is the previous observation's bin
//! level. UCO (used cooking oil) tanks have load cells that intermittently
//! report zero while holding tens of kilograms, so near-zero readings from
//! them are never trusted.

use std::env;

use crate::store::models::current_timestamp;
use crate::store::{Machine, NewCleaning, Store, StoreError, WeightObservation};

/// Cleaner-name markers distinguishing the three detection paths.
pub const CLEANER_RECORD_FLOW: &str = "System Detected";
pub const CLEANER_RESCAN: &str = "System (Historical Scan)";
pub const CLEANER_LIVE_POLL: &str = "System Detected (Auto)";

/// Detected cleanings await ops confirmation.
pub const CLEANING_PENDING: &str = "PENDING";

/// How many stored snapshots to walk back through when looking for a
/// reliable baseline.
const BASELINE_LOOKBACK: u32 = 10;

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// A bin above this counted as loaded, kg.
    pub full_threshold_kg: f64,
    /// A reading below this counts as emptied, kg.
    pub empty_threshold_kg: f64,
    /// UCO tanks rarely read near zero after a collection; residue keeps
    /// them heavier, so they get a wider empty band.
    pub uco_empty_threshold_kg: f64,
    /// Readings below this are "near zero" for glitch filtering, kg.
    pub glitch_epsilon_kg: f64,
    /// Minimum live-poll movement worth persisting, kg.
    pub weight_sync_epsilon_kg: f64,
    /// Devices wired as UCO tanks regardless of their configured labels.
    pub uco_devices: Vec<String>,
    /// Rescan looks this far back over stored snapshots.
    pub rescan_window_hours: i64,
    /// Live-poll dedup horizon. Polls have no previous-observation
    /// timestamp, so repeats within this window are the same event.
    pub poll_dedup_window_secs: i64,
}

impl DetectorConfig {
    pub fn with_defaults() -> Self {
        Self {
            full_threshold_kg: 0.5,
            empty_threshold_kg: 1.0,
            uco_empty_threshold_kg: 2.0,
            glitch_epsilon_kg: 0.1,
            weight_sync_epsilon_kg: 0.05,
            uco_devices: vec![
                "071582000007".to_string(),
                "071582000009".to_string(),
            ],
            rescan_window_hours: 24,
            poll_dedup_window_secs: 45 * 60,
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::with_defaults();

        let uco_devices = env::var("UCO_DEVICES")
            .map(|s| {
                s.split(',')
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty())
                    .collect()
            })
            .unwrap_or(defaults.uco_devices);

        Self {
            full_threshold_kg: env_f64("CLEANING_FULL_THRESHOLD_KG", defaults.full_threshold_kg),
            empty_threshold_kg: env_f64("CLEANING_EMPTY_THRESHOLD_KG", defaults.empty_threshold_kg),
            uco_empty_threshold_kg: env_f64(
                "UCO_EMPTY_THRESHOLD_KG",
                defaults.uco_empty_threshold_kg,
            ),
            glitch_epsilon_kg: env_f64("WEIGHT_GLITCH_EPSILON_KG", defaults.glitch_epsilon_kg),
            weight_sync_epsilon_kg: env_f64(
                "WEIGHT_SYNC_EPSILON_KG",
                defaults.weight_sync_epsilon_kg,
            ),
            uco_devices,
            rescan_window_hours: env_i64("RESCAN_WINDOW_HOURS", defaults.rescan_window_hours),
            poll_dedup_window_secs: env_i64(
                "POLL_DEDUP_WINDOW_SECS",
                defaults.poll_dedup_window_secs,
            ),
        }
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Two chronologically adjacent reliable observations of one device.
#[derive(Debug, Clone)]
pub struct WeightWindow {
    pub previous: WeightObservation,
    pub current: WeightObservation,
}

/// Output of a positive window evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedCleaning {
    pub waste_type: String,
    pub bag_weight_collected: f64,
    pub cleaned_at: i64,
    pub photo_url: Option<String>,
}

#[derive(Clone)]
pub struct CleaningDetector {
    config: DetectorConfig,
}

impl CleaningDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(DetectorConfig::with_defaults())
    }

    /// UCO class is keyed off the wired device list or a UCO waste label.
    pub fn is_uco(&self, device_no: &str, waste_type: Option<&str>) -> bool {
        if self.config.uco_devices.iter().any(|d| d == device_no) {
            return true;
        }
        waste_type
            .map(|w| w.to_uppercase().contains("UCO"))
            .unwrap_or(false)
    }

    /// Sensor trust rules. An unreliable observation must never appear on
    /// either side of a window.
    ///
    /// - UCO class + near-zero bin weight: the known load-cell glitch.
    /// - Any device reporting a positive disposal into a near-zero bin:
    ///   physically impossible, the scale misread.
    pub fn is_reliable(&self, device_no: &str, obs: &WeightObservation) -> bool {
        if obs.bin_weight < self.config.glitch_epsilon_kg {
            if self.is_uco(device_no, obs.waste_type.as_deref()) {
                return false;
            }
            if obs.disposal_weight > 0.0 {
                return false;
            }
        }
        true
    }

    fn empty_threshold(&self, device_no: &str, waste_type: Option<&str>) -> f64 {
        if self.is_uco(device_no, waste_type) {
            self.config.uco_empty_threshold_kg
        } else {
            self.config.empty_threshold_kg
        }
    }

    /// The canonical window rule. Both observations must already have passed
    /// `is_reliable`. The cleaning inherits waste type and photo from the
    /// previous observation: that is the bag being carried out.
    pub fn evaluate(&self, device_no: &str, window: &WeightWindow) -> Option<DetectedCleaning> {
        let prev = &window.previous;
        let curr = &window.current;
        let empty = self.empty_threshold(device_no, prev.waste_type.as_deref());

        if prev.bin_weight > self.config.full_threshold_kg
            && curr.bin_weight < empty
            && curr.bin_weight < prev.bin_weight
        {
            return Some(DetectedCleaning {
                waste_type: prev
                    .waste_type
                    .clone()
                    .unwrap_or_else(|| "Unknown".to_string()),
                bag_weight_collected: prev.bin_weight,
                cleaned_at: curr.at,
                photo_url: prev.photo_url.clone(),
            });
        }
        None
    }

    /// Incremental check run for every record during import, before the
    /// record itself is inserted. Pairs the incoming observation with the
    /// latest reliable stored snapshot. Returns true if a cleaning was
    /// written.
    pub fn check_record(
        &self,
        store: &Store,
        machine: &Machine,
        obs: &WeightObservation,
    ) -> Result<bool, StoreError> {
        if !self.is_reliable(&machine.device_no, obs) {
            log::debug!(
                "⚠️ {}: skipping unreliable reading {:.2}kg",
                machine.device_no,
                obs.bin_weight
            );
            return Ok(false);
        }

        let history =
            store.recent_snapshots_before(&machine.device_no, obs.at, BASELINE_LOOKBACK)?;
        let Some(previous) = history
            .into_iter()
            .find(|o| self.is_reliable(&machine.device_no, o))
        else {
            return Ok(false);
        };

        let window = WeightWindow {
            previous,
            current: obs.clone(),
        };
        let Some(event) = self.evaluate(&machine.device_no, &window) else {
            return Ok(false);
        };

        if store.cleaning_exists_between(&machine.device_no, window.previous.at, event.cleaned_at)? {
            return Ok(false);
        }

        self.record_event(store, machine, event, CLEANER_RECORD_FLOW)?;
        Ok(true)
    }

    /// Sweep a device's stored snapshot history, evaluating every adjacent
    /// reliable pair. Catches windows the record flow could not see (both
    /// sides imported in the same batch). Returns new events written.
    pub fn scan_device_history(
        &self,
        store: &Store,
        machine: &Machine,
        now: i64,
    ) -> Result<u32, StoreError> {
        let since = now - self.config.rescan_window_hours * 3600;
        let reliable: Vec<WeightObservation> = store
            .device_snapshots_since(&machine.device_no, since)?
            .into_iter()
            .filter(|o| self.is_reliable(&machine.device_no, o))
            .collect();

        let mut detected = 0u32;
        for pair in reliable.windows(2) {
            let window = WeightWindow {
                previous: pair[0].clone(),
                current: pair[1].clone(),
            };
            let Some(event) = self.evaluate(&machine.device_no, &window) else {
                continue;
            };
            if store.cleaning_exists_between(
                &machine.device_no,
                window.previous.at,
                event.cleaned_at,
            )? {
                continue;
            }
            self.record_event(store, machine, event, CLEANER_RESCAN)?;
            detected += 1;
        }
        Ok(detected)
    }

    /// Compare a live-poll reading against the machine's stored bin weight.
    /// Persists the fresh reading, then applies the window rule with the
    /// captured value as the previous observation. Returns true if a
    /// cleaning was written.
    pub fn check_live_weight(
        &self,
        store: &Store,
        machine: &Machine,
        position: i64,
        live_weight_kg: f64,
        now: i64,
    ) -> Result<bool, StoreError> {
        let stored = machine.bin_weight(position);
        let waste = machine.bin_label(position).unwrap_or("Unknown").to_string();
        let uco = self.is_uco(&machine.device_no, Some(&waste));

        if uco && live_weight_kg < self.config.glitch_epsilon_kg {
            log::debug!(
                "⚠️ {} pos {}: ignoring zero reading from UCO load cell",
                machine.device_no,
                position
            );
            return Ok(false);
        }

        // Claim the fresh reading first; detection compares the captured value
        if (live_weight_kg - stored).abs() > self.config.weight_sync_epsilon_kg {
            store.update_bin_weight(&machine.device_no, position, live_weight_kg)?;
        }

        let empty = self.empty_threshold(&machine.device_no, Some(&waste));
        if stored > self.config.full_threshold_kg
            && live_weight_kg < empty
            && live_weight_kg < stored
        {
            let since = now - self.config.poll_dedup_window_secs;
            if store.recent_cleaning_exists(&machine.device_no, &waste, since)? {
                log::debug!(
                    "🧹 {} pos {}: drop already logged within dedup window",
                    machine.device_no,
                    position
                );
                return Ok(false);
            }
            let event = DetectedCleaning {
                waste_type: waste,
                bag_weight_collected: stored,
                cleaned_at: now,
                photo_url: None,
            };
            log::info!(
                "🧹 {} pos {}: bin drop {:.2}kg -> {:.2}kg",
                machine.device_no,
                position,
                stored,
                live_weight_kg
            );
            self.record_event(store, machine, event, CLEANER_LIVE_POLL)?;
            return Ok(true);
        }

        Ok(false)
    }

    fn record_event(
        &self,
        store: &Store,
        machine: &Machine,
        event: DetectedCleaning,
        cleaner_name: &str,
    ) -> Result<(), StoreError> {
        log::info!(
            "🧹 Cleaning on {}: {:.2}kg of {} collected",
            machine.device_no,
            event.bag_weight_collected,
            event.waste_type
        );
        store.insert_cleaning(
            &NewCleaning {
                device_no: machine.device_no.clone(),
                merchant_id: Some(machine.merchant_id.clone()),
                waste_type: event.waste_type,
                bag_weight_collected: event.bag_weight_collected,
                cleaned_at: event.cleaned_at,
                photo_url: event.photo_url,
                cleaner_name: cleaner_name.to_string(),
                status: CLEANING_PENDING.to_string(),
            },
            current_timestamp(),
        )
    }
}
