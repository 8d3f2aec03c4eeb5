//! rvmflow - Reverse-vending machine fleet backend
//!
//! Mirrors a vendor-hosted RVM cloud into a local SQLite operational store:
//! disposal records, bin-cleaning events derived from weight telemetry, and
//! user wallet balances.
//!
//! # Architecture
//!
//! ```text
//! Vendor cloud API (signed HTTP) → VendorClient
//!     ↓
//! RecordImporter (idempotent disposal-record import + pricing)
//!     ↓
//! CleaningDetector (weight-drop windows → cleaning_records)
//!     ↓
//! BalanceReconciler (vendor balance vs local mirror → wallet corrections)
//!     ↓
//! Store (SQLite, WAL) ← webhook ingest (machine_logs, PUT/OVERFLOW)
//! ```

pub mod config;
pub mod detector;
pub mod importer;
pub mod jobs;
pub mod reconciler;
pub mod store;
pub mod vendor;
pub mod webhook;
