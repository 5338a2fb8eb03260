//! Alert-evaluation engine for the weather station telemetry platform.
//!
//! Raw readings are validated against station/parameter activity, calibrated,
//! appended as immutable measurements, evaluated against the threshold rule
//! versions in force at their timestamp, and turned into deduplicated alerts.
//!
//! Module map (leaf first):
//! - `models`, `error` – domain types and error taxonomy
//! - `registry` – stations, parameters, calibration history
//! - `rules` – versioned rule store with point-in-time lookup
//! - `evaluator` – pure comparator evaluation
//! - `calibration`, `storage`, `notify` – collaborator seams
//! - `lifecycle` – alert dedup and read state
//! - `pipeline` – batch ingestion
//! - `engine` – facade used by `routes` and `source`

pub mod calibration;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod lifecycle;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod registry;
pub mod routes;
pub mod rules;
pub mod schema;
pub mod source;
pub mod storage;

pub use config::Config;
pub use engine::AlertEngine;
pub use models::{Alert, DbId, Measurement, RawReading, ThresholdRule};
pub use pipeline::{BatchResult, IngestLimits};
