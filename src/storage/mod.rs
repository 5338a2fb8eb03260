//! Persistence seam for measurements, alerts and configuration history.
//!
//! Both implementations enforce the two uniqueness keys atomically:
//! `(parameter_id, reading_key)` for measurements and
//! `(measurement_id, rule_id)` for alerts. Inserting a duplicate returns the
//! existing row instead of failing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StorageError;
use crate::models::{Alert, AlertEvent, DbId, Measurement, NewMeasurement, ThresholdRule};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{Catalog, PgStore};

// ---

#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Inserted(Measurement),
    /// Same `(parameter_id, reading_key)` was stored before.
    Existing(Measurement),
}

impl AppendOutcome {
    // ---
    pub fn measurement(&self) -> &Measurement {
        // ---
        match self {
            AppendOutcome::Inserted(m) | AppendOutcome::Existing(m) => m,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlertInsert {
    Created(Alert),
    Existing(Alert),
}

/// Entity whose activity flag changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityTarget {
    Station(DbId),
    Parameter(DbId),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageCounts {
    // ---
    pub measurements: u64,
    pub alerts: u64,
    pub unread_alerts: u64,
}

#[async_trait]
pub trait Storage: Send + Sync {
    // ---
    async fn append_measurement(&self, new: NewMeasurement) -> Result<AppendOutcome, StorageError>;

    async fn get_measurement(&self, id: DbId) -> Result<Option<Measurement>, StorageError>;

    /// Insert the alert unless one exists for the same measurement and rule.
    async fn insert_alert(&self, event: &AlertEvent) -> Result<AlertInsert, StorageError>;

    async fn get_alert(&self, id: DbId) -> Result<Option<Alert>, StorageError>;

    /// Mark the alert's notification as handed out. Returns `true` only for
    /// the first caller, so retries of an interrupted admission can still
    /// deliver it exactly once.
    async fn claim_notification(&self, alert_id: DbId) -> Result<bool, StorageError>;

    async fn alerts_for_measurement(&self, measurement_id: DbId)
        -> Result<Vec<Alert>, StorageError>;

    /// Set `is_read`; `read_at` keeps the first transition time.
    /// Returns `None` when the alert does not exist.
    async fn mark_alert_read(
        &self,
        id: DbId,
        at: DateTime<Utc>,
    ) -> Result<Option<Alert>, StorageError>;

    /// Upsert one rule version keyed by `(id, version)`.
    async fn save_rule_version(&self, rule: &ThresholdRule) -> Result<(), StorageError>;

    async fn record_activity(
        &self,
        target: ActivityTarget,
        at: DateTime<Utc>,
        active: bool,
    ) -> Result<(), StorageError>;

    /// Advance the station's last-seen time; never moves backwards.
    async fn record_last_seen(
        &self,
        station_id: DbId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    async fn counts(&self) -> Result<StorageCounts, StorageError>;
}
