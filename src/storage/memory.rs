//! In-process store with the same uniqueness guarantees as PostgreSQL.
//!
//! Used by tests and local runs. Failure and latency can be injected to
//! exercise the pipeline's partial-failure and timeout paths.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ActivityTarget, AlertInsert, AppendOutcome, Storage, StorageCounts};
use crate::error::StorageError;
use crate::models::{Alert, AlertEvent, DbId, Measurement, NewMeasurement, ThresholdRule};

#[derive(Debug, Default)]
struct MemoryState {
    // ---
    measurements: Vec<Measurement>,
    measurement_keys: HashMap<(DbId, String), usize>,
    alerts: Vec<Alert>,
    alert_pairs: HashMap<(DbId, DbId), usize>,
    notified: HashSet<DbId>,
    rule_versions: HashMap<(DbId, i32), ThresholdRule>,
    activity: Vec<(ActivityTarget, DateTime<Utc>, bool)>,
    last_seen: HashMap<DbId, DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    // ---
    state: Mutex<MemoryState>,
    failing_alert_writes: AtomicUsize,
    alert_write_grace: AtomicUsize,
    failing_measurement_writes: AtomicUsize,
    write_latency_ms: AtomicU64,
}

impl MemoryStore {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` alert inserts fail with `StorageError::Unavailable`.
    pub fn inject_alert_write_failures(&self, count: usize) {
        self.inject_alert_write_failures_after(0, count);
    }

    /// Let `successes` alert inserts through, then fail the next `count`.
    pub fn inject_alert_write_failures_after(&self, successes: usize, count: usize) {
        // ---
        self.alert_write_grace.store(successes, Ordering::SeqCst);
        self.failing_alert_writes.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` measurement appends fail.
    pub fn inject_measurement_write_failures(&self, count: usize) {
        self.failing_measurement_writes.store(count, Ordering::SeqCst);
    }

    /// Delay every write by `latency`.
    pub fn set_write_latency(&self, latency: Duration) {
        self.write_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn rule_versions(&self) -> Vec<ThresholdRule> {
        // ---
        let mut versions: Vec<ThresholdRule> =
            self.lock().rule_versions.values().cloned().collect();
        versions.sort_by_key(|r| (r.id, r.version));
        versions
    }

    pub fn activity_changes(&self) -> Vec<(ActivityTarget, DateTime<Utc>, bool)> {
        self.lock().activity.clone()
    }

    pub fn station_last_seen(&self, station_id: DbId) -> Option<DateTime<Utc>> {
        self.lock().last_seen.get(&station_id).copied()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // Rows are only pushed after all checks, so a poisoned guard still
        // holds consistent data.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn before_write(
        &self,
        failures: &AtomicUsize,
        grace: Option<&AtomicUsize>,
    ) -> Result<(), StorageError> {
        // ---
        let latency = self.write_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if grace.is_some_and(consume) {
            return Ok(());
        }
        if consume(failures) {
            return Err(StorageError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }
}

/// Decrement `counter` if it is positive; `true` when it was.
fn consume(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Storage for MemoryStore {
    async fn append_measurement(&self, new: NewMeasurement) -> Result<AppendOutcome, StorageError> {
        // ---
        self.before_write(&self.failing_measurement_writes, None).await?;

        let mut state = self.lock();
        if let Some(key) = &new.reading_key {
            if let Some(&idx) = state.measurement_keys.get(&(new.parameter_id, key.clone())) {
                return Ok(AppendOutcome::Existing(state.measurements[idx].clone()));
            }
        }

        let measurement = Measurement {
            id: state.measurements.len() as DbId + 1,
            parameter_id: new.parameter_id,
            value: new.value,
            raw_value: new.raw_value,
            observed_at: new.observed_at,
            ingested_at: Utc::now(),
            reading_key: new.reading_key,
        };
        let idx = state.measurements.len();
        if let Some(key) = &measurement.reading_key {
            state
                .measurement_keys
                .insert((measurement.parameter_id, key.clone()), idx);
        }
        state.measurements.push(measurement.clone());
        Ok(AppendOutcome::Inserted(measurement))
    }

    async fn get_measurement(&self, id: DbId) -> Result<Option<Measurement>, StorageError> {
        // ---
        let state = self.lock();
        Ok(state.measurements.iter().find(|m| m.id == id).cloned())
    }

    async fn insert_alert(&self, event: &AlertEvent) -> Result<AlertInsert, StorageError> {
        // ---
        self.before_write(&self.failing_alert_writes, Some(&self.alert_write_grace))
            .await?;

        let mut state = self.lock();
        let pair = (event.measurement_id, event.rule_id);
        if let Some(&idx) = state.alert_pairs.get(&pair) {
            return Ok(AlertInsert::Existing(state.alerts[idx].clone()));
        }

        let alert = Alert {
            id: state.alerts.len() as DbId + 1,
            measurement_id: event.measurement_id,
            rule_id: event.rule_id,
            rule_version: event.rule_version,
            triggered_at: event.triggered_at,
            created_at: Utc::now(),
            is_read: false,
            read_at: None,
        };
        let idx = state.alerts.len();
        state.alert_pairs.insert(pair, idx);
        state.alerts.push(alert.clone());
        Ok(AlertInsert::Created(alert))
    }

    async fn get_alert(&self, id: DbId) -> Result<Option<Alert>, StorageError> {
        // ---
        let state = self.lock();
        Ok(state.alerts.iter().find(|a| a.id == id).cloned())
    }

    async fn claim_notification(&self, alert_id: DbId) -> Result<bool, StorageError> {
        Ok(self.lock().notified.insert(alert_id))
    }

    async fn alerts_for_measurement(
        &self,
        measurement_id: DbId,
    ) -> Result<Vec<Alert>, StorageError> {
        // ---
        let state = self.lock();
        Ok(state
            .alerts
            .iter()
            .filter(|a| a.measurement_id == measurement_id)
            .cloned()
            .collect())
    }

    async fn mark_alert_read(
        &self,
        id: DbId,
        at: DateTime<Utc>,
    ) -> Result<Option<Alert>, StorageError> {
        // ---
        let mut state = self.lock();
        let Some(alert) = state.alerts.iter_mut().find(|a| a.id == id) else {
            return Ok(None);
        };
        if !alert.is_read {
            alert.is_read = true;
            alert.read_at = Some(at);
        }
        Ok(Some(alert.clone()))
    }

    async fn save_rule_version(&self, rule: &ThresholdRule) -> Result<(), StorageError> {
        // ---
        self.lock()
            .rule_versions
            .insert((rule.id, rule.version), rule.clone());
        Ok(())
    }

    async fn record_activity(
        &self,
        target: ActivityTarget,
        at: DateTime<Utc>,
        active: bool,
    ) -> Result<(), StorageError> {
        // ---
        self.lock().activity.push((target, at, active));
        Ok(())
    }

    async fn record_last_seen(
        &self,
        station_id: DbId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        // ---
        let mut state = self.lock();
        let seen = state.last_seen.entry(station_id).or_insert(at);
        if at > *seen {
            *seen = at;
        }
        Ok(())
    }

    async fn counts(&self) -> Result<StorageCounts, StorageError> {
        // ---
        let state = self.lock();
        Ok(StorageCounts {
            measurements: state.measurements.len() as u64,
            alerts: state.alerts.len() as u64,
            unread_alerts: state.alerts.iter().filter(|a| !a.is_read).count() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn reading(key: Option<&str>) -> NewMeasurement {
        // ---
        NewMeasurement {
            parameter_id: 100,
            value: 42.0,
            raw_value: 420.0,
            observed_at: at(),
            reading_key: key.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_keyed_append_is_idempotent() {
        // ---
        let store = MemoryStore::new();
        let first = store.append_measurement(reading(Some("k1"))).await.unwrap();
        let again = store.append_measurement(reading(Some("k1"))).await.unwrap();

        assert_matches!(first, AppendOutcome::Inserted(_));
        assert_matches!(again, AppendOutcome::Existing(ref m) if m.id == first.measurement().id);
        assert_eq!(store.counts().await.unwrap().measurements, 1);
    }

    #[tokio::test]
    async fn test_unkeyed_append_always_inserts() {
        // ---
        let store = MemoryStore::new();
        store.append_measurement(reading(None)).await.unwrap();
        store.append_measurement(reading(None)).await.unwrap();
        assert_eq!(store.counts().await.unwrap().measurements, 2);
    }

    #[tokio::test]
    async fn test_alert_pair_unique() {
        // ---
        let store = MemoryStore::new();
        let event = AlertEvent {
            measurement_id: 1,
            rule_id: 9,
            rule_version: 1,
            triggered_at: at(),
        };

        let created = store.insert_alert(&event).await.unwrap();
        let AlertInsert::Created(alert) = created else {
            panic!("expected a new alert");
        };
        assert!(!alert.is_read);

        let again = store.insert_alert(&event).await.unwrap();
        assert_eq!(again, AlertInsert::Existing(alert));
        assert_eq!(store.counts().await.unwrap().alerts, 1);
    }

    #[tokio::test]
    async fn test_mark_read_keeps_first_timestamp() {
        // ---
        let store = MemoryStore::new();
        let event = AlertEvent {
            measurement_id: 1,
            rule_id: 9,
            rule_version: 1,
            triggered_at: at(),
        };
        store.insert_alert(&event).await.unwrap();

        let first = store.mark_alert_read(1, at()).await.unwrap().unwrap();
        let later = at() + chrono::Duration::hours(1);
        let second = store.mark_alert_read(1, later).await.unwrap().unwrap();
        assert!(second.is_read);
        assert_eq!(second.read_at, first.read_at);

        assert!(store.mark_alert_read(99, at()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        // ---
        let store = MemoryStore::new();
        store.inject_measurement_write_failures(1);
        assert_matches!(
            store.append_measurement(reading(None)).await,
            Err(StorageError::Unavailable(_))
        );
        assert!(store.append_measurement(reading(None)).await.is_ok());
    }

    #[tokio::test]
    async fn test_notification_claimed_once() {
        // ---
        let store = MemoryStore::new();
        assert!(store.claim_notification(1).await.unwrap());
        assert!(!store.claim_notification(1).await.unwrap());
        assert!(store.claim_notification(2).await.unwrap());
    }

    #[tokio::test]
    async fn test_last_seen_never_moves_backwards() {
        // ---
        let store = MemoryStore::new();
        let later = at() + chrono::Duration::minutes(5);
        store.record_last_seen(1, later).await.unwrap();
        store.record_last_seen(1, at()).await.unwrap();
        assert_eq!(store.station_last_seen(1), Some(later));
        assert_eq!(store.station_last_seen(2), None);
    }
}
