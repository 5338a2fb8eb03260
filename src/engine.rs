//! Facade wiring registry, rule store, pipeline and lifecycle together.
//!
//! This is the surface collaborators use: batch ingestion, mark-as-read,
//! active-rule listing, and the configuration changes that must be mirrored
//! to persistence (rule versions, activity flags).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::calibration::Calibrator;
use crate::error::{ConfigError, IngestError, RuleLookupError, StorageError};
use crate::lifecycle::{Admission, AlertLifecycle, ReadAck};
use crate::models::{DbId, RawReading, ThresholdRule};
use crate::notify::NotificationSink;
use crate::pipeline::{BatchResult, IngestLimits, IngestPipeline};
use crate::registry::Registry;
use crate::rules::{NewRule, RuleChange, RuleEdit, RuleStore};
use crate::storage::{ActivityTarget, Storage, StorageCounts};

pub struct AlertEngine {
    // ---
    registry: Arc<Registry>,
    rules: Arc<RuleStore>,
    storage: Arc<dyn Storage>,
    lifecycle: Arc<AlertLifecycle>,
    pipeline: Arc<IngestPipeline>,
}

impl AlertEngine {
    // ---
    pub fn new(
        registry: Arc<Registry>,
        rules: Arc<RuleStore>,
        storage: Arc<dyn Storage>,
        calibrator: Arc<dyn Calibrator>,
        sink: Arc<dyn NotificationSink>,
        limits: IngestLimits,
    ) -> Self {
        // ---
        let lifecycle = Arc::new(AlertLifecycle::new(
            Arc::clone(&storage),
            Arc::clone(&rules),
            sink,
            limits.storage_timeout,
        ));
        let pipeline = Arc::new(IngestPipeline::new(
            Arc::clone(&registry),
            Arc::clone(&rules),
            calibrator,
            Arc::clone(&storage),
            Arc::clone(&lifecycle),
            limits,
        ));
        Self {
            registry,
            rules,
            storage,
            lifecycle,
            pipeline,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    pub async fn ingest_batch(&self, readings: Vec<RawReading>) -> BatchResult {
        self.pipeline.ingest_batch(readings).await
    }

    pub async fn ingest_batch_with_cancel(
        &self,
        readings: Vec<RawReading>,
        cancel: CancellationToken,
    ) -> BatchResult {
        self.pipeline.ingest_batch_with_cancel(readings, cancel).await
    }

    pub async fn reevaluate(
        &self,
        measurement_id: DbId,
    ) -> Result<Option<Vec<Admission>>, IngestError> {
        self.pipeline.reevaluate(measurement_id).await
    }

    pub async fn mark_alert_read(&self, alert_id: DbId) -> Result<ReadAck, StorageError> {
        self.lifecycle.mark_read(alert_id).await
    }

    pub fn list_active_rules(
        &self,
        parameter_id: DbId,
    ) -> Result<Vec<ThresholdRule>, RuleLookupError> {
        self.rules.list_active_rules(parameter_id)
    }

    pub async fn counts(&self) -> Result<StorageCounts, StorageError> {
        self.storage.counts().await
    }

    // --- configuration changes

    pub async fn create_rule(
        &self,
        new: NewRule,
        effective_at: DateTime<Utc>,
    ) -> Result<ThresholdRule, ConfigError> {
        // ---
        let rule = self.rules.create_rule(new, effective_at)?;
        self.storage.save_rule_version(&rule).await?;
        Ok(rule)
    }

    pub async fn edit_rule(
        &self,
        rule_id: DbId,
        edit: RuleEdit,
        effective_at: DateTime<Utc>,
    ) -> Result<RuleChange, ConfigError> {
        // ---
        let change = self.rules.edit_rule(rule_id, edit, effective_at)?;
        self.persist_change(&change).await?;
        Ok(change)
    }

    pub async fn deactivate_rule(
        &self,
        rule_id: DbId,
        effective_at: DateTime<Utc>,
    ) -> Result<RuleChange, ConfigError> {
        // ---
        let change = self.rules.deactivate_rule(rule_id, effective_at)?;
        self.persist_change(&change).await?;
        Ok(change)
    }

    pub async fn assign_rule(
        &self,
        rule_id: DbId,
        parameter_id: DbId,
        effective_at: DateTime<Utc>,
    ) -> Result<RuleChange, ConfigError> {
        // ---
        let change = self.rules.assign_rule(rule_id, parameter_id, effective_at)?;
        self.persist_change(&change).await?;
        Ok(change)
    }

    async fn persist_change(&self, change: &RuleChange) -> Result<(), StorageError> {
        // ---
        if let Some(closed) = &change.closed {
            self.storage.save_rule_version(closed).await?;
        }
        self.storage.save_rule_version(&change.opened).await
    }

    /// Activate or deactivate a station from `at` onwards. History is kept.
    pub async fn set_station_active(
        &self,
        station_id: DbId,
        at: DateTime<Utc>,
        active: bool,
    ) -> Result<(), ConfigError> {
        // ---
        self.registry.set_station_active(station_id, at, active)?;
        self.storage
            .record_activity(ActivityTarget::Station(station_id), at, active)
            .await?;
        Ok(())
    }

    pub async fn set_parameter_active(
        &self,
        parameter_id: DbId,
        at: DateTime<Utc>,
        active: bool,
    ) -> Result<(), ConfigError> {
        // ---
        self.registry.set_parameter_active(parameter_id, at, active)?;
        self.storage
            .record_activity(ActivityTarget::Parameter(parameter_id), at, active)
            .await?;
        Ok(())
    }
}
