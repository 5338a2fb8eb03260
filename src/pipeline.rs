//! Batch ingestion: validate, calibrate, store, evaluate, admit.
//!
//! Readings are grouped by parameter. Each group runs on its own task and
//! processes its readings in arrival order while holding that parameter's
//! lock, so two batches touching the same parameter never interleave. Groups
//! for different parameters run in parallel, bounded by a semaphore.
//!
//! Failures are collected per reading. Nothing that fails for one reading
//! aborts the batch, except that a rule-store failure stops the readings that
//! have not started yet. Committed rows are never rolled back; retries rely
//! on the dedup keys. A reading that fails after its measurement was stored
//! still reports the measurement and the alerts admitted before the failure.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::calibration::Calibrator;
use crate::error::{IngestError, RejectionKind};
use crate::evaluator;
use crate::lifecycle::{Admission, AlertLifecycle, RejectReason};
use crate::models::{DbId, Measurement, NewMeasurement, RawReading};
use crate::registry::Registry;
use crate::rules::RuleStore;
use crate::storage::{AppendOutcome, Storage};

// ---

/// Caller-supplied bounds for one pipeline.
#[derive(Debug, Clone, Copy)]
pub struct IngestLimits {
    // ---
    pub calibration_timeout: Duration,
    /// Applies to each storage call separately.
    pub storage_timeout: Duration,
    pub max_parallel_parameters: usize,
}

impl Default for IngestLimits {
    fn default() -> Self {
        // ---
        Self {
            calibration_timeout: Duration::from_millis(2000),
            storage_timeout: Duration::from_millis(5000),
            max_parallel_parameters: 8,
        }
    }
}

/// A reading that did not complete.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    // ---
    /// Position of the reading in the submitted batch.
    pub index: usize,
    pub parameter_id: DbId,
    pub observed_at: DateTime<Utc>,
    pub kind: RejectionKind,
    pub retryable: bool,
    pub message: String,
}

impl Rejection {
    fn new(index: usize, reading: &RawReading, err: &IngestError) -> Self {
        // ---
        Self {
            index,
            parameter_id: reading.parameter_id,
            observed_at: reading.observed_at,
            kind: err.kind(),
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    // ---
    pub batch_id: Uuid,
    /// Measurements appended by this batch.
    pub stored_count: usize,
    /// Readings whose `reading_key` matched an already stored measurement.
    pub replayed_count: usize,
    pub created_alerts: Vec<DbId>,
    pub duplicate_alerts: Vec<DbId>,
    pub rejected_events: Vec<RejectReason>,
    pub rejections: Vec<Rejection>,
}

impl BatchResult {
    // ---
    fn new(batch_id: Uuid) -> Self {
        // ---
        Self {
            batch_id,
            stored_count: 0,
            replayed_count: 0,
            created_alerts: Vec::new(),
            duplicate_alerts: Vec::new(),
            rejected_events: Vec::new(),
            rejections: Vec::new(),
        }
    }

    fn record(&mut self, report: ReadingReport) {
        // ---
        if report.newly_stored {
            self.stored_count += 1;
        } else {
            self.replayed_count += 1;
        }
        for admission in report.admissions {
            match admission {
                Admission::Created { alert_id } => self.created_alerts.push(alert_id),
                Admission::AlreadyExists { alert_id } => self.duplicate_alerts.push(alert_id),
                Admission::Rejected { reason } => self.rejected_events.push(reason),
            }
        }
    }

    fn reject(&mut self, index: usize, reading: &RawReading, err: &IngestError) {
        // ---
        warn!(
            index,
            parameter_id = reading.parameter_id,
            kind = ?err.kind(),
            error = %err,
            "Reading rejected"
        );
        self.rejections.push(Rejection::new(index, reading, err));
    }

    pub fn rejected_count(&self) -> usize {
        self.rejections.len()
    }

    /// Rejections worth resubmitting.
    pub fn retryable(&self) -> impl Iterator<Item = &Rejection> {
        self.rejections.iter().filter(|r| r.retryable)
    }
}

/// Work done for a reading whose measurement was stored. `error` is set when
/// evaluation or admission failed afterwards.
#[derive(Debug)]
struct ReadingReport {
    // ---
    station_id: DbId,
    newly_stored: bool,
    admissions: Vec<Admission>,
    error: Option<IngestError>,
}

type ReadingOutcome = (usize, RawReading, Result<ReadingReport, IngestError>);

pub struct IngestPipeline {
    // ---
    registry: Arc<Registry>,
    rules: Arc<RuleStore>,
    calibrator: Arc<dyn Calibrator>,
    storage: Arc<dyn Storage>,
    lifecycle: Arc<AlertLifecycle>,
    limits: IngestLimits,
    parameter_locks: Mutex<HashMap<DbId, Arc<tokio::sync::Mutex<()>>>>,
    last_observed: Mutex<HashMap<DbId, DateTime<Utc>>>,
}

impl IngestPipeline {
    // ---
    pub fn new(
        registry: Arc<Registry>,
        rules: Arc<RuleStore>,
        calibrator: Arc<dyn Calibrator>,
        storage: Arc<dyn Storage>,
        lifecycle: Arc<AlertLifecycle>,
        limits: IngestLimits,
    ) -> Self {
        // ---
        Self {
            registry,
            rules,
            calibrator,
            storage,
            lifecycle,
            limits,
            parameter_locks: Mutex::new(HashMap::new()),
            last_observed: Mutex::new(HashMap::new()),
        }
    }

    pub async fn ingest_batch(self: &Arc<Self>, readings: Vec<RawReading>) -> BatchResult {
        self.ingest_batch_with_cancel(readings, CancellationToken::new())
            .await
    }

    /// Ingest a batch; readings not yet started when `cancel` fires are
    /// rejected as `Cancelled`. A reading already in flight completes.
    pub async fn ingest_batch_with_cancel(
        self: &Arc<Self>,
        readings: Vec<RawReading>,
        cancel: CancellationToken,
    ) -> BatchResult {
        // ---
        let batch_id = Uuid::new_v4();
        let span = tracing::info_span!("ingest_batch", %batch_id, readings = readings.len());
        self.run_batch(batch_id, readings, cancel)
            .instrument(span)
            .await
    }

    async fn run_batch(
        self: &Arc<Self>,
        batch_id: Uuid,
        readings: Vec<RawReading>,
        cancel: CancellationToken,
    ) -> BatchResult {
        // ---
        let submitted: Vec<(usize, RawReading)> = readings.into_iter().enumerate().collect();
        let groups = group_by_parameter(submitted.clone());
        let group_count = groups.len();

        let semaphore = Arc::new(Semaphore::new(self.limits.max_parallel_parameters.max(1)));
        let lookup_failed = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();

        for (parameter_id, group) in groups {
            let pipeline = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let lookup_failed = Arc::clone(&lookup_failed);
            tasks.spawn(
                async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    pipeline
                        .run_group(parameter_id, group, &cancel, &lookup_failed)
                        .await
                }
                .in_current_span(),
            );
        }

        let mut outcomes: Vec<ReadingOutcome> = Vec::with_capacity(submitted.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(group_outcomes) => outcomes.extend(group_outcomes),
                Err(e) => warn!(error = %e, "Ingest worker failed"),
            }
        }

        // Readings of a worker that panicked have no outcome
        let reported: HashSet<usize> = outcomes.iter().map(|(index, ..)| *index).collect();
        for (index, reading) in submitted {
            if !reported.contains(&index) {
                let err = IngestError::Worker("task terminated before reporting".into());
                outcomes.push((index, reading, Err(err)));
            }
        }
        outcomes.sort_by_key(|(index, ..)| *index);

        let mut result = BatchResult::new(batch_id);
        let mut touched_stations = HashSet::new();
        for (index, reading, outcome) in outcomes {
            match outcome {
                Ok(mut report) => {
                    touched_stations.insert(report.station_id);
                    let error = report.error.take();
                    result.record(report);
                    if let Some(err) = error {
                        result.reject(index, &reading, &err);
                    }
                }
                Err(err) => result.reject(index, &reading, &err),
            }
        }
        self.persist_last_seen(touched_stations).await;

        info!(
            parameters = group_count,
            stored = result.stored_count,
            replayed = result.replayed_count,
            alerts_created = result.created_alerts.len(),
            alerts_deduplicated = result.duplicate_alerts.len(),
            rejected = result.rejected_count(),
            "Batch ingested"
        );
        result
    }

    async fn run_group(
        &self,
        parameter_id: DbId,
        group: Vec<(usize, RawReading)>,
        cancel: &CancellationToken,
        lookup_failed: &AtomicBool,
    ) -> Vec<ReadingOutcome> {
        // ---
        let lock = self.parameter_lock(parameter_id);
        let _ordered = lock.lock().await;

        let mut outcomes = Vec::with_capacity(group.len());
        for (index, reading) in group {
            let result = if cancel.is_cancelled() {
                Err(IngestError::Cancelled)
            } else if lookup_failed.load(Ordering::SeqCst) {
                Err(IngestError::RuleLookupAborted)
            } else {
                self.process_reading(&reading).await
            };

            if is_lookup_failure(&result) {
                lookup_failed.store(true, Ordering::SeqCst);
            }
            outcomes.push((index, reading, result));
        }
        outcomes
    }

    async fn process_reading(&self, reading: &RawReading) -> Result<ReadingReport, IngestError> {
        // ---
        let ctx = self
            .registry
            .validate(reading.parameter_id, reading.observed_at)?;

        let value = bounded(
            "calibration",
            self.limits.calibration_timeout,
            self.calibrator
                .calibrate(reading.parameter_id, reading.raw_value, reading.observed_at),
        )
        .await?;

        let appended = bounded(
            "measurement write",
            self.limits.storage_timeout,
            self.storage.append_measurement(NewMeasurement {
                parameter_id: reading.parameter_id,
                value,
                raw_value: reading.raw_value,
                observed_at: reading.observed_at,
                reading_key: reading.reading_key.clone(),
            }),
        )
        .await?;

        let newly_stored = matches!(appended, AppendOutcome::Inserted(_));
        let measurement = match appended {
            AppendOutcome::Inserted(m) | AppendOutcome::Existing(m) => m,
        };
        debug!(
            measurement_id = measurement.id,
            parameter_id = measurement.parameter_id,
            value = measurement.value,
            newly_stored,
            "Measurement stored"
        );

        self.registry
            .touch_station(ctx.station_id, reading.observed_at);
        self.note_arrival(reading.parameter_id, reading.observed_at);

        let (admissions, error) = self.evaluate_and_admit(&measurement).await;
        Ok(ReadingReport {
            station_id: ctx.station_id,
            newly_stored,
            admissions,
            error,
        })
    }

    /// Admissions made before a failure are returned along with it.
    async fn evaluate_and_admit(
        &self,
        measurement: &Measurement,
    ) -> (Vec<Admission>, Option<IngestError>) {
        // ---
        let rules = match self
            .rules
            .rules_for(measurement.parameter_id, measurement.observed_at)
        {
            Ok(rules) => rules,
            Err(e) => return (Vec::new(), Some(e.into())),
        };
        let events = evaluator::evaluate(measurement, &rules);

        let mut admissions = Vec::with_capacity(events.len());
        for event in events {
            match self.lifecycle.admit(event).await {
                Ok(admission) => admissions.push(admission),
                Err(e) => return (admissions, Some(e)),
            }
        }
        (admissions, None)
    }

    /// Write the last-seen time of every station a batch touched. A failed
    /// write is logged; the next batch for that station writes it again.
    async fn persist_last_seen(&self, stations: HashSet<DbId>) {
        // ---
        for station_id in stations {
            let Some(at) = self.registry.last_seen(station_id) else {
                continue;
            };
            let written = bounded(
                "station last-seen write",
                self.limits.storage_timeout,
                self.storage.record_last_seen(station_id, at),
            )
            .await;
            if let Err(e) = written {
                warn!(station_id, error = %e, "Failed to persist station last-seen");
            }
        }
    }

    /// Re-run evaluation for a stored measurement against the rules that were
    /// in force at its timestamp. Returns `None` for an unknown measurement.
    pub async fn reevaluate(
        &self,
        measurement_id: DbId,
    ) -> Result<Option<Vec<Admission>>, IngestError> {
        // ---
        let measurement = bounded(
            "measurement read",
            self.limits.storage_timeout,
            self.storage.get_measurement(measurement_id),
        )
        .await?;
        let Some(measurement) = measurement else {
            return Ok(None);
        };

        let lock = self.parameter_lock(measurement.parameter_id);
        let _ordered = lock.lock().await;
        match self.evaluate_and_admit(&measurement).await {
            (_, Some(err)) => Err(err),
            (admissions, None) => Ok(Some(admissions)),
        }
    }

    fn parameter_lock(&self, parameter_id: DbId) -> Arc<tokio::sync::Mutex<()>> {
        // ---
        let mut locks = self
            .parameter_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(parameter_id).or_default())
    }

    fn note_arrival(&self, parameter_id: DbId, observed_at: DateTime<Utc>) {
        // ---
        let mut last = self
            .last_observed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let latest = last.entry(parameter_id).or_insert(observed_at);
        if observed_at < *latest {
            debug!(
                parameter_id,
                %observed_at,
                latest = %latest,
                "Late reading evaluated against rules in force at its timestamp"
            );
        } else {
            *latest = observed_at;
        }
    }
}

/// Split readings by parameter, keeping arrival order inside each group and
/// first-appearance order across groups.
fn group_by_parameter(readings: Vec<(usize, RawReading)>) -> Vec<(DbId, Vec<(usize, RawReading)>)> {
    // ---
    let mut slots: HashMap<DbId, usize> = HashMap::new();
    let mut groups: Vec<(DbId, Vec<(usize, RawReading)>)> = Vec::new();
    for (index, reading) in readings {
        let slot = *slots.entry(reading.parameter_id).or_insert_with(|| {
            groups.push((reading.parameter_id, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push((index, reading));
    }
    groups
}

fn is_lookup_failure(outcome: &Result<ReadingReport, IngestError>) -> bool {
    // ---
    let error = match outcome {
        Ok(report) => report.error.as_ref(),
        Err(e) => Some(e),
    };
    matches!(error, Some(IngestError::RuleLookup(_)))
}

pub(crate) async fn bounded<T, E>(
    operation: &'static str,
    limit: Duration,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, IngestError>
where
    IngestError: From<E>,
{
    // ---
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(IngestError::from),
        Err(_) => Err(IngestError::Timeout {
            operation,
            elapsed: limit,
        }),
    }
}
