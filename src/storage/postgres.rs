//! PostgreSQL store.
//!
//! Uniqueness relies on the constraints created by `schema.rs`; inserts use
//! `ON CONFLICT DO NOTHING RETURNING` and fall back to reading the row that
//! won, so concurrent retries of the same reading never duplicate.

use std::collections::HashMap;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{ActivityTarget, AlertInsert, AppendOutcome, Storage, StorageCounts};
use crate::error::StorageError;
use crate::models::{
    ActivityLog, Alert, AlertEvent, Calibration, DbId, Measurement, NewMeasurement, Parameter,
    ParameterType, Station, ThresholdRule,
};
use crate::registry::Registry;
use crate::rules::RuleStore;

/// Column list for measures queries, aliased to `Measurement` fields.
const MEASURE_COLUMNS: &str =
    "id, parameter_id, value, raw_value, observed_at, ingested_at, reading_key";

/// Column list for alerts queries, aliased to `Alert` fields.
const ALERT_COLUMNS: &str = "id, measure_id AS measurement_id, type_alert_id AS rule_id, \
    type_alert_version AS rule_version, triggered_at, start_date AS created_at, is_read, read_at";

// ---

#[derive(Debug, sqlx::FromRow)]
struct StationRow {
    // ---
    id: DbId,
    name: String,
    uid: String,
    address: Vec<String>,
    latitude: f64,
    longitude: f64,
    initial_date: DateTime<Utc>,
    last_date: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct ActivityRow {
    // ---
    owner_id: DbId,
    changed_at: DateTime<Utc>,
    is_active: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct ParameterTypeRow {
    // ---
    id: DbId,
    name: String,
    measure_unit: String,
}

#[derive(Debug, sqlx::FromRow)]
struct CalibrationRow {
    // ---
    parameter_type_id: DbId,
    effective_from: DateTime<Utc>,
    offset_value: f64,
    factor: f64,
    qnt_decimals: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct ParameterRow {
    // ---
    id: DbId,
    parameter_type_id: DbId,
    station_id: DbId,
}

#[derive(Debug, sqlx::FromRow)]
struct TypeAlertRow {
    // ---
    id: DbId,
    version: i32,
    parameter_id: Option<DbId>,
    name: String,
    math_signal: String,
    value: f64,
    status: String,
    is_active: bool,
    valid_from: DateTime<Utc>,
    valid_to: Option<DateTime<Utc>>,
}

impl TryFrom<TypeAlertRow> for ThresholdRule {
    type Error = StorageError;

    fn try_from(row: TypeAlertRow) -> Result<Self, Self::Error> {
        // ---
        let corrupt = |e: crate::error::RuleError| {
            StorageError::Corrupt(format!("type_alerts ({}, {}): {e}", row.id, row.version))
        };
        Ok(ThresholdRule {
            id: row.id,
            version: row.version,
            parameter_id: row.parameter_id,
            comparator: row.math_signal.parse().map_err(corrupt)?,
            status: row.status.parse().map_err(corrupt)?,
            name: row.name,
            value: row.value,
            is_active: row.is_active,
            valid_from: row.valid_from,
            valid_to: row.valid_to,
        })
    }
}

/// Configuration snapshot loaded at startup.
#[derive(Debug, Default)]
pub struct Catalog {
    // ---
    pub stations: Vec<Station>,
    pub parameter_types: Vec<ParameterType>,
    pub parameters: Vec<Parameter>,
    pub rules: Vec<ThresholdRule>,
    /// Station id -> latest `observed_at` stored for it.
    pub last_seen: Vec<(DbId, DateTime<Utc>)>,
}

impl Catalog {
    // ---
    /// Populate the in-memory registry and rule store.
    pub fn install(self, registry: &Registry, rules: &RuleStore) -> AnyResult<()> {
        // ---
        let (stations, parameters, rule_versions) = (
            self.stations.len(),
            self.parameters.len(),
            self.rules.len(),
        );

        for station in self.stations {
            registry.upsert_station(station);
        }
        for ptype in self.parameter_types {
            registry.upsert_parameter_type(ptype);
        }
        for parameter in self.parameters {
            registry.upsert_parameter(parameter)?;
        }
        for (station_id, at) in self.last_seen {
            registry.touch_station(station_id, at);
        }
        rules.load(self.rules)?;

        tracing::info!(stations, parameters, rule_versions, "Catalog installed");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    // ---
    pool: PgPool,
}

impl PgStore {
    // ---
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Read stations, parameters, calibrations and rule versions.
    pub async fn load_catalog(&self) -> Result<Catalog, StorageError> {
        // ---
        let station_rows = sqlx::query_as::<_, StationRow>(
            "SELECT id, name, uid, address, latitude, longitude, initial_date, last_date
             FROM weather_stations ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        let station_activity = self
            .activity_rows("SELECT station_id AS owner_id, changed_at, is_active FROM station_activity")
            .await?;

        let last_seen = station_rows
            .iter()
            .filter_map(|row| row.last_date.map(|at| (row.id, at)))
            .collect();
        let stations = station_rows
            .into_iter()
            .map(|row| Station {
                activity: station_activity.get(&row.id).cloned().unwrap_or_default(),
                id: row.id,
                uid: row.uid,
                name: row.name,
                address: row.address,
                latitude: row.latitude,
                longitude: row.longitude,
                created_at: row.initial_date,
            })
            .collect();

        let type_rows = sqlx::query_as::<_, ParameterTypeRow>(
            "SELECT id, name, measure_unit FROM parameter_types ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        let calibration_rows = sqlx::query_as::<_, CalibrationRow>(
            "SELECT parameter_type_id, effective_from, offset_value, factor, qnt_decimals
             FROM parameter_calibrations ORDER BY parameter_type_id, effective_from",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut calibrations: HashMap<DbId, Vec<Calibration>> = HashMap::new();
        for row in calibration_rows {
            let decimals = u32::try_from(row.qnt_decimals).map_err(|_| {
                StorageError::Corrupt(format!(
                    "parameter type {} has negative decimals",
                    row.parameter_type_id
                ))
            })?;
            calibrations
                .entry(row.parameter_type_id)
                .or_default()
                .push(Calibration {
                    effective_from: row.effective_from,
                    offset: row.offset_value,
                    factor: row.factor,
                    decimals,
                });
        }
        let parameter_types = type_rows
            .into_iter()
            .map(|row| ParameterType {
                calibrations: calibrations.remove(&row.id).unwrap_or_default(),
                id: row.id,
                name: row.name,
                unit: row.measure_unit,
            })
            .collect();

        let parameter_rows = sqlx::query_as::<_, ParameterRow>(
            "SELECT id, parameter_type_id, station_id FROM parameters ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        let parameter_activity = self
            .activity_rows(
                "SELECT parameter_id AS owner_id, changed_at, is_active FROM parameter_activity",
            )
            .await?;
        let parameters = parameter_rows
            .into_iter()
            .map(|row| Parameter {
                activity: parameter_activity.get(&row.id).cloned().unwrap_or_default(),
                id: row.id,
                station_id: row.station_id,
                parameter_type_id: row.parameter_type_id,
            })
            .collect();

        let rules = sqlx::query_as::<_, TypeAlertRow>(
            "SELECT id, version, parameter_id, name, math_signal, value, status, is_active,
                    valid_from, valid_to
             FROM type_alerts ORDER BY id, version",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ThresholdRule::try_from)
        .collect::<Result<Vec<_>, _>>()?;

        Ok(Catalog {
            stations,
            parameter_types,
            parameters,
            rules,
            last_seen,
        })
    }

    async fn activity_rows(
        &self,
        query: &str,
    ) -> Result<HashMap<DbId, ActivityLog>, StorageError> {
        // ---
        let rows = sqlx::query_as::<_, ActivityRow>(query)
            .fetch_all(&self.pool)
            .await?;
        let mut logs: HashMap<DbId, ActivityLog> = HashMap::new();
        for row in rows {
            logs.entry(row.owner_id)
                .or_default()
                .set(row.changed_at, row.is_active);
        }
        Ok(logs)
    }
}

#[async_trait]
impl Storage for PgStore {
    async fn append_measurement(&self, new: NewMeasurement) -> Result<AppendOutcome, StorageError> {
        // ---
        let insert = format!(
            "INSERT INTO measures (parameter_id, value, raw_value, observed_at, reading_key)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (parameter_id, reading_key) DO NOTHING
             RETURNING {MEASURE_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, Measurement>(&insert)
            .bind(new.parameter_id)
            .bind(new.value)
            .bind(new.raw_value)
            .bind(new.observed_at)
            .bind(&new.reading_key)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(measurement) = inserted {
            return Ok(AppendOutcome::Inserted(measurement));
        }

        let select = format!(
            "SELECT {MEASURE_COLUMNS} FROM measures WHERE parameter_id = $1 AND reading_key = $2"
        );
        sqlx::query_as::<_, Measurement>(&select)
            .bind(new.parameter_id)
            .bind(&new.reading_key)
            .fetch_optional(&self.pool)
            .await?
            .map(AppendOutcome::Existing)
            .ok_or_else(|| {
                StorageError::Corrupt(format!(
                    "measurement for parameter {} conflicted but is missing",
                    new.parameter_id
                ))
            })
    }

    async fn get_measurement(&self, id: DbId) -> Result<Option<Measurement>, StorageError> {
        // ---
        let query = format!("SELECT {MEASURE_COLUMNS} FROM measures WHERE id = $1");
        Ok(sqlx::query_as::<_, Measurement>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn insert_alert(&self, event: &AlertEvent) -> Result<AlertInsert, StorageError> {
        // ---
        let insert = format!(
            "INSERT INTO alerts (measure_id, type_alert_id, type_alert_version, triggered_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (measure_id, type_alert_id) DO NOTHING
             RETURNING {ALERT_COLUMNS}"
        );
        let created = sqlx::query_as::<_, Alert>(&insert)
            .bind(event.measurement_id)
            .bind(event.rule_id)
            .bind(event.rule_version)
            .bind(event.triggered_at)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(alert) = created {
            return Ok(AlertInsert::Created(alert));
        }

        let select = format!(
            "SELECT {ALERT_COLUMNS} FROM alerts WHERE measure_id = $1 AND type_alert_id = $2"
        );
        sqlx::query_as::<_, Alert>(&select)
            .bind(event.measurement_id)
            .bind(event.rule_id)
            .fetch_optional(&self.pool)
            .await?
            .map(AlertInsert::Existing)
            .ok_or_else(|| {
                StorageError::Corrupt(format!(
                    "alert ({}, {}) conflicted but is missing",
                    event.measurement_id, event.rule_id
                ))
            })
    }

    async fn get_alert(&self, id: DbId) -> Result<Option<Alert>, StorageError> {
        // ---
        let query = format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = $1");
        Ok(sqlx::query_as::<_, Alert>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn claim_notification(&self, alert_id: DbId) -> Result<bool, StorageError> {
        // ---
        let claimed: Option<DbId> = sqlx::query_scalar(
            "UPDATE alerts SET notified_at = now()
             WHERE id = $1 AND notified_at IS NULL
             RETURNING id",
        )
        .bind(alert_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed.is_some())
    }

    async fn alerts_for_measurement(
        &self,
        measurement_id: DbId,
    ) -> Result<Vec<Alert>, StorageError> {
        // ---
        let query =
            format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE measure_id = $1 ORDER BY id");
        Ok(sqlx::query_as::<_, Alert>(&query)
            .bind(measurement_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn mark_alert_read(
        &self,
        id: DbId,
        at: DateTime<Utc>,
    ) -> Result<Option<Alert>, StorageError> {
        // ---
        let query = format!(
            "UPDATE alerts SET is_read = TRUE, read_at = COALESCE(read_at, $2)
             WHERE id = $1
             RETURNING {ALERT_COLUMNS}"
        );
        Ok(sqlx::query_as::<_, Alert>(&query)
            .bind(id)
            .bind(at)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn save_rule_version(&self, rule: &ThresholdRule) -> Result<(), StorageError> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO type_alerts (
                id, version, parameter_id, name, math_signal, value,
                status, is_active, valid_from, valid_to
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id, version) DO UPDATE SET valid_to = EXCLUDED.valid_to
            "#,
        )
        .bind(rule.id)
        .bind(rule.version)
        .bind(rule.parameter_id)
        .bind(&rule.name)
        .bind(rule.comparator.symbol())
        .bind(rule.value)
        .bind(rule.status.as_str())
        .bind(rule.is_active)
        .bind(rule.valid_from)
        .bind(rule.valid_to)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_activity(
        &self,
        target: ActivityTarget,
        at: DateTime<Utc>,
        active: bool,
    ) -> Result<(), StorageError> {
        // ---
        let (query, owner_id) = match target {
            ActivityTarget::Station(id) => (
                "INSERT INTO station_activity (station_id, changed_at, is_active)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (station_id, changed_at) DO UPDATE SET is_active = EXCLUDED.is_active",
                id,
            ),
            ActivityTarget::Parameter(id) => (
                "INSERT INTO parameter_activity (parameter_id, changed_at, is_active)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (parameter_id, changed_at) DO UPDATE SET is_active = EXCLUDED.is_active",
                id,
            ),
        };
        sqlx::query(query)
            .bind(owner_id)
            .bind(at)
            .bind(active)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn record_last_seen(
        &self,
        station_id: DbId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        // ---
        // GREATEST ignores NULL, so the first write simply sets it
        sqlx::query("UPDATE weather_stations SET last_date = GREATEST(last_date, $2) WHERE id = $1")
            .bind(station_id)
            .bind(at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn counts(&self) -> Result<StorageCounts, StorageError> {
        // ---
        let (measurements, alerts, unread_alerts): (i64, i64, i64) = sqlx::query_as(
            "SELECT (SELECT COUNT(*) FROM measures),
                    (SELECT COUNT(*) FROM alerts),
                    (SELECT COUNT(*) FROM alerts WHERE NOT is_read)",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StorageCounts {
            measurements: measurements as u64,
            alerts: alerts as u64,
            unread_alerts: unread_alerts as u64,
        })
    }
}
