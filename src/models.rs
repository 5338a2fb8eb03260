//! Data models for the station alert engine.
//!
//! Stations own parameters, parameters own threshold rules, and the pipeline
//! appends measurements and alerts. Rules are stored as *versions* with an
//! activation window so that evaluation history stays reproducible after an
//! edit.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RuleError;

/// Surrogate key type shared by every table (`BIGINT`).
pub type DbId = i64;

// ---

/// Time-ordered on/off transitions for a station or parameter.
///
/// The state at `t` is the state of the last transition at or before `t`.
/// Before the first transition the entity is inactive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityLog {
    // ---
    transitions: Vec<(DateTime<Utc>, bool)>,
}

impl ActivityLog {
    // ---
    /// Log that starts active at `since`.
    pub fn active_since(since: DateTime<Utc>) -> Self {
        // ---
        Self {
            transitions: vec![(since, true)],
        }
    }

    /// Record a transition. Out-of-order transitions are inserted in place.
    pub fn set(&mut self, at: DateTime<Utc>, active: bool) {
        // ---
        let idx = self.transitions.partition_point(|(t, _)| *t <= at);
        self.transitions.insert(idx, (at, active));
    }

    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        // ---
        let idx = self.transitions.partition_point(|(t, _)| *t <= at);
        idx > 0 && self.transitions[idx - 1].1
    }

    pub fn transitions(&self) -> &[(DateTime<Utc>, bool)] {
        &self.transitions
    }
}

/// A physical weather-reporting site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    // ---
    pub id: DbId,
    pub uid: String,
    pub name: String,
    pub address: Vec<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub created_at: DateTime<Utc>,
    pub activity: ActivityLog,
}

/// Calibration coefficients in force from `effective_from` onwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    // ---
    pub effective_from: DateTime<Utc>,
    pub offset: f64,
    pub factor: f64,
    pub decimals: u32,
}

impl Calibration {
    // ---
    /// `raw * factor + offset`, rounded to the declared decimal precision.
    pub fn apply(&self, raw: f64) -> f64 {
        // ---
        let scale = 10f64.powi(self.decimals as i32);
        ((raw * self.factor + self.offset) * scale).round() / scale
    }
}

/// Unit and calibration history shared by parameters of the same kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterType {
    // ---
    pub id: DbId,
    pub name: String,
    pub unit: String,
    /// Sorted by `effective_from`.
    pub calibrations: Vec<Calibration>,
}

impl ParameterType {
    // ---
    pub fn calibration_at(&self, at: DateTime<Utc>) -> Option<&Calibration> {
        // ---
        let idx = self.calibrations.partition_point(|c| c.effective_from <= at);
        idx.checked_sub(1).map(|i| &self.calibrations[i])
    }
}

/// One measured quantity of a station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    // ---
    pub id: DbId,
    pub station_id: DbId,
    pub parameter_type_id: DbId,
    pub activity: ActivityLog,
}

// ---

/// Closed set of threshold comparators (`math_signal`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparator {
    // ---
    pub fn symbol(self) -> &'static str {
        // ---
        match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        }
    }

    /// Exact IEEE-754 comparison of `value` against `threshold`.
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        // ---
        match self {
            Comparator::Lt => value < threshold,
            Comparator::Le => value <= threshold,
            Comparator::Gt => value > threshold,
            Comparator::Ge => value >= threshold,
            Comparator::Eq => value == threshold,
            Comparator::Ne => value != threshold,
        }
    }
}

impl FromStr for Comparator {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s.trim() {
            "<" => Ok(Comparator::Lt),
            "<=" => Ok(Comparator::Le),
            ">" => Ok(Comparator::Gt),
            ">=" => Ok(Comparator::Ge),
            "==" | "=" => Ok(Comparator::Eq),
            "!=" | "<>" => Ok(Comparator::Ne),
            other => Err(RuleError::InvalidComparator(other.to_string())),
        }
    }
}

impl TryFrom<String> for Comparator {
    type Error = RuleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Comparator> for String {
    fn from(c: Comparator) -> Self {
        c.symbol().to_string()
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Workflow status of a rule version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Draft,
    Active,
    Deprecated,
}

impl RuleStatus {
    // ---
    pub fn as_str(self) -> &'static str {
        // ---
        match self {
            RuleStatus::Draft => "draft",
            RuleStatus::Active => "active",
            RuleStatus::Deprecated => "deprecated",
        }
    }
}

impl FromStr for RuleStatus {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s {
            "draft" => Ok(RuleStatus::Draft),
            "active" => Ok(RuleStatus::Active),
            "deprecated" => Ok(RuleStatus::Deprecated),
            other => Err(RuleError::InvalidStatus(other.to_string())),
        }
    }
}

/// One version of a threshold rule (`type_alerts` row).
///
/// The version is authoritative over `[valid_from, valid_to)`. An edit closes
/// the window and opens version `version + 1`; versions are never mutated
/// otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    // ---
    pub id: DbId,
    pub version: i32,
    /// `None` while the rule is unassigned (draft workflow).
    pub parameter_id: Option<DbId>,
    pub name: String,
    pub comparator: Comparator,
    pub value: f64,
    pub status: RuleStatus,
    pub is_active: bool,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
}

impl ThresholdRule {
    // ---
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        // ---
        self.valid_from <= at && self.valid_to.map_or(true, |end| at < end)
    }

    /// Whether this version takes part in evaluation at all.
    pub fn is_effective(&self) -> bool {
        // ---
        self.status == RuleStatus::Active && self.is_active && self.parameter_id.is_some()
    }

    pub fn is_violated_by(&self, value: f64) -> bool {
        self.comparator.holds(value, self.value)
    }
}

// ---

/// Raw reading as delivered by a station or the upstream API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    // ---
    pub parameter_id: DbId,
    pub raw_value: f64,
    pub observed_at: DateTime<Utc>,
    /// Caller-supplied idempotency key. Re-ingesting the same key for the
    /// same parameter reuses the stored measurement.
    #[serde(default)]
    pub reading_key: Option<String>,
}

/// Measurement to be appended by storage.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMeasurement {
    // ---
    pub parameter_id: DbId,
    pub value: f64,
    pub raw_value: f64,
    pub observed_at: DateTime<Utc>,
    pub reading_key: Option<String>,
}

/// Immutable calibrated fact (`measures` row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Measurement {
    // ---
    pub id: DbId,
    pub parameter_id: DbId,
    pub value: f64,
    pub raw_value: f64,
    pub observed_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub reading_key: Option<String>,
}

/// A violation produced by the evaluator, not yet admitted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    // ---
    pub measurement_id: DbId,
    pub rule_id: DbId,
    pub rule_version: i32,
    pub triggered_at: DateTime<Utc>,
}

/// Persisted record that a measurement violated a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Alert {
    // ---
    pub id: DbId,
    pub measurement_id: DbId,
    pub rule_id: DbId,
    pub rule_version: i32,
    pub triggered_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_comparator_parsing() {
        // ---
        assert_eq!(">=".parse::<Comparator>().unwrap(), Comparator::Ge);
        assert_eq!(" < ".parse::<Comparator>().unwrap(), Comparator::Lt);
        assert_eq!("=".parse::<Comparator>().unwrap(), Comparator::Eq);
        assert_eq!("<>".parse::<Comparator>().unwrap(), Comparator::Ne);

        let err = "=>".parse::<Comparator>().unwrap_err();
        assert!(matches!(err, RuleError::InvalidComparator(s) if s == "=>"));
    }

    #[test]
    fn test_comparator_serde_uses_symbol() {
        // ---
        let json = serde_json::to_string(&Comparator::Le).unwrap();
        assert_eq!(json, "\"<=\"");

        let parsed: Comparator = serde_json::from_str("\"!=\"").unwrap();
        assert_eq!(parsed, Comparator::Ne);

        assert!(serde_json::from_str::<Comparator>("\"~\"").is_err());
    }

    #[test]
    fn test_comparator_boundaries() {
        // ---
        assert!(!Comparator::Gt.holds(40.0, 40.0));
        assert!(Comparator::Ge.holds(40.0, 40.0));
        assert!(!Comparator::Lt.holds(40.0, 40.0));
        assert!(Comparator::Le.holds(40.0, 40.0));
        assert!(Comparator::Eq.holds(0.1 + 0.2, 0.1 + 0.2));
        assert!(Comparator::Ne.holds(0.1 + 0.2, 0.3));

        // NaN only satisfies "!="
        assert!(!Comparator::Gt.holds(f64::NAN, 0.0));
        assert!(!Comparator::Eq.holds(f64::NAN, f64::NAN));
        assert!(Comparator::Ne.holds(f64::NAN, 0.0));
    }

    #[test]
    fn test_activity_log() {
        // ---
        let mut log = ActivityLog::active_since(t0());
        log.set(t0() + Duration::hours(2), false);

        assert!(!log.is_active_at(t0() - Duration::seconds(1)));
        assert!(log.is_active_at(t0()));
        assert!(log.is_active_at(t0() + Duration::hours(1)));
        assert!(!log.is_active_at(t0() + Duration::hours(2)));

        // Out-of-order transition lands in place
        log.set(t0() + Duration::hours(1), false);
        assert!(!log.is_active_at(t0() + Duration::minutes(90)));
    }

    #[test]
    fn test_calibration_rounding() {
        // ---
        let cal = Calibration {
            effective_from: t0(),
            offset: -0.5,
            factor: 0.1,
            decimals: 1,
        };
        assert_eq!(cal.apply(423.0), 41.8);

        let whole = Calibration { decimals: 0, ..cal };
        assert_eq!(whole.apply(423.0), 42.0);
    }

    #[test]
    fn test_calibration_history_lookup() {
        // ---
        let first = Calibration {
            effective_from: t0(),
            offset: 0.0,
            factor: 1.0,
            decimals: 2,
        };
        let second = Calibration {
            effective_from: t0() + Duration::days(1),
            factor: 2.0,
            ..first
        };
        let ptype = ParameterType {
            id: 1,
            name: "temperature".into(),
            unit: "C".into(),
            calibrations: vec![first, second],
        };

        assert!(ptype.calibration_at(t0() - Duration::hours(1)).is_none());
        assert_eq!(ptype.calibration_at(t0()).unwrap().factor, 1.0);
        assert_eq!(
            ptype.calibration_at(t0() + Duration::days(2)).unwrap().factor,
            2.0
        );
    }

    #[test]
    fn test_rule_window() {
        // ---
        let rule = ThresholdRule {
            id: 1,
            version: 1,
            parameter_id: Some(7),
            name: "hot".into(),
            comparator: Comparator::Gt,
            value: 40.0,
            status: RuleStatus::Active,
            is_active: true,
            valid_from: t0(),
            valid_to: Some(t0() + Duration::hours(1)),
        };

        assert!(rule.covers(t0()));
        assert!(!rule.covers(t0() + Duration::hours(1)));
        assert!(rule.is_effective());

        let draft = ThresholdRule {
            status: RuleStatus::Draft,
            ..rule.clone()
        };
        assert!(!draft.is_effective());

        let unassigned = ThresholdRule {
            parameter_id: None,
            ..rule
        };
        assert!(!unassigned.is_effective());
    }
}
