//! Error taxonomy for the alert engine.
//!
//! Every failure during ingestion is attributable to a single reading and is
//! reported through [`IngestError`] inside the batch result. A duplicate alert
//! is not an error and has no variant here.

use std::time::Duration;

use serde::Serialize;

use crate::models::DbId;

/// Reading rejected before calibration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("unknown parameter {0}")]
    UnknownParameter(DbId),

    #[error("parameter {0} is inactive at the observation time")]
    InactiveParameter(DbId),

    #[error("station {station_id} of parameter {parameter_id} is inactive at the observation time")]
    InactiveStation { station_id: DbId, parameter_id: DbId },

    #[error("parameter {parameter_id} references unknown station {station_id}")]
    UnknownStation { station_id: DbId, parameter_id: DbId },

    #[error("unknown parameter type {0}")]
    UnknownParameterType(DbId),

    #[error("unknown station {0}")]
    StationNotFound(DbId),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalibrationError {
    #[error("no calibration available for parameter {0} at the observation time")]
    Unavailable(DbId),

    #[error("calibration collaborator failed: {0}")]
    Collaborator(String),
}

/// Invalid rule configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuleError {
    #[error("invalid comparator '{0}'")]
    InvalidComparator(String),

    #[error("invalid rule status '{0}'")]
    InvalidStatus(String),

    #[error("rule threshold must be a finite number")]
    NonFiniteThreshold,

    #[error("unknown rule {0}")]
    UnknownRule(DbId),

    #[error("unknown parameter {0}")]
    UnknownParameter(DbId),

    #[error("edit of rule {rule_id} at {requested} precedes its current version")]
    EditBeforeCurrentVersion {
        rule_id: DbId,
        requested: chrono::DateTime<chrono::Utc>,
    },

    #[error("rule {rule_id} is already assigned to parameter {parameter_id}")]
    AlreadyAssigned { rule_id: DbId, parameter_id: DbId },

    #[error(transparent)]
    Lookup(#[from] RuleLookupError),
}

/// Rule store unavailable.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("rule store unavailable: {0}")]
pub struct RuleLookupError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("inconsistent row: {0}")]
    Corrupt(String),
}

/// Failure of a configuration change (rule edit, activity flag).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("change applied in memory but not persisted: {0}")]
    Storage(#[from] StorageError),
}

/// Why a single reading did not complete.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    RuleLookup(#[from] RuleLookupError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    #[error("not processed: rule store failed earlier in this batch")]
    RuleLookupAborted,

    #[error("not processed: batch was cancelled")]
    Cancelled,

    #[error("ingest worker failed: {0}")]
    Worker(String),
}

/// Stable machine-readable rejection category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    Validation,
    Calibration,
    RuleLookup,
    Storage,
    Timeout,
    RuleLookupAborted,
    Cancelled,
    Worker,
}

impl IngestError {
    // ---
    pub fn kind(&self) -> RejectionKind {
        // ---
        match self {
            IngestError::Validation(_) => RejectionKind::Validation,
            IngestError::Calibration(_) => RejectionKind::Calibration,
            IngestError::RuleLookup(_) => RejectionKind::RuleLookup,
            IngestError::Storage(_) => RejectionKind::Storage,
            IngestError::Timeout { .. } => RejectionKind::Timeout,
            IngestError::RuleLookupAborted => RejectionKind::RuleLookupAborted,
            IngestError::Cancelled => RejectionKind::Cancelled,
            IngestError::Worker(_) => RejectionKind::Worker,
        }
    }

    /// Whether resubmitting the same reading may succeed.
    ///
    /// Validation failures are final until the configuration changes.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, IngestError::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_retryable_classification() {
        // ---
        let validation = IngestError::from(ValidationError::InactiveParameter(3));
        assert!(!validation.is_retryable());
        assert_eq!(validation.kind(), RejectionKind::Validation);

        let calibration = IngestError::from(CalibrationError::Unavailable(3));
        assert!(calibration.is_retryable());

        let timeout = IngestError::Timeout {
            operation: "calibration",
            elapsed: Duration::from_millis(10),
        };
        assert!(timeout.is_retryable());
        assert_eq!(timeout.to_string(), "calibration timed out after 10ms");

        assert!(IngestError::Cancelled.is_retryable());
        assert!(IngestError::RuleLookupAborted.is_retryable());
    }

    #[test]
    fn test_rejection_kind_serializes_snake_case() {
        // ---
        let json = serde_json::to_string(&RejectionKind::RuleLookupAborted).unwrap();
        assert_eq!(json, "\"rule_lookup_aborted\"");
    }
}
