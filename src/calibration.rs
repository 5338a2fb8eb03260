//! Calibration adapter seam.
//!
//! The pipeline only depends on [`Calibrator`]. [`RegistryCalibrator`] applies
//! the parameter type's offset/factor/decimals in force at the observation
//! time, which keeps replays byte-for-byte reproducible.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CalibrationError;
use crate::models::DbId;
use crate::registry::Registry;

#[async_trait]
pub trait Calibrator: Send + Sync {
    /// Convert a raw sensor value into a calibrated measurement value.
    async fn calibrate(
        &self,
        parameter_id: DbId,
        raw_value: f64,
        observed_at: DateTime<Utc>,
    ) -> Result<f64, CalibrationError>;
}

pub struct RegistryCalibrator {
    // ---
    registry: Arc<Registry>,
}

impl RegistryCalibrator {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Calibrator for RegistryCalibrator {
    async fn calibrate(
        &self,
        parameter_id: DbId,
        raw_value: f64,
        observed_at: DateTime<Utc>,
    ) -> Result<f64, CalibrationError> {
        // ---
        let calibration = self
            .registry
            .calibration_at(parameter_id, observed_at)
            .ok_or(CalibrationError::Unavailable(parameter_id))?;

        let value = calibration.apply(raw_value);
        if !value.is_finite() {
            return Err(CalibrationError::Collaborator(format!(
                "raw value {raw_value} calibrates to a non-finite number"
            )));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{ActivityLog, Calibration, Parameter, ParameterType, Station};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    fn registry() -> Arc<Registry> {
        // ---
        let registry = Registry::new();
        registry.upsert_station(Station {
            id: 1,
            uid: "ST-001".into(),
            name: "Ridge".into(),
            address: vec![],
            latitude: 0.0,
            longitude: 0.0,
            created_at: t0(),
            activity: ActivityLog::active_since(t0()),
        });
        registry.upsert_parameter_type(ParameterType {
            id: 10,
            name: "pressure".into(),
            unit: "hPa".into(),
            calibrations: vec![Calibration {
                effective_from: t0(),
                offset: 2.0,
                factor: 0.5,
                decimals: 2,
            }],
        });
        registry
            .upsert_parameter(Parameter {
                id: 100,
                station_id: 1,
                parameter_type_id: 10,
                activity: ActivityLog::active_since(t0()),
            })
            .unwrap();
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_applies_offset_and_factor() {
        // ---
        let calibrator = RegistryCalibrator::new(registry());
        let value = calibrator
            .calibrate(100, 2026.5, t0() + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(value, 1015.25);
    }

    #[tokio::test]
    async fn test_unavailable_before_first_calibration() {
        // ---
        let calibrator = RegistryCalibrator::new(registry());
        let err = calibrator
            .calibrate(100, 1.0, t0() - Duration::days(1))
            .await
            .unwrap_err();
        assert_eq!(err, CalibrationError::Unavailable(100));

        let err = calibrator.calibrate(555, 1.0, t0()).await.unwrap_err();
        assert_eq!(err, CalibrationError::Unavailable(555));
    }

    #[tokio::test]
    async fn test_non_finite_result_rejected() {
        // ---
        let calibrator = RegistryCalibrator::new(registry());
        let err = calibrator
            .calibrate(100, f64::INFINITY, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, CalibrationError::Collaborator(_)));
    }
}
