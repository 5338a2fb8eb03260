//! Station / parameter catalog used to validate readings.
//!
//! The catalog is read on every reading and written only by configuration
//! changes, so readers load an `Arc` snapshot without locking and writers
//! swap in a modified copy. Station last-seen timestamps change per reading and live in their
//! own map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};

use crate::error::ValidationError;
use crate::models::{Calibration, DbId, Parameter, ParameterType, Station};

// ---

#[derive(Debug, Clone, Default)]
struct Catalog {
    // ---
    stations: HashMap<DbId, Station>,
    parameter_types: HashMap<DbId, ParameterType>,
    parameters: HashMap<DbId, Parameter>,
}

/// Identity of a parameter that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterContext {
    // ---
    pub parameter_id: DbId,
    pub station_id: DbId,
    pub parameter_type_id: DbId,
}

#[derive(Debug)]
pub struct Registry {
    // ---
    catalog: ArcSwap<Catalog>,
    writer: Mutex<()>,
    last_seen: Mutex<HashMap<DbId, DateTime<Utc>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            catalog: ArcSwap::from_pointee(Catalog::default()),
            writer: Mutex::new(()),
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    fn snapshot(&self) -> Arc<Catalog> {
        self.catalog.load_full()
    }

    fn update<T>(
        &self,
        f: impl FnOnce(&mut Catalog) -> Result<T, ValidationError>,
    ) -> Result<T, ValidationError> {
        // ---
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = Catalog::clone(&self.catalog.load());
        let out = f(&mut next)?;
        self.catalog.store(Arc::new(next));
        Ok(out)
    }

    pub fn upsert_station(&self, station: Station) {
        // ---
        let _ = self.update(|c| {
            c.stations.insert(station.id, station);
            Ok(())
        });
    }

    pub fn upsert_parameter_type(&self, mut ptype: ParameterType) {
        // ---
        ptype.calibrations.sort_by_key(|c| c.effective_from);
        let _ = self.update(|c| {
            c.parameter_types.insert(ptype.id, ptype);
            Ok(())
        });
    }

    /// Register a parameter. Its station and type must already exist.
    pub fn upsert_parameter(&self, parameter: Parameter) -> Result<(), ValidationError> {
        // ---
        self.update(|c| {
            if !c.stations.contains_key(&parameter.station_id) {
                return Err(ValidationError::UnknownStation {
                    station_id: parameter.station_id,
                    parameter_id: parameter.id,
                });
            }
            if !c.parameter_types.contains_key(&parameter.parameter_type_id) {
                return Err(ValidationError::UnknownParameterType(
                    parameter.parameter_type_id,
                ));
            }
            c.parameters.insert(parameter.id, parameter);
            Ok(())
        })
    }

    /// Record a station activation or deactivation effective at `at`.
    ///
    /// Deactivation stops acceptance of readings observed from `at` onwards;
    /// history is untouched.
    pub fn set_station_active(
        &self,
        station_id: DbId,
        at: DateTime<Utc>,
        active: bool,
    ) -> Result<(), ValidationError> {
        // ---
        self.update(|c| {
            let station = c
                .stations
                .get_mut(&station_id)
                .ok_or(ValidationError::StationNotFound(station_id))?;
            station.activity.set(at, active);
            Ok(())
        })?;
        tracing::info!(station_id, %at, active, "Station activity changed");
        Ok(())
    }

    pub fn set_parameter_active(
        &self,
        parameter_id: DbId,
        at: DateTime<Utc>,
        active: bool,
    ) -> Result<(), ValidationError> {
        // ---
        self.update(|c| {
            let parameter = c
                .parameters
                .get_mut(&parameter_id)
                .ok_or(ValidationError::UnknownParameter(parameter_id))?;
            parameter.activity.set(at, active);
            Ok(())
        })?;
        tracing::info!(parameter_id, %at, active, "Parameter activity changed");
        Ok(())
    }

    /// Append a calibration change. Stored measurements keep the value they
    /// were calibrated with.
    pub fn add_calibration(
        &self,
        parameter_type_id: DbId,
        calibration: Calibration,
    ) -> Result<(), ValidationError> {
        // ---
        self.update(|c| {
            let ptype = c
                .parameter_types
                .get_mut(&parameter_type_id)
                .ok_or(ValidationError::UnknownParameterType(parameter_type_id))?;
            let idx = ptype
                .calibrations
                .partition_point(|existing| existing.effective_from <= calibration.effective_from);
            ptype.calibrations.insert(idx, calibration);
            Ok(())
        })
    }

    /// Check that a reading for `parameter_id` observed at `at` may be accepted.
    pub fn validate(
        &self,
        parameter_id: DbId,
        at: DateTime<Utc>,
    ) -> Result<ParameterContext, ValidationError> {
        // ---
        let catalog = self.snapshot();
        let parameter = catalog
            .parameters
            .get(&parameter_id)
            .ok_or(ValidationError::UnknownParameter(parameter_id))?;
        let station = catalog.stations.get(&parameter.station_id).ok_or(
            ValidationError::UnknownStation {
                station_id: parameter.station_id,
                parameter_id,
            },
        )?;

        if !parameter.activity.is_active_at(at) {
            return Err(ValidationError::InactiveParameter(parameter_id));
        }
        if !station.activity.is_active_at(at) {
            return Err(ValidationError::InactiveStation {
                station_id: station.id,
                parameter_id,
            });
        }

        Ok(ParameterContext {
            parameter_id,
            station_id: station.id,
            parameter_type_id: parameter.parameter_type_id,
        })
    }

    /// Whether the parameter and its station were both active at `at`.
    pub fn is_parameter_effective(&self, parameter_id: DbId, at: DateTime<Utc>) -> bool {
        self.validate(parameter_id, at).is_ok()
    }

    pub fn calibration_at(&self, parameter_id: DbId, at: DateTime<Utc>) -> Option<Calibration> {
        // ---
        let catalog = self.snapshot();
        let parameter = catalog.parameters.get(&parameter_id)?;
        catalog
            .parameter_types
            .get(&parameter.parameter_type_id)?
            .calibration_at(at)
            .copied()
    }

    pub fn contains_parameter(&self, parameter_id: DbId) -> bool {
        self.snapshot().parameters.contains_key(&parameter_id)
    }

    pub fn station(&self, station_id: DbId) -> Option<Station> {
        self.snapshot().stations.get(&station_id).cloned()
    }

    pub fn parameter(&self, parameter_id: DbId) -> Option<Parameter> {
        self.snapshot().parameters.get(&parameter_id).cloned()
    }

    /// Advance the station's last-seen time; never moves backwards.
    pub fn touch_station(&self, station_id: DbId, at: DateTime<Utc>) {
        // ---
        let mut seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = seen.entry(station_id).or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }

    pub fn last_seen(&self, station_id: DbId) -> Option<DateTime<Utc>> {
        // ---
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&station_id)
            .copied()
    }
}
