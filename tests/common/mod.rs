//! Shared fixture: one station, two temperature parameters, in-memory store.
#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::mpsc::UnboundedReceiver;

use codemetal_stationalert::calibration::RegistryCalibrator;
use codemetal_stationalert::models::{
    ActivityLog, Alert, Calibration, Comparator, Parameter, ParameterType, RawReading,
    RuleStatus, Station,
};
use codemetal_stationalert::notify::ChannelSink;
use codemetal_stationalert::registry::Registry;
use codemetal_stationalert::rules::{NewRule, RuleStore};
use codemetal_stationalert::storage::MemoryStore;
use codemetal_stationalert::{AlertEngine, IngestLimits};

pub const STATION: i64 = 1;
pub const TEMPERATURE: i64 = 100;
pub const HUMIDITY: i64 = 200;

pub fn t(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
}

pub struct Fixture {
    pub engine: Arc<AlertEngine>,
    pub store: Arc<MemoryStore>,
    pub notifications: UnboundedReceiver<Alert>,
}

pub fn fixture() -> Fixture {
    fixture_with(IngestLimits::default())
}

pub fn fixture_with(limits: IngestLimits) -> Fixture {
    // ---
    let registry = Arc::new(Registry::new());
    registry.upsert_station(Station {
        id: STATION,
        uid: "ST-001".into(),
        name: "Ridge".into(),
        address: vec!["Ridge Road 1".into()],
        latitude: -23.55,
        longitude: -46.63,
        created_at: t(0),
        activity: ActivityLog::active_since(t(0)),
    });
    registry.upsert_parameter_type(ParameterType {
        id: 10,
        name: "temperature".into(),
        unit: "C".into(),
        calibrations: vec![Calibration {
            effective_from: t(0),
            offset: 0.0,
            factor: 1.0,
            decimals: 1,
        }],
    });
    for id in [TEMPERATURE, HUMIDITY] {
        registry
            .upsert_parameter(Parameter {
                id,
                station_id: STATION,
                parameter_type_id: 10,
                activity: ActivityLog::active_since(t(0)),
            })
            .unwrap();
    }

    let rules = Arc::new(RuleStore::new(Arc::clone(&registry)));
    let store = Arc::new(MemoryStore::new());
    let (sink, notifications) = ChannelSink::new();
    let engine = Arc::new(AlertEngine::new(
        Arc::clone(&registry),
        rules,
        store.clone(),
        Arc::new(RegistryCalibrator::new(registry)),
        Arc::new(sink),
        limits,
    ));
    Fixture {
        engine,
        store,
        notifications,
    }
}

pub fn rule(parameter_id: i64, comparator: Comparator, value: f64) -> NewRule {
    // ---
    NewRule {
        parameter_id: Some(parameter_id),
        name: format!("{comparator} {value}"),
        comparator,
        value,
        status: RuleStatus::Active,
    }
}

pub fn reading(parameter_id: i64, raw_value: f64, minute: i64) -> RawReading {
    // ---
    RawReading {
        parameter_id,
        raw_value,
        observed_at: t(minute),
        reading_key: Some(format!("{parameter_id}@{minute}")),
    }
}
