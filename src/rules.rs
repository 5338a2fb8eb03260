//! Versioned threshold-rule store.
//!
//! Each rule is a chain of versions sorted by `valid_from`, with contiguous
//! `[valid_from, valid_to)` windows. An edit closes the open version and
//! appends the next one, so a measurement is always evaluated against the
//! version that was authoritative at its own timestamp.
//!
//! Readers load an `Arc` snapshot without locking; writers serialize on a
//! mutex, build a modified copy and swap it in.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{RuleError, RuleLookupError};
use crate::models::{Comparator, DbId, RuleStatus, ThresholdRule};
use crate::registry::Registry;

// ---

#[derive(Debug, Clone, Default)]
struct RuleIndex {
    // ---
    /// Rule id -> versions ordered by `valid_from`.
    chains: HashMap<DbId, Vec<ThresholdRule>>,
    /// Parameter id -> ids of rules that were ever assigned to it.
    by_parameter: HashMap<DbId, Vec<DbId>>,
    next_id: DbId,
}

impl RuleIndex {
    // ---
    fn version_at(&self, rule_id: DbId, at: DateTime<Utc>) -> Option<&ThresholdRule> {
        // ---
        let chain = self.chains.get(&rule_id)?;
        let idx = chain.partition_point(|v| v.valid_from <= at);
        let candidate = &chain[idx.checked_sub(1)?];
        candidate.covers(at).then_some(candidate)
    }

    fn index_parameter(&mut self, parameter_id: DbId, rule_id: DbId) {
        // ---
        let ids = self.by_parameter.entry(parameter_id).or_default();
        if !ids.contains(&rule_id) {
            ids.push(rule_id);
        }
    }
}

/// Definition of a new rule.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewRule {
    // ---
    pub parameter_id: Option<DbId>,
    pub name: String,
    #[serde(rename = "math_signal")]
    pub comparator: Comparator,
    pub value: f64,
    #[serde(default = "default_status")]
    pub status: RuleStatus,
}

fn default_status() -> RuleStatus {
    RuleStatus::Active
}

/// Fields to change in the next version. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RuleEdit {
    // ---
    pub name: Option<String>,
    #[serde(rename = "math_signal")]
    pub comparator: Option<Comparator>,
    pub value: Option<f64>,
    pub status: Option<RuleStatus>,
    pub is_active: Option<bool>,
}

/// Result of an edit: the version that was closed and the one opened.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleChange {
    // ---
    pub closed: Option<ThresholdRule>,
    pub opened: ThresholdRule,
}

pub struct RuleStore {
    // ---
    /// `None` until the persisted versions are loaded.
    index: ArcSwapOption<RuleIndex>,
    writer: Mutex<()>,
    registry: Arc<Registry>,
}

impl RuleStore {
    // ---
    /// An empty store, ready for rules to be created.
    pub fn new(registry: Arc<Registry>) -> Self {
        // ---
        let store = Self::unloaded(registry);
        store.index.store(Some(Arc::new(RuleIndex {
            next_id: 1,
            ..RuleIndex::default()
        })));
        store
    }

    /// A store whose lookups fail with `RuleLookupError` until [`load`]
    /// succeeds, so nothing is evaluated against a missing rule set.
    ///
    /// [`load`]: RuleStore::load
    pub fn unloaded(registry: Arc<Registry>) -> Self {
        // ---
        Self {
            index: ArcSwapOption::const_empty(),
            writer: Mutex::new(()),
            registry,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.index.load().is_some()
    }

    fn snapshot(&self) -> Result<Arc<RuleIndex>, RuleLookupError> {
        // ---
        self.index
            .load_full()
            .ok_or_else(|| RuleLookupError("rule store not loaded".into()))
    }

    fn update<T>(
        &self,
        f: impl FnOnce(&mut RuleIndex) -> Result<T, RuleError>,
    ) -> Result<T, RuleError> {
        // ---
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = RuleIndex::clone(&*self.snapshot()?);
        let out = f(&mut next)?;
        self.index.store(Some(Arc::new(next)));
        Ok(out)
    }

    /// Replace the store content with persisted versions.
    pub fn load(&self, versions: Vec<ThresholdRule>) -> Result<(), RuleError> {
        // ---
        let mut index = RuleIndex::default();
        for rule in versions {
            if let Some(parameter_id) = rule.parameter_id {
                index.index_parameter(parameter_id, rule.id);
            }
            index.chains.entry(rule.id).or_default().push(rule);
        }
        for chain in index.chains.values_mut() {
            chain.sort_by_key(|v| v.version);
        }
        index.next_id = index.chains.keys().max().map_or(1, |max| max + 1);

        let rule_count = index.chains.len();
        {
            let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            self.index.store(Some(Arc::new(index)));
        }
        tracing::info!(rule_count, "Rule store loaded");
        Ok(())
    }

    /// Every effective rule version for `parameter_id` whose window covers
    /// `at`, provided the parameter and its station were active at `at`.
    pub fn rules_for(
        &self,
        parameter_id: DbId,
        at: DateTime<Utc>,
    ) -> Result<Vec<ThresholdRule>, RuleLookupError> {
        // ---
        let index = self.snapshot()?;
        if !self.registry.is_parameter_effective(parameter_id, at) {
            return Ok(Vec::new());
        }

        let mut rules: Vec<ThresholdRule> = index
            .by_parameter
            .get(&parameter_id)
            .into_iter()
            .flatten()
            .filter_map(|rule_id| index.version_at(*rule_id, at))
            .filter(|v| v.is_effective() && v.parameter_id == Some(parameter_id))
            .cloned()
            .collect();
        rules.sort_by_key(|r| r.id);
        Ok(rules)
    }

    /// Rules in force right now.
    pub fn list_active_rules(
        &self,
        parameter_id: DbId,
    ) -> Result<Vec<ThresholdRule>, RuleLookupError> {
        self.rules_for(parameter_id, Utc::now())
    }

    pub fn rule_version(
        &self,
        rule_id: DbId,
        version: i32,
    ) -> Result<Option<ThresholdRule>, RuleLookupError> {
        // ---
        let index = self.snapshot()?;
        Ok(index
            .chains
            .get(&rule_id)
            .and_then(|chain| chain.iter().find(|v| v.version == version))
            .cloned())
    }

    /// Full version history of one rule, oldest first.
    pub fn history(&self, rule_id: DbId) -> Result<Vec<ThresholdRule>, RuleLookupError> {
        // ---
        let index = self.snapshot()?;
        Ok(index.chains.get(&rule_id).cloned().unwrap_or_default())
    }

    /// Rules whose current version has no parameter.
    pub fn unassigned_rules(&self) -> Result<Vec<ThresholdRule>, RuleLookupError> {
        // ---
        let index = self.snapshot()?;
        let mut rules: Vec<ThresholdRule> = index
            .chains
            .values()
            .filter_map(|chain| chain.last())
            .filter(|current| current.parameter_id.is_none())
            .cloned()
            .collect();
        rules.sort_by_key(|r| r.id);
        Ok(rules)
    }

    pub fn create_rule(
        &self,
        new: NewRule,
        effective_at: DateTime<Utc>,
    ) -> Result<ThresholdRule, RuleError> {
        // ---
        if !new.value.is_finite() {
            return Err(RuleError::NonFiniteThreshold);
        }
        if let Some(parameter_id) = new.parameter_id {
            if !self.registry.contains_parameter(parameter_id) {
                return Err(RuleError::UnknownParameter(parameter_id));
            }
        }

        let rule = self.update(|index| {
            let rule = ThresholdRule {
                id: index.next_id,
                version: 1,
                parameter_id: new.parameter_id,
                name: new.name,
                comparator: new.comparator,
                value: new.value,
                status: new.status,
                is_active: true,
                valid_from: effective_at,
                valid_to: None,
            };
            index.next_id += 1;
            if let Some(parameter_id) = rule.parameter_id {
                index.index_parameter(parameter_id, rule.id);
            }
            index.chains.insert(rule.id, vec![rule.clone()]);
            Ok(rule)
        })?;

        tracing::info!(
            rule_id = rule.id,
            parameter_id = ?rule.parameter_id,
            condition = %format!("{} {}", rule.comparator, rule.value),
            "Rule created"
        );
        Ok(rule)
    }

    /// Close the current version at `effective_at` and open the next one.
    pub fn edit_rule(
        &self,
        rule_id: DbId,
        edit: RuleEdit,
        effective_at: DateTime<Utc>,
    ) -> Result<RuleChange, RuleError> {
        // ---
        if edit.value.is_some_and(|v| !v.is_finite()) {
            return Err(RuleError::NonFiniteThreshold);
        }
        self.open_next_version(rule_id, effective_at, |next| {
            if let Some(name) = edit.name {
                next.name = name;
            }
            if let Some(comparator) = edit.comparator {
                next.comparator = comparator;
            }
            if let Some(value) = edit.value {
                next.value = value;
            }
            if let Some(status) = edit.status {
                next.status = status;
            }
            if let Some(is_active) = edit.is_active {
                next.is_active = is_active;
            }
            Ok(())
        })
    }

    pub fn deactivate_rule(
        &self,
        rule_id: DbId,
        effective_at: DateTime<Utc>,
    ) -> Result<RuleChange, RuleError> {
        // ---
        let edit = RuleEdit {
            is_active: Some(false),
            ..RuleEdit::default()
        };
        self.edit_rule(rule_id, edit, effective_at)
    }

    /// Attach an unassigned rule to a parameter from `effective_at` on.
    ///
    /// Assigning to the parameter it already belongs to is a no-op.
    pub fn assign_rule(
        &self,
        rule_id: DbId,
        parameter_id: DbId,
        effective_at: DateTime<Utc>,
    ) -> Result<RuleChange, RuleError> {
        // ---
        if !self.registry.contains_parameter(parameter_id) {
            return Err(RuleError::UnknownParameter(parameter_id));
        }

        let index = self.snapshot()?;
        let current = index
            .chains
            .get(&rule_id)
            .and_then(|chain| chain.last())
            .ok_or(RuleError::UnknownRule(rule_id))?;
        match current.parameter_id {
            Some(existing) if existing == parameter_id => {
                return Ok(RuleChange {
                    closed: None,
                    opened: current.clone(),
                })
            }
            Some(existing) => {
                return Err(RuleError::AlreadyAssigned {
                    rule_id,
                    parameter_id: existing,
                })
            }
            None => {}
        }

        self.open_next_version(rule_id, effective_at, |next| {
            if let Some(existing) = next.parameter_id {
                return Err(RuleError::AlreadyAssigned {
                    rule_id,
                    parameter_id: existing,
                });
            }
            next.parameter_id = Some(parameter_id);
            Ok(())
        })
    }

    fn open_next_version(
        &self,
        rule_id: DbId,
        effective_at: DateTime<Utc>,
        apply: impl FnOnce(&mut ThresholdRule) -> Result<(), RuleError>,
    ) -> Result<RuleChange, RuleError> {
        // ---
        let change = self.update(|index| {
            let chain = index
                .chains
                .get_mut(&rule_id)
                .ok_or(RuleError::UnknownRule(rule_id))?;
            let current = chain.last_mut().ok_or(RuleError::UnknownRule(rule_id))?;
            if effective_at < current.valid_from {
                return Err(RuleError::EditBeforeCurrentVersion {
                    rule_id,
                    requested: effective_at,
                });
            }

            let mut next = current.clone();
            apply(&mut next)?;
            next.version = current.version + 1;
            next.valid_from = effective_at;
            next.valid_to = None;

            current.valid_to = Some(effective_at);
            let closed = current.clone();
            chain.push(next.clone());

            if let Some(parameter_id) = next.parameter_id {
                index.index_parameter(parameter_id, rule_id);
            }
            Ok(RuleChange {
                closed: Some(closed),
                opened: next,
            })
        })?;

        tracing::info!(
            rule_id,
            version = change.opened.version,
            %effective_at,
            "Rule version opened"
        );
        Ok(change)
    }

    #[cfg(test)]
    pub(crate) fn unload_for_test(&self) {
        self.index.store(None);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{ActivityLog, Calibration, Parameter, ParameterType, Station};
    use chrono::{Duration, TimeZone};

    fn t(hours: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap() + Duration::hours(hours)
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
        for id in [100, 200] {
            registry
                .upsert_parameter(Parameter {
                    id,
                    station_id: 1,
                    parameter_type_id: 10,
                    activity: ActivityLog::active_since(t(0)),
                })
                .unwrap();
        }
        Arc::new(registry)
    }

    fn hot(parameter_id: Option<DbId>, value: f64) -> NewRule {
        // ---
        NewRule {
            parameter_id,
            name: "hot".into(),
            comparator: Comparator::Gt,
            value,
            status: RuleStatus::Active,
        }
    }

    #[test]
    fn test_point_in_time_lookup_after_edit() {
        // ---
        let store = RuleStore::new(registry());
        let rule = store.create_rule(hot(Some(100), 40.0), t(1)).unwrap();

        let edit = RuleEdit {
            value: Some(50.0),
            ..RuleEdit::default()
        };
        let change = store.edit_rule(rule.id, edit, t(3)).unwrap();
        assert_eq!(change.closed.as_ref().unwrap().valid_to, Some(t(3)));
        assert_eq!(change.opened.version, 2);

        let before = store.rules_for(100, t(2)).unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].value, 40.0);
        assert_eq!(before[0].version, 1);

        let after = store.rules_for(100, t(3)).unwrap();
        assert_eq!(after[0].value, 50.0);

        assert!(store.rules_for(100, t(0)).unwrap().is_empty());
        assert_eq!(store.history(rule.id).unwrap().len(), 2);
    }

    #[test]
    fn test_multiple_rules_per_parameter() {
        // ---
        let store = RuleStore::new(registry());
        store.create_rule(hot(Some(100), 40.0), t(0)).unwrap();
        store
            .create_rule(
                NewRule {
                    name: "cold".into(),
                    comparator: Comparator::Lt,
                    value: -5.0,
                    ..hot(Some(100), 0.0)
                },
                t(0),
            )
            .unwrap();
        store.create_rule(hot(Some(200), 30.0), t(0)).unwrap();

        let rules = store.rules_for(100, t(1)).unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|r| r.parameter_id == Some(100)));
    }

    #[test]
    fn test_draft_and_deactivated_rules_excluded() {
        // ---
        let store = RuleStore::new(registry());
        store
            .create_rule(
                NewRule {
                    status: RuleStatus::Draft,
                    ..hot(Some(100), 40.0)
                },
                t(0),
            )
            .unwrap();
        let live = store.create_rule(hot(Some(100), 45.0), t(0)).unwrap();
        store.deactivate_rule(live.id, t(2)).unwrap();

        assert_eq!(store.rules_for(100, t(1)).unwrap().len(), 1);
        assert!(store.rules_for(100, t(2)).unwrap().is_empty());
    }

    #[test]
    fn test_unassigned_rule_excluded_until_assigned() {
        // ---
        let store = RuleStore::new(registry());
        let pending = store.create_rule(hot(None, 40.0), t(0)).unwrap();
        assert_eq!(store.unassigned_rules().unwrap().len(), 1);
        assert!(store.rules_for(100, t(1)).unwrap().is_empty());

        store.assign_rule(pending.id, 100, t(2)).unwrap();
        assert!(store.unassigned_rules().unwrap().is_empty());
        assert!(store.rules_for(100, t(1)).unwrap().is_empty());
        assert_eq!(store.rules_for(100, t(2)).unwrap().len(), 1);

        assert!(store.assign_rule(pending.id, 100, t(3)).unwrap().closed.is_none());
        assert_eq!(
            store.assign_rule(pending.id, 200, t(3)),
            Err(RuleError::AlreadyAssigned {
                rule_id: pending.id,
                parameter_id: 100
            })
        );
    }

    #[test]
    fn test_edit_before_current_version_rejected() {
        // ---
        let store = RuleStore::new(registry());
        let rule = store.create_rule(hot(Some(100), 40.0), t(5)).unwrap();
        let err = store
            .edit_rule(rule.id, RuleEdit::default(), t(4))
            .unwrap_err();
        assert!(matches!(err, RuleError::EditBeforeCurrentVersion { .. }));
    }

    #[test]
    fn test_invalid_rules_rejected() {
        // ---
        let store = RuleStore::new(registry());
        assert_eq!(
            store.create_rule(hot(Some(100), f64::NAN), t(0)),
            Err(RuleError::NonFiniteThreshold)
        );
        assert_eq!(
            store.create_rule(hot(Some(999), 1.0), t(0)),
            Err(RuleError::UnknownParameter(999))
        );
        assert_eq!(
            store.edit_rule(42, RuleEdit::default(), t(0)),
            Err(RuleError::UnknownRule(42))
        );

        let json = r#"{"parameter_id": 100, "name": "x", "math_signal": "=<", "value": 1.0}"#;
        assert!(serde_json::from_str::<NewRule>(json).is_err());
    }

    #[test]
    fn test_inactive_parameter_has_no_rules() {
        // ---
        let registry = registry();
        let store = RuleStore::new(Arc::clone(&registry));
        store.create_rule(hot(Some(100), 40.0), t(0)).unwrap();
        registry.set_parameter_active(100, t(4), false).unwrap();

        assert_eq!(store.rules_for(100, t(3)).unwrap().len(), 1);
        assert!(store.rules_for(100, t(5)).unwrap().is_empty());
    }

    #[test]
    fn test_load_restores_chains_and_ids() {
        // ---
        let source = RuleStore::new(registry());
        let rule = source.create_rule(hot(Some(100), 40.0), t(0)).unwrap();
        source
            .edit_rule(
                rule.id,
                RuleEdit {
                    value: Some(41.0),
                    ..RuleEdit::default()
                },
                t(2),
            )
            .unwrap();
        let mut versions = source.history(rule.id).unwrap();
        versions.reverse();

        let restored = RuleStore::new(registry());
        restored.load(versions).unwrap();
        assert_eq!(restored.rules_for(100, t(1)).unwrap()[0].value, 40.0);
        assert_eq!(restored.rules_for(100, t(3)).unwrap()[0].value, 41.0);

        let next = restored.create_rule(hot(Some(200), 1.0), t(0)).unwrap();
        assert_eq!(next.id, rule.id + 1);
    }

    #[test]
    fn test_unloaded_store_surfaces_lookup_error() {
        // ---
        let store = RuleStore::unloaded(registry());
        assert!(!store.is_loaded());
        assert!(store.rules_for(100, t(1)).is_err());
        assert!(matches!(
            store.create_rule(hot(Some(100), 40.0), t(0)),
            Err(RuleError::Lookup(_))
        ));

        store.load(Vec::new()).unwrap();
        assert!(store.is_loaded());
        assert!(store.rules_for(100, t(1)).unwrap().is_empty());
    }

    #[test]
    fn test_readers_do_not_wait_for_writers() {
        // ---
        let store = Arc::new(RuleStore::new(registry()));
        let rule = store.create_rule(hot(Some(100), 40.0), t(0)).unwrap();

        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                store
                    .update(|index| {
                        entered_tx.send(()).unwrap();
                        std::thread::sleep(std::time::Duration::from_millis(400));
                        index.next_id += 1;
                        Ok(())
                    })
                    .unwrap();
            })
        };

        entered_rx.recv().unwrap();
        let started = std::time::Instant::now();
        assert!(store.rule_version(rule.id, 1).unwrap().is_some());
        assert_eq!(store.rules_for(100, t(1)).unwrap().len(), 1);
        assert!(started.elapsed() < std::time::Duration::from_millis(200));

        writer.join().unwrap();
        let next = store.create_rule(hot(Some(200), 1.0), t(0)).unwrap();
        assert_eq!(next.id, rule.id + 2);
    }
}
