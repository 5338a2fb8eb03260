//! Pure threshold evaluation.

use crate::models::{AlertEvent, Measurement, ThresholdRule};

/// Apply every rule to the measurement and return one event per violation.
///
/// No epsilon is used: calibrated values are already rounded to the declared
/// precision. The result is ordered by rule id regardless of input order.
pub fn evaluate(measurement: &Measurement, rules: &[ThresholdRule]) -> Vec<AlertEvent> {
    // ---
    let mut events: Vec<AlertEvent> = rules
        .iter()
        .filter(|rule| rule.is_violated_by(measurement.value))
        .map(|rule| AlertEvent {
            measurement_id: measurement.id,
            rule_id: rule.id,
            rule_version: rule.version,
            triggered_at: measurement.observed_at,
        })
        .collect();
    events.sort_by_key(|e| e.rule_id);
    events
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{Comparator, RuleStatus};
    use chrono::{TimeZone, Utc};

    fn measurement(value: f64) -> Measurement {
        // ---
        let at = Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap();
        Measurement {
            id: 7,
            parameter_id: 100,
            value,
            raw_value: value,
            observed_at: at,
            ingested_at: at,
            reading_key: None,
        }
    }

    fn rule(id: i64, comparator: Comparator, value: f64) -> ThresholdRule {
        // ---
        ThresholdRule {
            id,
            version: 3,
            parameter_id: Some(100),
            name: format!("rule-{id}"),
            comparator,
            value,
            status: RuleStatus::Active,
            is_active: true,
            valid_from: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            valid_to: None,
        }
    }

    #[test]
    fn test_no_violation_no_events() {
        // ---
        let rules = [rule(1, Comparator::Gt, 40.0)];
        assert!(evaluate(&measurement(35.0), &rules).is_empty());
    }

    #[test]
    fn test_violation_carries_rule_version_and_timestamp() {
        // ---
        let m = measurement(42.0);
        let events = evaluate(&m, &[rule(1, Comparator::Gt, 40.0)]);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].measurement_id, 7);
        assert_eq!(events[0].rule_id, 1);
        assert_eq!(events[0].rule_version, 3);
        assert_eq!(events[0].triggered_at, m.observed_at);
    }

    #[test]
    fn test_low_and_high_band() {
        // ---
        let rules = [
            rule(2, Comparator::Lt, -10.0),
            rule(1, Comparator::Gt, 60.0),
            rule(3, Comparator::Ne, 0.0),
        ];

        let hot = evaluate(&measurement(65.0), &rules);
        assert_eq!(
            hot.iter().map(|e| e.rule_id).collect::<Vec<_>>(),
            vec![1, 3]
        );

        let cold = evaluate(&measurement(-15.0), &rules);
        assert_eq!(
            cold.iter().map(|e| e.rule_id).collect::<Vec<_>>(),
            vec![2, 3]
        );

        // Edges are exclusive for strict comparators
        assert_eq!(evaluate(&measurement(60.0), &rules).len(), 1);
        assert_eq!(evaluate(&measurement(-10.0), &rules).len(), 1);
    }

    #[test]
    fn test_exact_equality() {
        // ---
        let rules = [rule(1, Comparator::Eq, 12.3)];
        assert_eq!(evaluate(&measurement(12.3), &rules).len(), 1);
        assert!(evaluate(&measurement(12.300001), &rules).is_empty());
    }

    #[test]
    fn test_order_independent() {
        // ---
        let a = [rule(1, Comparator::Ge, 10.0), rule(2, Comparator::Le, 50.0)];
        let b = [rule(2, Comparator::Le, 50.0), rule(1, Comparator::Ge, 10.0)];
        assert_eq!(
            evaluate(&measurement(20.0), &a),
            evaluate(&measurement(20.0), &b)
        );
    }
}
