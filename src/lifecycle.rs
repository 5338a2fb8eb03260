//! Alert deduplication and read-state lifecycle.
//!
//! One alert exists per `(measurement, rule)` pair. Admission is idempotent:
//! re-admitting the same event returns the existing alert. Alerts move
//! `unread -> read` exactly once and are never deleted here.
//!
//! Delivery to the sink is tracked in storage, so an admission interrupted
//! after the insert committed is delivered by whichever retry comes next.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::error::{IngestError, StorageError};
use crate::models::{Alert, AlertEvent, DbId};
use crate::notify::NotificationSink;
use crate::pipeline::bounded;
use crate::rules::RuleStore;
use crate::storage::{AlertInsert, Storage};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Admission {
    Created { alert_id: DbId },
    AlreadyExists { alert_id: DbId },
    Rejected { reason: RejectReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// The referenced rule version is not in the rule store.
    UnknownRuleVersion { rule_id: DbId, version: i32 },
    /// The rule version was not authoritative at `triggered_at`.
    OutsideRuleWindow { rule_id: DbId, version: i32 },
    /// The version exists but is not an active, assigned rule.
    RuleNotEffective { rule_id: DbId, version: i32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReadAck {
    Ack { alert: Alert },
    NotFound,
}

pub struct AlertLifecycle {
    // ---
    storage: Arc<dyn Storage>,
    rules: Arc<RuleStore>,
    sink: Arc<dyn NotificationSink>,
    storage_timeout: Duration,
}

impl AlertLifecycle {
    // ---
    pub fn new(
        storage: Arc<dyn Storage>,
        rules: Arc<RuleStore>,
        sink: Arc<dyn NotificationSink>,
        storage_timeout: Duration,
    ) -> Self {
        // ---
        Self {
            storage,
            rules,
            sink,
            storage_timeout,
        }
    }

    /// Decide whether `event` opens a new alert.
    ///
    /// The sink sees each alert once, whether it was created by this call or
    /// by an earlier one that did not get to deliver it.
    pub async fn admit(&self, event: AlertEvent) -> Result<Admission, IngestError> {
        // ---
        let Some(rule) = self.rules.rule_version(event.rule_id, event.rule_version)? else {
            return Ok(self.reject(RejectReason::UnknownRuleVersion {
                rule_id: event.rule_id,
                version: event.rule_version,
            }));
        };
        if !rule.covers(event.triggered_at) {
            return Ok(self.reject(RejectReason::OutsideRuleWindow {
                rule_id: rule.id,
                version: rule.version,
            }));
        }
        if !rule.is_effective() {
            return Ok(self.reject(RejectReason::RuleNotEffective {
                rule_id: rule.id,
                version: rule.version,
            }));
        }

        let inserted = bounded(
            "alert write",
            self.storage_timeout,
            self.storage.insert_alert(&event),
        )
        .await?;
        let (admission, alert) = match inserted {
            AlertInsert::Created(alert) => {
                tracing::debug!(
                    alert_id = alert.id,
                    measurement_id = alert.measurement_id,
                    rule_id = alert.rule_id,
                    "Alert created"
                );
                (Admission::Created { alert_id: alert.id }, alert)
            }
            AlertInsert::Existing(alert) => {
                tracing::debug!(
                    alert_id = alert.id,
                    measurement_id = alert.measurement_id,
                    rule_id = alert.rule_id,
                    "Alert already exists"
                );
                (Admission::AlreadyExists { alert_id: alert.id }, alert)
            }
        };

        self.deliver(&alert).await?;
        Ok(admission)
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), StorageError> {
        // ---
        // Not bounded: a claim dropped after it committed would never be delivered
        if self.storage.claim_notification(alert.id).await? {
            self.sink.notify(alert);
        }
        Ok(())
    }

    fn reject(&self, reason: RejectReason) -> Admission {
        // ---
        tracing::warn!(?reason, "Alert event rejected");
        Admission::Rejected { reason }
    }

    /// Idempotent `unread -> read` transition.
    pub async fn mark_read(&self, alert_id: DbId) -> Result<ReadAck, StorageError> {
        // ---
        match self.storage.mark_alert_read(alert_id, Utc::now()).await? {
            Some(alert) => {
                tracing::debug!(alert_id, "Alert marked read");
                Ok(ReadAck::Ack { alert })
            }
            None => Ok(ReadAck::NotFound),
        }
    }
}
