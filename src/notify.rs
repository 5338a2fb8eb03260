//! Hand-off of newly created alerts to the external notification service.
//!
//! The lifecycle manager calls [`NotificationSink::notify`] once per alert it
//! created and never for duplicates. Sinks must not block: delivery happens
//! downstream.

use tokio::sync::mpsc;

use crate::models::Alert;

pub trait NotificationSink: Send + Sync {
    fn notify(&self, alert: &Alert);
}

/// Sink that only records created alerts in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, alert: &Alert) {
        // ---
        tracing::info!(
            alert_id = alert.id,
            measurement_id = alert.measurement_id,
            rule_id = alert.rule_id,
            rule_version = alert.rule_version,
            triggered_at = %alert.triggered_at,
            "Alert raised"
        );
    }
}

/// Forwards created alerts over an unbounded channel to a delivery task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    // ---
    sender: mpsc::UnboundedSender<Alert>,
}

impl ChannelSink {
    // ---
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Alert>) {
        // ---
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, alert: &Alert) {
        // ---
        if self.sender.send(alert.clone()).is_err() {
            tracing::warn!(alert_id = alert.id, "Notification receiver dropped; alert not forwarded");
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_channel_sink_forwards_alert() {
        // ---
        let (sink, mut rx) = ChannelSink::new();
        let alert = Alert {
            id: 1,
            measurement_id: 2,
            rule_id: 3,
            rule_version: 1,
            triggered_at: Utc::now(),
            created_at: Utc::now(),
            is_read: false,
            read_at: None,
        };

        sink.notify(&alert);
        assert_eq!(rx.recv().await, Some(alert));
    }
}
