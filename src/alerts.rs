use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::AlertError;
use crate::reconciliation::ProviderStatus;
use crate::types::{ContributionId, PaymentProvider};

/// A completed payment whose settled total disagrees with ours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationMismatch {
    pub contribution_id: ContributionId,
    pub provider: PaymentProvider,
    pub payment_ref: String,
    pub expected_total: i64,
    pub received_total: Option<i64>,
    pub status: ProviderStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MismatchAlert {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub mismatches: Vec<ReconciliationMismatch>,
}

/// Outbound alert transport (email, chat).
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &MismatchAlert) -> Result<(), AlertError>;
}

/// Sink that only logs. Used when no transport is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: &MismatchAlert) -> Result<(), AlertError> {
        tracing::warn!(
            recipient = %alert.recipient,
            count = alert.mismatches.len(),
            "reconciliation.alert"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertSettings {
    pub enabled: bool,
    pub recipient: Option<String>,
}

pub struct MismatchAlerter {
    sink: Arc<dyn AlertSink>,
    settings: AlertSettings,
}

impl MismatchAlerter {
    pub fn new(sink: Arc<dyn AlertSink>, settings: AlertSettings) -> Self {
        Self { sink, settings }
    }

    /// Send one alert for the whole run. Empty lists, disabled alerting and
    /// a missing recipient are no-ops; transport failures are logged and
    /// swallowed. Returns whether an alert went out.
    pub async fn dispatch(&self, mismatches: &[ReconciliationMismatch], run_id: &str) -> bool {
        if mismatches.is_empty() || !self.settings.enabled {
            return false;
        }
        let Some(recipient) = self.settings.recipient.as_ref() else {
            return false;
        };

        let alert = MismatchAlert {
            recipient: recipient.clone(),
            subject: "ChipIn reconciliation mismatches".to_string(),
            body: render_body(mismatches),
            mismatches: mismatches.to_vec(),
        };

        match self.sink.send(&alert).await {
            Ok(()) => {
                crate::telemetry::metric_inc("reconciliation.alert.sent");
                true
            }
            Err(err) => {
                tracing::error!(run_id, error = %err, "reconciliation.alert_failed");
                false
            }
        }
    }
}

fn render_body(mismatches: &[ReconciliationMismatch]) -> String {
    let items: String = mismatches
        .iter()
        .map(|m| {
            let received = m
                .received_total
                .map(|r| r.to_string())
                .unwrap_or_else(|| "n/a".to_string());
            format!(
                "<li><strong>{}</strong> {}: expected {}, received {} ({}).</li>",
                m.provider,
                html_escape(&m.payment_ref),
                m.expected_total,
                received,
                m.status.as_str()
            )
        })
        .collect();
    format!("<p>Reconciliation mismatches detected:</p><ul>{items}</ul>")
}

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}
