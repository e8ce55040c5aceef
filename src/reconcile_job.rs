//! Batch job that reconciles unsettled contributions against provider truth.
//!
//! A run scans the primary window, then (when the guard allows) the
//! long-tail window, and finally sends every mismatch it found in a single
//! alert. Failures for one contribution never abort its siblings.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Instrument;

use crate::alerts::{MismatchAlerter, ReconciliationMismatch};
use crate::error::{JobError, ProviderError};
use crate::jobs::CancelFlag;
use crate::provider::{ProviderRegistry, ProviderReport};
use crate::reconciliation::{
    compute_window, decide, Decision, ProviderStatus, ReconciliationWindow, SettledStatus,
    WindowSettings,
};
use crate::storage::{ContributionStore, CreatedRange, StatusUpdate};
use crate::types::Contribution;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Primary,
    LongTail,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Primary => "primary",
            Phase::LongTail => "long_tail",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassResult {
    pub scanned: usize,
    pub updated: usize,
    pub failed: usize,
    pub unresolved: usize,
    pub mismatches: Vec<ReconciliationMismatch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub window: ReconciliationWindow,
    pub primary: PassResult,
    pub long_tail: PassResult,
    pub long_tail_ran: bool,

    /// The straggler range could not be loaded; primary results still count.
    pub long_tail_failed: bool,
    pub alert_sent: bool,
    pub cancelled: bool,
}

impl ReconciliationReport {
    pub fn scanned(&self) -> usize {
        self.primary.scanned + self.long_tail.scanned
    }

    pub fn updated(&self) -> usize {
        self.primary.updated + self.long_tail.updated
    }

    pub fn failed(&self) -> usize {
        self.primary.failed + self.long_tail.failed
    }

    pub fn unresolved(&self) -> usize {
        self.primary.unresolved + self.long_tail.unresolved
    }

    pub fn mismatches(&self) -> Vec<ReconciliationMismatch> {
        let mut all = self.primary.mismatches.clone();
        all.extend(self.long_tail.mismatches.iter().cloned());
        all
    }
}

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub window: WindowSettings,

    /// Upper bound on a single provider status query.
    pub provider_timeout: Duration,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            window: WindowSettings::default(),
            provider_timeout: Duration::from_secs(10),
        }
    }
}

pub struct ReconciliationJob {
    contributions: Arc<dyn ContributionStore>,
    providers: ProviderRegistry,
    alerter: MismatchAlerter,
    config: ReconciliationConfig,
}

impl ReconciliationJob {
    pub fn new(
        contributions: Arc<dyn ContributionStore>,
        providers: ProviderRegistry,
        alerter: MismatchAlerter,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            contributions,
            providers,
            alerter,
            config,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>, cancel: &CancelFlag) -> Result<ReconciliationReport, JobError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("reconciliation", run_id = %run_id);
        self.run_inner(now, cancel, &run_id).instrument(span).await
    }

    async fn run_inner(
        &self,
        now: DateTime<Utc>,
        cancel: &CancelFlag,
        run_id: &str,
    ) -> Result<ReconciliationReport, JobError> {
        let window = compute_window(now, &self.config.window)?;

        let pending = self
            .contributions
            .list_unsettled(CreatedRange::closed(window.lookback_start, window.cutoff))
            .await?;
        let primary = self.reconcile_pass(&pending, Phase::Primary, cancel).await;

        let mut long_tail = PassResult::default();
        let mut long_tail_ran = false;
        let mut long_tail_failed = false;
        if cancel.is_cancelled() {
            tracing::warn!(phase = %Phase::Primary, "reconciliation.cancelled");
        } else if window.long_tail_enabled() {
            match self
                .contributions
                .list_unsettled(CreatedRange::half_open(window.long_tail_start, window.lookback_start))
                .await
            {
                Ok(stragglers) if !stragglers.is_empty() => {
                    tracing::info!(scanned = stragglers.len(), "reconciliation.long_tail_scan");
                    long_tail = self.reconcile_pass(&stragglers, Phase::LongTail, cancel).await;
                    long_tail_ran = true;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(error = %err, "reconciliation.long_tail_failed");
                    long_tail_failed = true;
                }
            }
        } else {
            tracing::warn!(
                reason = "window_too_small",
                long_tail_start = %window.long_tail_start,
                lookback_start = %window.lookback_start,
                "reconciliation.long_tail_skipped"
            );
        }

        let mut report = ReconciliationReport {
            window,
            primary,
            long_tail,
            long_tail_ran,
            long_tail_failed,
            alert_sent: false,
            cancelled: cancel.is_cancelled(),
        };

        report.alert_sent = self.alerter.dispatch(&report.mismatches(), run_id).await;

        tracing::info!(
            scanned = report.scanned(),
            updated = report.updated(),
            failed = report.failed(),
            unresolved = report.unresolved(),
            mismatches = report.mismatches().len(),
            cancelled = report.cancelled,
            "reconciliation.completed"
        );
        Ok(report)
    }

    async fn reconcile_pass(
        &self,
        pending: &[Contribution],
        phase: Phase,
        cancel: &CancelFlag,
    ) -> PassResult {
        let mut result = PassResult::default();

        for contribution in pending {
            if cancel.is_cancelled() {
                break;
            }
            result.scanned += 1;

            let report = self.query_provider(contribution, phase).await;
            let decision = decide(report.status, contribution.expected_total(), report.received_total_cents);
            self.apply(contribution, decision, phase, &mut result).await;
        }
        result
    }

    /// Provider answer for one contribution. Missing sources, timeouts and
    /// transport errors all collapse to `unknown` so the record is skipped.
    async fn query_provider(&self, contribution: &Contribution, phase: Phase) -> ProviderReport {
        let unknown = ProviderReport {
            status: ProviderStatus::Unknown,
            received_total_cents: None,
        };

        let Some(source) = self.providers.get(contribution.payment_provider) else {
            tracing::warn!(
                contribution_id = %contribution.id,
                provider = %contribution.payment_provider,
                payment_ref = %contribution.payment_ref,
                phase = %phase,
                "reconciliation.provider_unsupported"
            );
            return unknown;
        };

        let outcome = tokio::time::timeout(
            self.config.provider_timeout,
            source.query_status(&contribution.payment_ref),
        )
        .await
        .unwrap_or(Err(ProviderError::Timeout));

        match outcome {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(
                    contribution_id = %contribution.id,
                    provider = %contribution.payment_provider,
                    phase = %phase,
                    error = %err,
                    "reconciliation.provider_query_failed"
                );
                crate::telemetry::metric_inc_labeled(
                    "reconciliation.provider_error",
                    "provider",
                    contribution.payment_provider.as_str(),
                );
                unknown
            }
        }
    }

    async fn apply(
        &self,
        contribution: &Contribution,
        decision: Decision,
        phase: Phase,
        result: &mut PassResult,
    ) {
        match decision {
            Decision::Update(status) => {
                match self.contributions.update_status(&contribution.id, status.into()).await {
                    Ok(StatusUpdate::Applied) => {}
                    Ok(StatusUpdate::AlreadyTerminal(current)) => {
                        tracing::info!(
                            contribution_id = %contribution.id,
                            current = current.as_str(),
                            phase = %phase,
                            "reconciliation.already_settled"
                        );
                        result.unresolved += 1;
                        return;
                    }
                    Err(err) => {
                        tracing::error!(
                            contribution_id = %contribution.id,
                            phase = %phase,
                            error = %err,
                            "reconciliation.update_failed"
                        );
                        result.unresolved += 1;
                        return;
                    }
                }

                match status {
                    SettledStatus::Completed => {
                        if let Err(err) = self
                            .contributions
                            .mark_dream_board_funded_if_needed(&contribution.dream_board_id)
                            .await
                        {
                            tracing::warn!(
                                dream_board_id = %contribution.dream_board_id,
                                error = %err,
                                "reconciliation.funded_check_failed"
                            );
                        }
                        result.updated += 1;
                    }
                    SettledStatus::Failed => result.failed += 1,
                }
                tracing::info!(
                    contribution_id = %contribution.id,
                    status = crate::types::PaymentStatus::from(status).as_str(),
                    phase = %phase,
                    "reconciliation.updated"
                );
            }
            Decision::Mismatch {
                expected_total,
                received_total,
                status,
            } => {
                tracing::warn!(
                    contribution_id = %contribution.id,
                    provider = %contribution.payment_provider,
                    payment_ref = %contribution.payment_ref,
                    expected_total,
                    received_total = ?received_total,
                    status = status.as_str(),
                    phase = %phase,
                    "reconciliation.mismatch"
                );
                crate::telemetry::metric_inc("reconciliation.mismatch");
                result.mismatches.push(ReconciliationMismatch {
                    contribution_id: contribution.id.clone(),
                    provider: contribution.payment_provider,
                    payment_ref: contribution.payment_ref.clone(),
                    expected_total,
                    received_total,
                    status,
                });
                result.unresolved += 1;
            }
            Decision::Skip(reason) => {
                tracing::debug!(
                    contribution_id = %contribution.id,
                    reason = ?reason,
                    phase = %phase,
                    "reconciliation.skipped"
                );
                result.unresolved += 1;
            }
        }
    }
}
