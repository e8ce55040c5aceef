//! Entry points for the internal batch jobs.
//!
//! Each invocation is authorised with a bearer credential, rate limited per
//! caller, and serialised through a [`JobLease`] so two overlapping triggers
//! never work the same batch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use subtle::ConstantTimeEq;

use crate::dispatcher::{QueueSummary, WebhookDispatcher};
use crate::error::{ConfigError, JobError};
use crate::lease::{JobLease, LeaseToken};
use crate::rate_limit::RateLimiter;
use crate::reconcile_job::{ReconciliationJob, ReconciliationReport};

pub const DEFAULT_TRIGGER_LIMIT: u64 = 10;
pub const DEFAULT_TRIGGER_WINDOW_SECS: i64 = 60;
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(5 * 60);

/// Cooperative stop signal, checked between records.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A stateless batch invocation.
#[async_trait]
pub trait BatchJob: Send + Sync {
    type Output: Send;

    /// Lease name and rate-limit scope.
    fn name(&self) -> &'static str;

    async fn run(&self, now: DateTime<Utc>, cancel: &CancelFlag) -> Result<Self::Output, JobError>;
}

#[async_trait]
impl BatchJob for WebhookDispatcher {
    type Output = QueueSummary;

    fn name(&self) -> &'static str {
        "webhook:process"
    }

    async fn run(&self, now: DateTime<Utc>, cancel: &CancelFlag) -> Result<QueueSummary, JobError> {
        Ok(self.process_queue(now, cancel).await?)
    }
}

#[async_trait]
impl BatchJob for ReconciliationJob {
    type Output = ReconciliationReport;

    fn name(&self) -> &'static str {
        "payments:reconcile"
    }

    async fn run(&self, now: DateTime<Utc>, cancel: &CancelFlag) -> Result<ReconciliationReport, JobError> {
        ReconciliationJob::run(self, now, cancel).await
    }
}

#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// Shared secret callers present as `Bearer <secret>`.
    pub job_secret: Option<String>,
    pub limit: u64,
    pub window_secs: i64,
    pub lease_ttl: Duration,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            job_secret: None,
            limit: DEFAULT_TRIGGER_LIMIT,
            window_secs: DEFAULT_TRIGGER_WINDOW_SECS,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }
}

pub struct JobTrigger<J> {
    job: J,
    limiter: RateLimiter,
    lease: Arc<dyn JobLease>,
    config: TriggerConfig,
}

impl<J: BatchJob> JobTrigger<J> {
    pub fn new(job: J, limiter: RateLimiter, lease: Arc<dyn JobLease>, config: TriggerConfig) -> Self {
        Self {
            job,
            limiter,
            lease,
            config,
        }
    }

    pub fn job(&self) -> &J {
        &self.job
    }

    /// Authorise, rate limit, lease and run the job once.
    ///
    /// `authorization` is the raw `Authorization` header value; `caller`
    /// identifies the rate-limit bucket (usually the client address).
    pub async fn trigger(
        &self,
        authorization: Option<&str>,
        caller: &str,
        now: DateTime<Utc>,
        cancel: &CancelFlag,
    ) -> Result<J::Output, JobError> {
        let name = self.job.name();
        self.authorize(authorization)?;

        let verdict = self
            .limiter
            .enforce_fixed(
                &format!("{name}:{caller}"),
                self.config.limit,
                self.config.window_secs,
                now,
            )
            .await?;
        if !verdict.allowed {
            tracing::warn!(job = name, caller, "jobs.rate_limited");
            return Err(JobError::RateLimited {
                retry_after_seconds: verdict.retry_after_seconds.unwrap_or(1),
            });
        }

        let Some(lease) = self.lease.try_acquire(name, self.config.lease_ttl).await? else {
            tracing::info!(job = name, "jobs.already_running");
            return Err(JobError::AlreadyRunning(name.to_string()));
        };

        let result = self.run_with_heartbeat(&lease, now, cancel).await;

        if let Err(err) = self.lease.release(&lease).await {
            tracing::warn!(job = name, error = %err, "jobs.lease_release_failed");
        }
        result
    }

    /// Run the job while renewing `lease` every third of its TTL. A lost
    /// lease raises `cancel` so the job stops at the next record.
    async fn run_with_heartbeat(
        &self,
        lease: &LeaseToken,
        now: DateTime<Utc>,
        cancel: &CancelFlag,
    ) -> Result<J::Output, JobError> {
        let ttl = self.config.lease_ttl;
        let every = (ttl / 3).max(Duration::from_millis(10));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + every, every);

        let run = self.job.run(now, cancel);
        tokio::pin!(run);

        loop {
            tokio::select! {
                result = &mut run => return result,
                _ = heartbeat.tick() => match self.lease.extend(lease, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::error!(job = %lease.name, "jobs.lease_lost");
                        cancel.cancel();
                    }
                    Err(err) => {
                        tracing::warn!(job = %lease.name, error = %err, "jobs.lease_extend_failed");
                    }
                },
            }
        }
    }

    fn authorize(&self, authorization: Option<&str>) -> Result<(), JobError> {
        let secret = self
            .config
            .job_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("INTERNAL_JOB_SECRET"))?;

        let presented = authorization
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(JobError::Unauthorized)?;

        if bool::from(presented.as_bytes().ct_eq(secret.as_bytes())) {
            Ok(())
        } else {
            Err(JobError::Unauthorized)
        }
    }
}
