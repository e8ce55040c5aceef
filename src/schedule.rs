use chrono::{DateTime, Duration, Utc};

use crate::error::ConfigError;

/// Minutes after event creation at which each delivery attempt becomes due.
pub const WEBHOOK_RETRY_MINUTES: [u64; 7] = [0, 1, 5, 30, 120, 720, 1440];

/// Ordered attempt offsets, measured from event creation.
///
/// Attempt `n` (zero based) is due at `created_at + offsets[n]`. Once
/// `attempts == offsets.len()` the event is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    offsets: Vec<Duration>,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            offsets: WEBHOOK_RETRY_MINUTES
                .iter()
                .map(|m| Duration::minutes(*m as i64))
                .collect(),
        }
    }
}

impl RetrySchedule {
    pub fn new(offsets: Vec<Duration>) -> Result<Self, ConfigError> {
        if offsets.is_empty() || offsets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::InvalidRetrySchedule);
        }
        Ok(Self { offsets })
    }

    pub fn offsets(&self) -> &[Duration] {
        &self.offsets
    }

    pub fn max_attempts(&self) -> u32 {
        self.offsets.len() as u32
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts()
    }

    /// When the next attempt may run, or `None` when no attempts remain.
    pub fn next_eligible_at(&self, created_at: DateTime<Utc>, attempts: u32) -> Option<DateTime<Utc>> {
        self.offsets
            .get(attempts as usize)
            .map(|offset| created_at + *offset)
    }

    pub fn is_due(&self, created_at: DateTime<Utc>, attempts: u32, now: DateTime<Utc>) -> bool {
        self.next_eligible_at(created_at, attempts)
            .is_some_and(|at| at <= now)
    }

    /// Offsets in whole minutes, the shape SQL backends consume.
    pub fn offset_minutes(&self) -> Vec<i64> {
        self.offsets.iter().map(|d| d.num_minutes()).collect()
    }
}
