//! Pure reconciliation rules: scan windows and the per-payment decision.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{LONG_TAIL_HOURS_KEY, LOOKBACK_HOURS_KEY, MIN_AGE_MINUTES_KEY};
use crate::error::ConfigError;

pub const DEFAULT_LOOKBACK_HOURS: u64 = 24;
pub const DEFAULT_MIN_AGE_MINUTES: u64 = 10;
pub const DEFAULT_LONG_TAIL_HOURS: u64 = 24 * 7;

/// Window sizes for one reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSettings {
    /// How far back the primary scan reaches.
    pub lookback_hours: u64,

    /// Settlement grace period. Younger payments are still in flight.
    pub min_age_minutes: u64,

    /// How far back the straggler scan reaches.
    pub long_tail_hours: u64,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            lookback_hours: DEFAULT_LOOKBACK_HOURS,
            min_age_minutes: DEFAULT_MIN_AGE_MINUTES,
            long_tail_hours: DEFAULT_LONG_TAIL_HOURS,
        }
    }
}

/// Bounds computed for a single job invocation. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconciliationWindow {
    pub lookback_start: DateTime<Utc>,
    pub cutoff: DateTime<Utc>,
    pub long_tail_start: DateTime<Utc>,
}

impl ReconciliationWindow {
    /// The straggler pass only runs when its range lies strictly before the
    /// primary range; otherwise it would process the same records twice.
    pub fn long_tail_enabled(&self) -> bool {
        self.long_tail_start < self.lookback_start
    }
}

/// Fails with [`ConfigError::Invalid`] when a setting reaches past the
/// representable calendar.
pub fn compute_window(now: DateTime<Utc>, settings: &WindowSettings) -> Result<ReconciliationWindow, ConfigError> {
    Ok(ReconciliationWindow {
        lookback_start: before(now, settings.lookback_hours, 3_600, LOOKBACK_HOURS_KEY)?,
        cutoff: before(now, settings.min_age_minutes, 60, MIN_AGE_MINUTES_KEY)?,
        long_tail_start: before(now, settings.long_tail_hours, 3_600, LONG_TAIL_HOURS_KEY)?,
    })
}

fn before(now: DateTime<Utc>, n: u64, unit_secs: i64, key: &'static str) -> Result<DateTime<Utc>, ConfigError> {
    i64::try_from(n)
        .ok()
        .and_then(|n| n.checked_mul(unit_secs))
        .and_then(Duration::try_seconds)
        .and_then(|span| now.checked_sub_signed(span))
        .ok_or_else(|| ConfigError::Invalid {
            key,
            value: n.to_string(),
        })
}

pub fn expected_total(amount_cents: i64, fee_cents: i64) -> i64 {
    amount_cents + fee_cents
}

/// Normalized payment state reported by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Completed,
    Failed,
    Processing,
    Unknown,
}

impl ProviderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Processing => "processing",
            Self::Unknown => "unknown",
        }
    }
}

/// Status reconciliation is allowed to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettledStatus {
    Completed,
    Failed,
}

impl From<SettledStatus> for crate::types::PaymentStatus {
    fn from(value: SettledStatus) -> Self {
        match value {
            SettledStatus::Completed => Self::Completed,
            SettledStatus::Failed => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Pending,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Update(SettledStatus),
    Mismatch {
        expected_total: i64,
        received_total: Option<i64>,
        status: ProviderStatus,
    },
    Skip(SkipReason),
}

/// Map provider truth onto an action.
///
/// A completed payment whose settled total differs from what we expect is
/// never applied: it is escalated as a mismatch.
pub fn decide(status: ProviderStatus, expected_total: i64, received_total: Option<i64>) -> Decision {
    match status {
        ProviderStatus::Completed if received_total == Some(expected_total) => {
            Decision::Update(SettledStatus::Completed)
        }
        ProviderStatus::Completed => Decision::Mismatch {
            expected_total,
            received_total,
            status,
        },
        ProviderStatus::Failed => Decision::Update(SettledStatus::Failed),
        ProviderStatus::Processing => Decision::Skip(SkipReason::Pending),
        ProviderStatus::Unknown => Decision::Skip(SkipReason::Unknown),
    }
}
