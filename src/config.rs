//! Runtime settings read from the process environment.
//!
//! Numeric keys that are absent, unparsable or not positive fall back to
//! their defaults. Secrets are only checked where they are used, so a
//! process without `INTERNAL_JOB_SECRET` still starts and fails each job
//! invocation instead. The same holds for `CARD_DATA_ENCRYPTION_KEY`, which
//! is required to build the dispatcher's secret store.

use std::time::Duration;

use crate::alerts::AlertSettings;
use crate::dispatcher::{DispatcherConfig, DEFAULT_BATCH_SIZE, DEFAULT_DELIVERY_TIMEOUT_MS};
use crate::error::ConfigError;
use crate::jobs::TriggerConfig;
use crate::reconcile_job::ReconciliationConfig;
use crate::reconciliation::{compute_window, WindowSettings};
use crate::secrets::AesGcmSecrets;
use crate::signing::DEFAULT_TOLERANCE_MINUTES;

pub const LOOKBACK_HOURS_KEY: &str = "RECONCILIATION_LOOKBACK_HOURS";
pub const MIN_AGE_MINUTES_KEY: &str = "RECONCILIATION_MIN_AGE_MINUTES";
pub const LONG_TAIL_HOURS_KEY: &str = "RECONCILIATION_LONG_TAIL_HOURS";
pub const ALERTS_ENABLED_KEY: &str = "RECONCILIATION_ALERTS_ENABLED";
pub const ALERT_EMAIL_KEY: &str = "RECONCILIATION_ALERT_EMAIL";
pub const TOLERANCE_MINUTES_KEY: &str = "WEBHOOK_TIMESTAMP_TOLERANCE_MINUTES";
pub const JOB_SECRET_KEY: &str = "INTERNAL_JOB_SECRET";
pub const DELIVERY_TIMEOUT_KEY: &str = "WEBHOOK_DELIVERY_TIMEOUT_MS";
pub const BATCH_SIZE_KEY: &str = "WEBHOOK_BATCH_SIZE";
pub const ENCRYPTION_KEY_KEY: &str = "CARD_DATA_ENCRYPTION_KEY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub window: WindowSettings,
    pub alerts: AlertSettings,
    pub timestamp_tolerance_minutes: u64,
    pub job_secret: Option<String>,
    pub encryption_key: Option<String>,
    pub delivery_timeout_ms: u64,
    pub batch_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            window: WindowSettings::default(),
            alerts: AlertSettings::default(),
            timestamp_tolerance_minutes: DEFAULT_TOLERANCE_MINUTES,
            job_secret: None,
            encryption_key: None,
            delivery_timeout_ms: DEFAULT_DELIVERY_TIMEOUT_MS,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let positive = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(default)
        };
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            window: WindowSettings {
                lookback_hours: positive(LOOKBACK_HOURS_KEY, defaults.window.lookback_hours),
                min_age_minutes: positive(MIN_AGE_MINUTES_KEY, defaults.window.min_age_minutes),
                long_tail_hours: positive(LONG_TAIL_HOURS_KEY, defaults.window.long_tail_hours),
            },
            alerts: AlertSettings {
                enabled: lookup(ALERTS_ENABLED_KEY).as_deref() == Some("true"),
                recipient: non_empty(ALERT_EMAIL_KEY),
            },
            timestamp_tolerance_minutes: positive(TOLERANCE_MINUTES_KEY, defaults.timestamp_tolerance_minutes),
            job_secret: non_empty(JOB_SECRET_KEY),
            encryption_key: non_empty(ENCRYPTION_KEY_KEY),
            delivery_timeout_ms: positive(DELIVERY_TIMEOUT_KEY, defaults.delivery_timeout_ms),
            batch_size: positive(BATCH_SIZE_KEY, defaults.batch_size as u64) as usize,
        }
    }

    pub fn require_job_secret(&self) -> Result<&str, ConfigError> {
        self.job_secret
            .as_deref()
            .ok_or(ConfigError::Missing(JOB_SECRET_KEY))
    }

    /// Endpoint secret store for the dispatcher.
    pub fn secret_store(&self) -> Result<AesGcmSecrets, ConfigError> {
        self.encryption_key
            .as_deref()
            .map(AesGcmSecrets::from_passphrase)
            .ok_or(ConfigError::Missing(ENCRYPTION_KEY_KEY))
    }

    pub fn timestamp_tolerance(&self) -> Result<chrono::Duration, ConfigError> {
        i64::try_from(self.timestamp_tolerance_minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .ok_or_else(|| ConfigError::Invalid {
                key: TOLERANCE_MINUTES_KEY,
                value: self.timestamp_tolerance_minutes.to_string(),
            })
    }

    /// Reject values that parse but cannot be used, such as windows reaching
    /// past the representable calendar.
    pub fn validate(&self, now: chrono::DateTime<chrono::Utc>) -> Result<(), ConfigError> {
        compute_window(now, &self.window)?;
        self.timestamp_tolerance()?;
        Ok(())
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            batch_size: self.batch_size,
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            ..DispatcherConfig::default()
        }
    }

    pub fn reconciliation_config(&self) -> ReconciliationConfig {
        ReconciliationConfig {
            window: self.window,
            ..ReconciliationConfig::default()
        }
    }

    pub fn trigger_config(&self) -> TriggerConfig {
        TriggerConfig {
            job_secret: self.job_secret.clone(),
            ..TriggerConfig::default()
        }
    }
}
