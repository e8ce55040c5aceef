//! Settlement core for a group-gifting payments platform.
//!
//! This crate provides the **batch, store-agnostic** pieces that keep
//! payments and partner integrations honest:
//!
//! - a reconciliation job that re-checks unsettled contributions against
//!   their payment provider and escalates total mismatches,
//! - a durable webhook dispatcher that signs and fans events out to partner
//!   endpoints on a fixed retry schedule,
//! - a dual-window rate limiter over a shared counter store,
//! - signature and timestamp validation for inbound and outbound webhooks.
//!
//! ## Guarantees
//! - Terminal payment states are never overwritten by reconciliation
//! - At-least-once webhook delivery, deduplicable by `X-Event-Id`
//! - Per-record failure isolation inside every batch
//! - Atomic rate-limit accounting across processes sharing a store
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Real-time settlement
//! - Per-endpoint delivery status
//!
//! Storage, HTTP, alerting and provider access are injected through traits;
//! in-memory implementations ship for tests and single-process use.

mod alerts;
mod config;
mod delivery;
mod dispatcher;
mod error;
mod jobs;
mod lease;
mod payloads;
mod provider;
mod rate_limit;
mod reconcile_job;
mod reconciliation;
mod schedule;
mod secrets;
mod signing;
mod storage;
mod telemetry;
mod types;

#[cfg(feature = "redis")]
mod storage_redis;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use alerts::{AlertSettings, AlertSink, LogAlertSink, MismatchAlert, MismatchAlerter, ReconciliationMismatch};
pub use config::Settings;
pub use delivery::{
    truncate_chars, DeliveryRequest, EndpointAttempt, Transport, TransportResponse, RESPONSE_BODY_LIMIT,
};
pub use dispatcher::{DispatcherConfig, EventOutcome, QueueSummary, WebhookDispatcher};
pub use error::{
    AlertError, ConfigError, DeliveryError, JobError, ProviderError, RateLimitError, SecretError, StoreError,
};
pub use jobs::{BatchJob, CancelFlag, JobTrigger, TriggerConfig};
pub use lease::{InMemoryLease, JobLease, LeaseToken};
pub use payloads::{delivery_body, serialize_contribution, DreamBoardReader, DreamBoardSummary, PayloadBuilder, WebhookPayload};
pub use provider::{ProviderRegistry, ProviderReport, ProviderStatusSource};
pub use rate_limit::{
    burst_limit_for, CounterStore, InMemoryCounterStore, RateLimitResult, RateLimiter, WindowHit, WindowSnapshot,
};
pub use reconcile_job::{Phase, PassResult, ReconciliationConfig, ReconciliationJob, ReconciliationReport};
pub use reconciliation::{
    compute_window, decide, expected_total, Decision, ProviderStatus, ReconciliationWindow, SettledStatus,
    SkipReason, WindowSettings,
};
pub use schedule::{RetrySchedule, WEBHOOK_RETRY_MINUTES};
pub use secrets::{AesGcmSecrets, PlaintextSecrets, SecretStore};
pub use signing::{
    build_webhook_headers, parse_signature_header, sign, signature_header_value, validate_timestamp,
    verify_header, verify_signature, verify_signed_request, ParsedSignature, TimestampError, TimestampValue,
    VerificationError, DEFAULT_TOLERANCE_MINUTES, EVENT_ID_HEADER, SIGNATURE_HEADER,
};
pub use storage::{
    AttemptRecord, ContributionStore, CreatedRange, InMemoryContributionStore, InMemoryWebhookStore, StatusUpdate,
    WebhookStore,
};
pub use telemetry::init_tracing;
pub use types::{
    ApiKeyId, Contribution, ContributionId, DreamBoardId, EndpointId, EventId, PartnerId, PaymentProvider,
    PaymentStatus, WebhookEndpoint, WebhookEvent, WebhookEventStatus, WebhookEventType, WILDCARD_EVENT,
};

#[cfg(feature = "http")]
pub use delivery::HttpTransport;

#[cfg(feature = "redis")]
pub use storage_redis::{RedisCounterStore, RedisLease};

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStore;
