use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::Instrument;

use crate::delivery::{deliver_to_endpoint, EndpointAttempt, Outbound, Transport, RESPONSE_BODY_LIMIT};
use crate::error::StoreError;
use crate::jobs::CancelFlag;
use crate::payloads::{delivery_body, PayloadBuilder, WebhookPayload};
use crate::schedule::RetrySchedule;
use crate::secrets::SecretStore;
use crate::storage::{AttemptRecord, WebhookStore};
use crate::types::{ApiKeyId, EventId, PartnerId, WebhookEvent, WebhookEventStatus, WebhookEventType};

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum events picked up per invocation.
    pub batch_size: usize,

    /// Upper bound on a single endpoint POST.
    pub delivery_timeout: Duration,

    /// Characters of a response body kept on the event.
    pub response_body_limit: usize,

    pub schedule: RetrySchedule,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            delivery_timeout: Duration::from_millis(DEFAULT_DELIVERY_TIMEOUT_MS),
            response_body_limit: RESPONSE_BODY_LIMIT,
            schedule: RetrySchedule::default(),
        }
    }
}

/// Counts for one [`WebhookDispatcher::process_queue`] invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub processed: usize,
    pub delivered: usize,
    pub failed: usize,

    /// Events that used their final scheduled attempt in this run.
    pub exhausted: usize,

    pub cancelled: bool,
}

/// Final status of one event attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventOutcome {
    pub event_id: EventId,
    pub status: WebhookEventStatus,
    pub attempts: u32,
    pub endpoints: Vec<EndpointAttempt>,
    pub exhausted: bool,
}

/// Durable, schedule-driven webhook fan-out.
///
/// Events are persisted by [`emit_event`](Self::emit_event) and picked up by
/// [`process_queue`](Self::process_queue) whenever their next scheduled
/// attempt is due. Status is tracked per event: one failing endpoint fails
/// the whole attempt and every endpoint is retried together.
pub struct WebhookDispatcher {
    store: Arc<dyn WebhookStore>,
    builder: Arc<PayloadBuilder>,
    transport: Arc<dyn Transport>,
    secrets: Arc<dyn SecretStore>,
    config: DispatcherConfig,
}

impl WebhookDispatcher {
    pub fn new(
        store: Arc<dyn WebhookStore>,
        builder: Arc<PayloadBuilder>,
        transport: Arc<dyn Transport>,
        secrets: Arc<dyn SecretStore>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            builder,
            transport,
            secrets,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Persist a new pending event. The event id doubles as the envelope id
    /// partners see.
    pub async fn emit_event(
        &self,
        api_key_id: Option<ApiKeyId>,
        event_type: WebhookEventType,
        payload: WebhookPayload,
        now: DateTime<Utc>,
    ) -> Result<EventId, StoreError> {
        let event = WebhookEvent::new(api_key_id, event_type, payload, now);
        match self.store.enqueue(&event).await {
            Ok(()) => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event_type,
                    api_key_id = ?event.api_key_id.as_ref().map(ApiKeyId::as_str),
                    deferred = event.payload.is_deferred(),
                    "webhooks.event_created"
                );
                crate::telemetry::metric_inc("webhooks.event_created");
                Ok(event.id)
            }
            Err(err) => {
                tracing::error!(event_type = %event_type, error = %err, "webhooks.event_create_failed");
                Err(err)
            }
        }
    }

    /// Emit one event per active API key of `partner_id`. Returns the ids of
    /// the events that were persisted; keys that fail to enqueue are logged
    /// and skipped.
    pub async fn emit_for_partner(
        &self,
        partner_id: &PartnerId,
        event_type: WebhookEventType,
        payload: WebhookPayload,
        now: DateTime<Utc>,
    ) -> Result<Vec<EventId>, StoreError> {
        let keys = self.store.active_api_keys_for_partner(partner_id).await?;
        if keys.is_empty() {
            tracing::warn!(partner_id = %partner_id, event_type = %event_type, "webhooks.emit_no_api_keys");
            return Ok(Vec::new());
        }

        let emitted = join_all(
            keys.into_iter()
                .map(|key| self.emit_event(Some(key), event_type, payload.clone(), now)),
        )
        .await;
        Ok(emitted.into_iter().filter_map(Result::ok).collect())
    }

    /// Deliver every due event, oldest first, until the batch is done or
    /// `cancel` is raised. Each event is persisted independently.
    pub async fn process_queue(
        &self,
        now: DateTime<Utc>,
        cancel: &CancelFlag,
    ) -> Result<QueueSummary, StoreError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("webhooks", run_id = %run_id);
        self.process_batch(now, cancel).instrument(span).await
    }

    async fn process_batch(&self, now: DateTime<Utc>, cancel: &CancelFlag) -> Result<QueueSummary, StoreError> {
        let events = self
            .store
            .due_events(now, &self.config.schedule, self.config.batch_size)
            .await?;
        let mut summary = QueueSummary::default();
        if events.is_empty() {
            return Ok(summary);
        }
        tracing::info!(count = events.len(), "webhooks.processing_batch");

        for event in events {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                tracing::warn!(processed = summary.processed, "webhooks.batch_cancelled");
                break;
            }

            let outcome = match self.process_event(event, now).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(error = %err, "webhooks.event_update_failed");
                    continue;
                }
            };

            summary.processed += 1;
            match outcome.status {
                WebhookEventStatus::Delivered => summary.delivered += 1,
                _ => summary.failed += 1,
            }
            if outcome.exhausted {
                summary.exhausted += 1;
            }
        }

        tracing::info!(
            processed = summary.processed,
            delivered = summary.delivered,
            failed = summary.failed,
            exhausted = summary.exhausted,
            "webhooks.batch_completed"
        );
        Ok(summary)
    }

    /// One scheduled attempt for `event`: enrich, fan out, record.
    pub async fn process_event(
        &self,
        mut event: WebhookEvent,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome, StoreError> {
        let Some(api_key_id) = event.api_key_id.clone() else {
            tracing::warn!(event_id = %event.id, "webhooks.event_no_api_key");
            return self
                .record(&event.id, false, now, None, Some("no_api_key".to_string()), Vec::new())
                .await;
        };

        if event.payload.is_deferred() {
            self.try_enrich(&mut event).await?;
        }

        let endpoints = self
            .store
            .active_endpoints_for(&api_key_id, event.event_type)
            .await?;
        if endpoints.is_empty() {
            tracing::info!(event_id = %event.id, event_type = %event.event_type, "webhooks.no_endpoints");
            return self.record(&event.id, true, now, None, None, Vec::new()).await;
        }

        let body = serde_json::to_vec(&delivery_body(&event))?;
        let outbound = Outbound {
            event_id: &event.id,
            body: &body,
            timestamp_secs: now.timestamp(),
            timeout: self.config.delivery_timeout,
            body_limit: self.config.response_body_limit,
        };

        let attempts = join_all(endpoints.iter().map(|endpoint| {
            deliver_to_endpoint(self.transport.as_ref(), self.secrets.as_ref(), endpoint, &outbound)
        }))
        .await;

        for attempt in &attempts {
            tracing::info!(
                event_id = %event.id,
                endpoint_id = %attempt.endpoint_id,
                success = attempt.delivered,
                status_code = ?attempt.response_code,
                "webhooks.delivery_attempt"
            );
        }

        let delivered = attempts.iter().all(|a| a.delivered);
        let (code, response_body) = if delivered {
            attempts
                .last()
                .map(|a| (a.response_code, a.response_body.clone()))
                .unwrap_or((None, None))
        } else {
            attempts
                .iter()
                .rev()
                .find(|a| !a.delivered)
                .map(|a| (a.response_code, a.response_body.clone()))
                .unwrap_or((None, None))
        };

        self.record(&event.id, delivered, now, code, response_body, attempts).await
    }

    /// Upgrade a deferred payload in place when the board is now visible.
    /// Still-unresolvable payloads are delivered as they are.
    async fn try_enrich(&self, event: &mut WebhookEvent) -> Result<(), StoreError> {
        match self.builder.enrich(event.event_type, &event.payload).await {
            Some(enriched) => {
                self.store.update_payload(&event.id, &enriched).await?;
                tracing::info!(event_id = %event.id, "webhooks.payload_enriched");
                event.payload = enriched;
            }
            None => {
                tracing::warn!(event_id = %event.id, "webhooks.payload_enrichment_deferred");
            }
        }
        Ok(())
    }

    async fn record(
        &self,
        event_id: &EventId,
        delivered: bool,
        at: DateTime<Utc>,
        response_code: Option<u16>,
        response_body: Option<String>,
        endpoints: Vec<EndpointAttempt>,
    ) -> Result<EventOutcome, StoreError> {
        let updated = self
            .store
            .record_attempt(
                event_id,
                &AttemptRecord {
                    delivered,
                    at,
                    response_code,
                    response_body,
                },
            )
            .await?;

        let exhausted = updated.status == WebhookEventStatus::Failed
            && self.config.schedule.is_exhausted(updated.attempts);
        if exhausted {
            tracing::error!(
                event_id = %updated.id,
                event_type = %updated.event_type,
                attempts = updated.attempts,
                last_response_code = ?updated.last_response_code,
                "webhooks.event_exhausted"
            );
            crate::telemetry::metric_inc("webhooks.event_exhausted");
        }

        Ok(EventOutcome {
            event_id: updated.id,
            status: updated.status,
            attempts: updated.attempts,
            endpoints,
            exhausted,
        })
    }

    /// Permanently failed events, oldest first.
    pub async fn exhausted_events(&self, limit: usize) -> Result<Vec<WebhookEvent>, StoreError> {
        self.store.exhausted_events(&self.config.schedule, limit).await
    }

    /// Next time `event` will be picked up, or `None` when it never will.
    pub fn next_attempt_at(&self, event: &WebhookEvent) -> Option<DateTime<Utc>> {
        if event.status == WebhookEventStatus::Delivered {
            return None;
        }
        self.config.schedule.next_eligible_at(event.created_at, event.attempts)
    }
}
