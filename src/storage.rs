use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::payloads::WebhookPayload;
use crate::schedule::RetrySchedule;
use crate::types::{
    ApiKeyId, Contribution, ContributionId, DreamBoardId, EventId, PartnerId, PaymentStatus,
    WebhookEndpoint, WebhookEvent, WebhookEventStatus, WebhookEventType,
};

/// Range of contribution creation times to scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub end_inclusive: bool,
}

impl CreatedRange {
    /// `[start, end]`
    pub fn closed(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end, end_inclusive: true }
    }

    /// `[start, end)`
    pub fn half_open(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end, end_inclusive: false }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && if self.end_inclusive { at <= self.end } else { at < self.end }
    }
}

/// Result of a guarded status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Applied,
    /// The contribution had already settled; nothing was written.
    AlreadyTerminal(PaymentStatus),
}

#[async_trait]
pub trait ContributionStore: Send + Sync {
    /// Pending or processing contributions created inside `range`, oldest first.
    async fn list_unsettled(&self, range: CreatedRange) -> Result<Vec<Contribution>, StoreError>;

    /// Move a non-terminal contribution to `status`. Terminal rows are left
    /// untouched and reported as [`StatusUpdate::AlreadyTerminal`].
    async fn update_status(
        &self,
        id: &ContributionId,
        status: PaymentStatus,
    ) -> Result<StatusUpdate, StoreError>;

    /// Operator override that may replace a terminal status.
    async fn override_status(
        &self,
        id: &ContributionId,
        status: PaymentStatus,
    ) -> Result<(), StoreError>;

    /// Flip the board to funded once completed contributions reach its goal.
    async fn mark_dream_board_funded_if_needed(&self, id: &DreamBoardId) -> Result<(), StoreError>;
}

/// Metadata written for every delivery attempt, whatever its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub delivered: bool,
    pub at: DateTime<Utc>,
    pub response_code: Option<u16>,
    pub response_body: Option<String>,
}

#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn enqueue(&self, event: &WebhookEvent) -> Result<(), StoreError>;

    async fn get(&self, id: &EventId) -> Result<Option<WebhookEvent>, StoreError>;

    /// Undelivered events whose next scheduled attempt is due, oldest first.
    async fn due_events(
        &self,
        now: DateTime<Utc>,
        schedule: &RetrySchedule,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, StoreError>;

    /// Failed events that ran through the whole schedule.
    async fn exhausted_events(
        &self,
        schedule: &RetrySchedule,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, StoreError>;

    /// Active endpoints of an active key subscribed to `event_type` or `*`.
    async fn active_endpoints_for(
        &self,
        api_key_id: &ApiKeyId,
        event_type: WebhookEventType,
    ) -> Result<Vec<WebhookEndpoint>, StoreError>;

    async fn active_api_keys_for_partner(&self, partner_id: &PartnerId) -> Result<Vec<ApiKeyId>, StoreError>;

    /// Increment `attempts`, set the status and the attempt metadata.
    async fn record_attempt(&self, id: &EventId, attempt: &AttemptRecord) -> Result<WebhookEvent, StoreError>;

    async fn update_payload(&self, id: &EventId, payload: &WebhookPayload) -> Result<(), StoreError>;
}

/// In-memory contribution store for lightweight deployments and tests.
#[derive(Default)]
pub struct InMemoryContributionStore {
    contributions: Mutex<HashMap<ContributionId, Contribution>>,
    funded_checks: Mutex<Vec<DreamBoardId>>,
}

impl InMemoryContributionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, contribution: Contribution) {
        self.contributions
            .lock()
            .await
            .insert(contribution.id.clone(), contribution);
    }

    pub async fn get(&self, id: &ContributionId) -> Option<Contribution> {
        self.contributions.lock().await.get(id).cloned()
    }

    /// Boards a funded check was requested for, in call order.
    pub async fn funded_checks(&self) -> Vec<DreamBoardId> {
        self.funded_checks.lock().await.clone()
    }
}

#[async_trait]
impl ContributionStore for InMemoryContributionStore {
    async fn list_unsettled(&self, range: CreatedRange) -> Result<Vec<Contribution>, StoreError> {
        let guard = self.contributions.lock().await;
        let mut found: Vec<Contribution> = guard
            .values()
            .filter(|c| !c.payment_status.is_terminal() && range.contains(c.created_at))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn update_status(
        &self,
        id: &ContributionId,
        status: PaymentStatus,
    ) -> Result<StatusUpdate, StoreError> {
        let mut guard = self.contributions.lock().await;
        let contribution = guard
            .get_mut(id)
            .ok_or_else(|| StoreError::ContributionNotFound(id.clone()))?;

        if contribution.payment_status.is_terminal() {
            return Ok(StatusUpdate::AlreadyTerminal(contribution.payment_status));
        }
        contribution.payment_status = status;
        Ok(StatusUpdate::Applied)
    }

    async fn override_status(
        &self,
        id: &ContributionId,
        status: PaymentStatus,
    ) -> Result<(), StoreError> {
        let mut guard = self.contributions.lock().await;
        let contribution = guard
            .get_mut(id)
            .ok_or_else(|| StoreError::ContributionNotFound(id.clone()))?;
        contribution.payment_status = status;
        Ok(())
    }

    async fn mark_dream_board_funded_if_needed(&self, id: &DreamBoardId) -> Result<(), StoreError> {
        self.funded_checks.lock().await.push(id.clone());
        Ok(())
    }
}

/// In-memory webhook ledger and endpoint registry.
#[derive(Default)]
pub struct InMemoryWebhookStore {
    events: Mutex<HashMap<EventId, WebhookEvent>>,
    endpoints: Mutex<Vec<WebhookEndpoint>>,
    api_keys: Mutex<HashMap<ApiKeyId, (PartnerId, bool)>>,
}

impl InMemoryWebhookStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_api_key(&self, id: ApiKeyId, partner_id: PartnerId, is_active: bool) {
        self.api_keys.lock().await.insert(id, (partner_id, is_active));
    }

    pub async fn add_endpoint(&self, endpoint: WebhookEndpoint) {
        self.endpoints.lock().await.push(endpoint);
    }
}

#[async_trait]
impl WebhookStore for InMemoryWebhookStore {
    async fn enqueue(&self, event: &WebhookEvent) -> Result<(), StoreError> {
        self.events.lock().await.insert(event.id.clone(), event.clone());
        Ok(())
    }

    async fn get(&self, id: &EventId) -> Result<Option<WebhookEvent>, StoreError> {
        Ok(self.events.lock().await.get(id).cloned())
    }

    async fn due_events(
        &self,
        now: DateTime<Utc>,
        schedule: &RetrySchedule,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let guard = self.events.lock().await;
        let mut due: Vec<WebhookEvent> = guard
            .values()
            .filter(|e| e.status != WebhookEventStatus::Delivered)
            .filter(|e| schedule.is_due(e.created_at, e.attempts, now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn exhausted_events(
        &self,
        schedule: &RetrySchedule,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let guard = self.events.lock().await;
        let mut exhausted: Vec<WebhookEvent> = guard
            .values()
            .filter(|e| e.status == WebhookEventStatus::Failed && schedule.is_exhausted(e.attempts))
            .cloned()
            .collect();
        exhausted.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        exhausted.truncate(limit);
        Ok(exhausted)
    }

    async fn active_endpoints_for(
        &self,
        api_key_id: &ApiKeyId,
        event_type: WebhookEventType,
    ) -> Result<Vec<WebhookEndpoint>, StoreError> {
        let key_active = self
            .api_keys
            .lock()
            .await
            .get(api_key_id)
            .map(|(_, active)| *active)
            .unwrap_or(false);
        if !key_active {
            return Ok(Vec::new());
        }

        let guard = self.endpoints.lock().await;
        Ok(guard
            .iter()
            .filter(|e| &e.api_key_id == api_key_id && e.is_active && e.subscribes_to(event_type))
            .cloned()
            .collect())
    }

    async fn active_api_keys_for_partner(&self, partner_id: &PartnerId) -> Result<Vec<ApiKeyId>, StoreError> {
        let guard = self.api_keys.lock().await;
        let mut keys: Vec<ApiKeyId> = guard
            .iter()
            .filter(|(_, (partner, active))| partner == partner_id && *active)
            .map(|(id, _)| id.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn record_attempt(&self, id: &EventId, attempt: &AttemptRecord) -> Result<WebhookEvent, StoreError> {
        let mut guard = self.events.lock().await;
        let event = guard
            .get_mut(id)
            .ok_or_else(|| StoreError::EventNotFound(id.clone()))?;

        event.attempts += 1;
        event.status = if attempt.delivered {
            WebhookEventStatus::Delivered
        } else {
            WebhookEventStatus::Failed
        };
        event.last_attempt_at = Some(attempt.at);
        event.last_response_code = attempt.response_code;
        event.last_response_body = attempt.response_body.clone();
        Ok(event.clone())
    }

    async fn update_payload(&self, id: &EventId, payload: &WebhookPayload) -> Result<(), StoreError> {
        let mut guard = self.events.lock().await;
        let event = guard
            .get_mut(id)
            .ok_or_else(|| StoreError::EventNotFound(id.clone()))?;
        event.payload = payload.clone();
        Ok(())
    }
}
