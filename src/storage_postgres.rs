use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, Row};

use crate::error::StoreError;
use crate::payloads::{DreamBoardReader, DreamBoardSummary, WebhookPayload};
use crate::schedule::RetrySchedule;
use crate::storage::{AttemptRecord, ContributionStore, CreatedRange, StatusUpdate, WebhookStore};
use crate::types::{
    ApiKeyId, Contribution, ContributionId, DreamBoardId, EndpointId, EventId, PartnerId,
    PaymentProvider, PaymentStatus, WebhookEndpoint, WebhookEvent, WebhookEventStatus,
    WebhookEventType,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS dream_boards (
        id TEXT PRIMARY KEY,
        slug TEXT NOT NULL,
        child_name TEXT NOT NULL,
        goal_cents BIGINT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS contributions (
        id TEXT PRIMARY KEY,
        dream_board_id TEXT NOT NULL,
        contributor_name TEXT,
        message TEXT,
        amount_cents BIGINT NOT NULL,
        fee_cents BIGINT NOT NULL,
        payment_provider TEXT NOT NULL,
        payment_ref TEXT NOT NULL,
        payment_status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS contributions_unsettled_idx
        ON contributions (created_at) WHERE payment_status IN ('pending', 'processing')",
    "CREATE TABLE IF NOT EXISTS api_keys (
        id TEXT PRIMARY KEY,
        partner_id TEXT NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT TRUE
    )",
    "CREATE TABLE IF NOT EXISTS webhook_endpoints (
        id TEXT PRIMARY KEY,
        api_key_id TEXT NOT NULL,
        url TEXT NOT NULL,
        events TEXT[] NOT NULL,
        secret TEXT NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT TRUE
    )",
    "CREATE TABLE IF NOT EXISTS webhook_events (
        id TEXT PRIMARY KEY,
        api_key_id TEXT,
        event_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_attempt_at TIMESTAMPTZ,
        last_response_code INTEGER,
        last_response_body TEXT,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS webhook_events_undelivered_idx
        ON webhook_events (created_at) WHERE status <> 'delivered'",
];

const CONTRIBUTION_COLUMNS: &str = "id, dream_board_id, contributor_name, message, amount_cents, \
     fee_cents, payment_provider, payment_ref, payment_status, created_at";

const EVENT_COLUMNS: &str = "id, api_key_id, event_type, payload, status, attempts, \
     last_attempt_at, last_response_code, last_response_body, created_at";

fn backend(err: tokio_postgres::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn parse<T: FromStr<Err = String>>(value: &str) -> Result<T, StoreError> {
    value.parse().map_err(StoreError::Backend)
}

/// Postgres-backed ledger for contributions, dream boards and webhook
/// events. Creates its tables on construction.
pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    pub async fn new(client: Client) -> Result<Self, StoreError> {
        for statement in SCHEMA {
            client.execute(*statement, &[]).await.map_err(backend)?;
        }
        Ok(Self { client })
    }

    fn contribution_from_row(row: &Row) -> Result<Contribution, StoreError> {
        let provider: String = row.try_get("payment_provider").map_err(backend)?;
        let status: String = row.try_get("payment_status").map_err(backend)?;
        Ok(Contribution {
            id: ContributionId(row.try_get("id").map_err(backend)?),
            dream_board_id: DreamBoardId(row.try_get("dream_board_id").map_err(backend)?),
            contributor_name: row.try_get("contributor_name").map_err(backend)?,
            message: row.try_get("message").map_err(backend)?,
            amount_cents: row.try_get("amount_cents").map_err(backend)?,
            fee_cents: row.try_get("fee_cents").map_err(backend)?,
            payment_provider: parse::<PaymentProvider>(&provider)?,
            payment_ref: row.try_get("payment_ref").map_err(backend)?,
            payment_status: parse::<PaymentStatus>(&status)?,
            created_at: row.try_get("created_at").map_err(backend)?,
        })
    }

    fn event_from_row(row: &Row) -> Result<WebhookEvent, StoreError> {
        let event_type: String = row.try_get("event_type").map_err(backend)?;
        let status: String = row.try_get("status").map_err(backend)?;
        let payload: serde_json::Value = row.try_get("payload").map_err(backend)?;
        let attempts: i32 = row.try_get("attempts").map_err(backend)?;
        let code: Option<i32> = row.try_get("last_response_code").map_err(backend)?;

        Ok(WebhookEvent {
            id: EventId(row.try_get("id").map_err(backend)?),
            api_key_id: row
                .try_get::<_, Option<String>>("api_key_id")
                .map_err(backend)?
                .map(ApiKeyId),
            event_type: parse::<WebhookEventType>(&event_type)?,
            payload: serde_json::from_value(payload)?,
            status: parse::<WebhookEventStatus>(&status)?,
            attempts: attempts.max(0) as u32,
            last_attempt_at: row.try_get("last_attempt_at").map_err(backend)?,
            last_response_code: code.and_then(|c| u16::try_from(c).ok()),
            last_response_body: row.try_get("last_response_body").map_err(backend)?,
            created_at: row.try_get("created_at").map_err(backend)?,
        })
    }

    /// Insert a contribution, or refresh the status of an unsettled one.
    /// Settled rows only change through
    /// [`override_status`](ContributionStore::override_status).
    pub async fn upsert_contribution(&self, c: &Contribution) -> Result<StatusUpdate, StoreError> {
        let written = self
            .client
            .execute(
                "INSERT INTO contributions (id, dream_board_id, contributor_name, message, amount_cents,
                     fee_cents, payment_provider, payment_ref, payment_status, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                 ON CONFLICT (id) DO UPDATE SET payment_status = EXCLUDED.payment_status, updated_at = now()
                 WHERE contributions.payment_status IN ('pending', 'processing')",
                &[
                    &c.id.as_str(),
                    &c.dream_board_id.as_str(),
                    &c.contributor_name,
                    &c.message,
                    &c.amount_cents,
                    &c.fee_cents,
                    &c.payment_provider.as_str(),
                    &c.payment_ref,
                    &c.payment_status.as_str(),
                    &c.created_at,
                ],
            )
            .await
            .map_err(backend)?;
        if written > 0 {
            return Ok(StatusUpdate::Applied);
        }
        Ok(StatusUpdate::AlreadyTerminal(self.current_status(&c.id).await?))
    }

    async fn current_status(&self, id: &ContributionId) -> Result<PaymentStatus, StoreError> {
        let row = self
            .client
            .query_opt("SELECT payment_status FROM contributions WHERE id = $1", &[&id.as_str()])
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::ContributionNotFound(id.clone()))?;
        let current: String = row.try_get(0).map_err(backend)?;
        parse(&current)
    }
}

#[async_trait]
impl ContributionStore for PostgresStore {
    async fn list_unsettled(&self, range: CreatedRange) -> Result<Vec<Contribution>, StoreError> {
        let upper = if range.end_inclusive { "<=" } else { "<" };
        let sql = format!(
            "SELECT {CONTRIBUTION_COLUMNS} FROM contributions
             WHERE payment_status IN ('pending', 'processing')
               AND created_at >= $1 AND created_at {upper} $2
             ORDER BY created_at, id"
        );
        let rows = self
            .client
            .query(&sql, &[&range.start, &range.end])
            .await
            .map_err(backend)?;
        rows.iter().map(Self::contribution_from_row).collect()
    }

    async fn update_status(
        &self,
        id: &ContributionId,
        status: PaymentStatus,
    ) -> Result<StatusUpdate, StoreError> {
        let updated = self
            .client
            .execute(
                "UPDATE contributions SET payment_status = $2, updated_at = now()
                 WHERE id = $1 AND payment_status IN ('pending', 'processing')",
                &[&id.as_str(), &status.as_str()],
            )
            .await
            .map_err(backend)?;
        if updated > 0 {
            return Ok(StatusUpdate::Applied);
        }
        Ok(StatusUpdate::AlreadyTerminal(self.current_status(id).await?))
    }

    async fn override_status(&self, id: &ContributionId, status: PaymentStatus) -> Result<(), StoreError> {
        let updated = self
            .client
            .execute(
                "UPDATE contributions SET payment_status = $2, updated_at = now() WHERE id = $1",
                &[&id.as_str(), &status.as_str()],
            )
            .await
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::ContributionNotFound(id.clone()));
        }
        Ok(())
    }

    async fn mark_dream_board_funded_if_needed(&self, id: &DreamBoardId) -> Result<(), StoreError> {
        let flipped = self
            .client
            .execute(
                "UPDATE dream_boards d SET status = 'funded', updated_at = now()
                 WHERE d.id = $1 AND d.status = 'active'
                   AND (SELECT COALESCE(SUM(c.amount_cents - c.fee_cents), 0) FROM contributions c
                        WHERE c.dream_board_id = d.id AND c.payment_status = 'completed') >= d.goal_cents",
                &[&id.as_str()],
            )
            .await
            .map_err(backend)?;
        if flipped > 0 {
            tracing::info!(dream_board_id = %id, "dream_board.funded");
        }
        Ok(())
    }
}

#[async_trait]
impl DreamBoardReader for PostgresStore {
    async fn dream_board_with_totals(&self, id: &DreamBoardId) -> Result<Option<DreamBoardSummary>, StoreError> {
        let row = self
            .client
            .query_opt(
                "SELECT d.id, d.slug, d.child_name, d.goal_cents, d.status, d.created_at, d.updated_at,
                        COALESCE(SUM(c.amount_cents - c.fee_cents), 0)::BIGINT AS raised_cents,
                        COUNT(c.id)::BIGINT AS contribution_count
                 FROM dream_boards d
                 LEFT JOIN contributions c
                   ON c.dream_board_id = d.id AND c.payment_status = 'completed'
                 WHERE d.id = $1
                 GROUP BY d.id",
                &[&id.as_str()],
            )
            .await
            .map_err(backend)?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(DreamBoardSummary {
            id: DreamBoardId(row.try_get("id").map_err(backend)?),
            slug: row.try_get("slug").map_err(backend)?,
            child_name: row.try_get("child_name").map_err(backend)?,
            goal_cents: row.try_get("goal_cents").map_err(backend)?,
            raised_cents: row.try_get("raised_cents").map_err(backend)?,
            contribution_count: row.try_get("contribution_count").map_err(backend)?,
            status: row.try_get("status").map_err(backend)?,
            created_at: row.try_get("created_at").map_err(backend)?,
            updated_at: row.try_get("updated_at").map_err(backend)?,
        }))
    }
}

#[async_trait]
impl WebhookStore for PostgresStore {
    async fn enqueue(&self, event: &WebhookEvent) -> Result<(), StoreError> {
        let payload = serde_json::to_value(&event.payload)?;
        let api_key = event.api_key_id.as_ref().map(ApiKeyId::as_str);
        self.client
            .execute(
                "INSERT INTO webhook_events (id, api_key_id, event_type, payload, status, attempts, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &event.id.as_str(),
                    &api_key,
                    &event.event_type.as_str(),
                    &payload,
                    &event.status.as_str(),
                    &(event.attempts as i32),
                    &event.created_at,
                ],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get(&self, id: &EventId) -> Result<Option<WebhookEvent>, StoreError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM webhook_events WHERE id = $1");
        let row = self.client.query_opt(&sql, &[&id.as_str()]).await.map_err(backend)?;
        row.as_ref().map(Self::event_from_row).transpose()
    }

    async fn due_events(
        &self,
        now: DateTime<Utc>,
        schedule: &RetrySchedule,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        // SQL arrays are 1-based: attempt n waits for offsets[n + 1].
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events
             WHERE status <> 'delivered'
               AND attempts < cardinality($2::BIGINT[])
               AND created_at + make_interval(mins => (($2::BIGINT[])[attempts + 1])::INTEGER) <= $1
             ORDER BY created_at, id
             LIMIT $3"
        );
        let rows = self
            .client
            .query(&sql, &[&now, &schedule.offset_minutes(), &(limit as i64)])
            .await
            .map_err(backend)?;
        rows.iter().map(Self::event_from_row).collect()
    }

    async fn exhausted_events(
        &self,
        schedule: &RetrySchedule,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events
             WHERE status = 'failed' AND attempts >= $1
             ORDER BY created_at
             LIMIT $2"
        );
        let rows = self
            .client
            .query(&sql, &[&(schedule.max_attempts() as i32), &(limit as i64)])
            .await
            .map_err(backend)?;
        rows.iter().map(Self::event_from_row).collect()
    }

    async fn active_endpoints_for(
        &self,
        api_key_id: &ApiKeyId,
        event_type: WebhookEventType,
    ) -> Result<Vec<WebhookEndpoint>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT e.id, e.api_key_id, e.url, e.events, e.secret, e.is_active
                 FROM webhook_endpoints e
                 JOIN api_keys k ON k.id = e.api_key_id
                 WHERE e.api_key_id = $1 AND e.is_active AND k.is_active
                   AND ($2 = ANY(e.events) OR '*' = ANY(e.events))
                 ORDER BY e.id",
                &[&api_key_id.as_str(), &event_type.as_str()],
            )
            .await
            .map_err(backend)?;

        rows.iter()
            .map(|row| {
                Ok(WebhookEndpoint {
                    id: EndpointId(row.try_get("id").map_err(backend)?),
                    api_key_id: ApiKeyId(row.try_get("api_key_id").map_err(backend)?),
                    url: row.try_get("url").map_err(backend)?,
                    events: row.try_get("events").map_err(backend)?,
                    secret: row.try_get("secret").map_err(backend)?,
                    is_active: row.try_get("is_active").map_err(backend)?,
                })
            })
            .collect()
    }

    async fn active_api_keys_for_partner(&self, partner_id: &PartnerId) -> Result<Vec<ApiKeyId>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT id FROM api_keys WHERE partner_id = $1 AND is_active ORDER BY id",
                &[&partner_id.as_str()],
            )
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|row| Ok(ApiKeyId(row.try_get(0).map_err(backend)?)))
            .collect()
    }

    async fn record_attempt(&self, id: &EventId, attempt: &AttemptRecord) -> Result<WebhookEvent, StoreError> {
        let status = if attempt.delivered {
            WebhookEventStatus::Delivered
        } else {
            WebhookEventStatus::Failed
        };
        let code = attempt.response_code.map(i32::from);
        let sql = format!(
            "UPDATE webhook_events
             SET attempts = attempts + 1, status = $2, last_attempt_at = $3,
                 last_response_code = $4, last_response_body = $5
             WHERE id = $1
             RETURNING {EVENT_COLUMNS}"
        );
        let row = self
            .client
            .query_opt(
                &sql,
                &[&id.as_str(), &status.as_str(), &attempt.at, &code, &attempt.response_body],
            )
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::EventNotFound(id.clone()))?;
        Self::event_from_row(&row)
    }

    async fn update_payload(&self, id: &EventId, payload: &WebhookPayload) -> Result<(), StoreError> {
        let value = serde_json::to_value(payload)?;
        let updated = self
            .client
            .execute(
                "UPDATE webhook_events SET payload = $2 WHERE id = $1",
                &[&id.as_str(), &value],
            )
            .await
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::EventNotFound(id.clone()));
        }
        Ok(())
    }
}
