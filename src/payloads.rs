//! Partner-facing payload shapes.
//!
//! A payload is either fully enriched or deferred. Deferred payloads carry
//! only the raw identifiers plus the dream board that still has to be
//! resolved; they are queued and delivered like any other, so consumers must
//! handle both shapes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::StoreError;
use crate::types::{Contribution, DreamBoardId, WebhookEvent, WebhookEventType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WebhookPayload {
    Full {
        data: Value,
    },
    Deferred {
        data: Value,
        dream_board_id: DreamBoardId,
    },
}

impl WebhookPayload {
    pub fn data(&self) -> &Value {
        match self {
            Self::Full { data } | Self::Deferred { data, .. } => data,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred { .. })
    }
}

/// Body POSTed to partner endpoints.
///
/// Full payloads deliver `{id, type, created_at, data}`. Deferred payloads add
/// `enrichment_required: true` and the unresolved `dream_board_id`.
pub fn delivery_body(event: &WebhookEvent) -> Value {
    let mut body = Map::new();
    body.insert("id".into(), json!(event.id));
    body.insert("type".into(), json!(event.event_type));
    body.insert("created_at".into(), json!(iso(event.created_at)));
    body.insert("data".into(), event.payload.data().clone());

    if let WebhookPayload::Deferred { dream_board_id, .. } = &event.payload {
        body.insert("enrichment_required".into(), Value::Bool(true));
        body.insert("dream_board_id".into(), json!(dream_board_id));
    }
    Value::Object(body)
}

fn iso(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Dream board with its current aggregate totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DreamBoardSummary {
    pub id: DreamBoardId,
    pub slug: String,
    pub child_name: String,
    pub goal_cents: i64,
    pub raised_cents: i64,
    pub contribution_count: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Read path for dream-board totals. `Ok(None)` means not yet visible.
#[async_trait]
pub trait DreamBoardReader: Send + Sync {
    async fn dream_board_with_totals(
        &self,
        id: &DreamBoardId,
    ) -> Result<Option<DreamBoardSummary>, StoreError>;
}

pub struct PayloadBuilder {
    reader: Arc<dyn DreamBoardReader>,
    base_url: String,
}

impl PayloadBuilder {
    pub fn new(reader: Arc<dyn DreamBoardReader>, base_url: impl Into<String>) -> Self {
        Self {
            reader,
            base_url: base_url.into(),
        }
    }

    /// Board data, or `None` when it cannot be resolved yet. Read errors are
    /// logged and treated as unresolved.
    async fn board_data(&self, id: &DreamBoardId) -> Option<Value> {
        match self.reader.dream_board_with_totals(id).await {
            Ok(Some(board)) => Some(self.serialize_board(&board)),
            Ok(None) => None,
            Err(err) => {
                tracing::error!(dream_board_id = %id, error = %err, "webhooks.payload_board_failed");
                None
            }
        }
    }

    fn serialize_board(&self, board: &DreamBoardSummary) -> Value {
        let base = self.base_url.trim_end_matches('/');
        json!({
            "id": board.id,
            "slug": board.slug,
            "child_name": board.child_name,
            "goal_cents": board.goal_cents,
            "raised_cents": board.raised_cents,
            "contribution_count": board.contribution_count,
            "status": board.status,
            "public_url": format!("{base}/{}", board.slug),
            "created_at": iso(board.created_at),
            "updated_at": iso(board.updated_at),
        })
    }

    pub async fn build_dream_board(&self, id: &DreamBoardId) -> WebhookPayload {
        match self.board_data(id).await {
            Some(data) => WebhookPayload::Full { data },
            None => WebhookPayload::Deferred {
                data: json!({ "dream_board_id": id }),
                dream_board_id: id.clone(),
            },
        }
    }

    pub async fn build_contribution(&self, contribution: &Contribution) -> WebhookPayload {
        let serialized = serialize_contribution(contribution);
        match self.board_data(&contribution.dream_board_id).await {
            Some(board) => WebhookPayload::Full {
                data: json!({ "contribution": serialized, "dream_board": board }),
            },
            None => WebhookPayload::Deferred {
                data: json!({ "contribution": serialized, "dream_board": Value::Null }),
                dream_board_id: contribution.dream_board_id.clone(),
            },
        }
    }

    /// Try to complete a deferred payload. Returns `None` when the board is
    /// still unresolvable; full payloads come back unchanged.
    pub async fn enrich(
        &self,
        event_type: WebhookEventType,
        payload: &WebhookPayload,
    ) -> Option<WebhookPayload> {
        let WebhookPayload::Deferred { data, dream_board_id } = payload else {
            return Some(payload.clone());
        };

        let board = self.board_data(dream_board_id).await?;
        let data = match event_type {
            WebhookEventType::ContributionReceived => {
                let contribution = data.get("contribution").filter(|c| !c.is_null())?;
                json!({ "contribution": contribution, "dream_board": board })
            }
            WebhookEventType::PotFunded
            | WebhookEventType::PotClosed
            | WebhookEventType::DreamBoardCreated
            | WebhookEventType::DreamBoardUpdated
            | WebhookEventType::DreamBoardClosed => board,
            _ => data.clone(),
        };
        Some(WebhookPayload::Full { data })
    }
}

pub fn serialize_contribution(c: &Contribution) -> Value {
    json!({
        "id": c.id,
        "dream_board_id": c.dream_board_id,
        "contributor_name": c.contributor_name,
        "message": c.message,
        "amount_cents": c.amount_cents,
        "fee_cents": c.fee_cents,
        "net_cents": c.amount_cents - c.fee_cents,
        "payment_status": c.payment_status,
        "created_at": iso(c.created_at),
    })
}
