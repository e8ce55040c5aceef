use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::payloads::WebhookPayload;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Unique identifier for a contribution.
    ContributionId
);
string_id!(DreamBoardId);
string_id!(
    /// Unique identifier for a webhook event. Also sent as `X-Event-Id`
    /// so receivers can deduplicate redeliveries.
    EventId
);
string_id!(EndpointId);
string_id!(
    /// Partner API key that owns events and endpoints.
    ApiKeyId
);
string_id!(PartnerId);

impl EventId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Payment lifecycle of a contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    /// Terminal states are never overwritten by reconciliation.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Refunded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "refunded" => Ok(Self::Refunded),
            other => Err(format!("unknown payment status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentProvider {
    Payfast,
    Ozow,
    Snapscan,
}

impl PaymentProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Payfast => "payfast",
            Self::Ozow => "ozow",
            Self::Snapscan => "snapscan",
        }
    }
}

impl fmt::Display for PaymentProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "payfast" => Ok(Self::Payfast),
            "ozow" => Ok(Self::Ozow),
            "snapscan" => Ok(Self::Snapscan),
            other => Err(format!("unknown payment provider {other:?}")),
        }
    }
}

/// A guest's payment attempt toward a dream board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub id: ContributionId,
    pub dream_board_id: DreamBoardId,
    pub contributor_name: Option<String>,
    pub message: Option<String>,

    /// Gift amount in cents.
    pub amount_cents: i64,

    /// Platform fee in cents.
    pub fee_cents: i64,

    pub payment_provider: PaymentProvider,

    /// Reference the provider knows this payment by.
    pub payment_ref: String,

    pub payment_status: PaymentStatus,
    pub created_at: DateTime<Utc>,
}

impl Contribution {
    /// Amount the provider must report as settled.
    pub fn expected_total(&self) -> i64 {
        crate::reconciliation::expected_total(self.amount_cents, self.fee_cents)
    }
}

/// Closed set of event types partners can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebhookEventType {
    #[serde(rename = "contribution.received")]
    ContributionReceived,
    #[serde(rename = "pot.funded")]
    PotFunded,
    #[serde(rename = "pot.closed")]
    PotClosed,
    #[serde(rename = "dreamboard.created")]
    DreamBoardCreated,
    #[serde(rename = "dreamboard.updated")]
    DreamBoardUpdated,
    #[serde(rename = "dreamboard.closed")]
    DreamBoardClosed,
    #[serde(rename = "payout.ready")]
    PayoutReady,
    #[serde(rename = "payout.completed")]
    PayoutCompleted,
    #[serde(rename = "payout.failed")]
    PayoutFailed,
}

impl WebhookEventType {
    pub const ALL: [WebhookEventType; 9] = [
        Self::ContributionReceived,
        Self::PotFunded,
        Self::PotClosed,
        Self::DreamBoardCreated,
        Self::DreamBoardUpdated,
        Self::DreamBoardClosed,
        Self::PayoutReady,
        Self::PayoutCompleted,
        Self::PayoutFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ContributionReceived => "contribution.received",
            Self::PotFunded => "pot.funded",
            Self::PotClosed => "pot.closed",
            Self::DreamBoardCreated => "dreamboard.created",
            Self::DreamBoardUpdated => "dreamboard.updated",
            Self::DreamBoardClosed => "dreamboard.closed",
            Self::PayoutReady => "payout.ready",
            Self::PayoutCompleted => "payout.completed",
            Self::PayoutFailed => "payout.failed",
        }
    }
}

impl fmt::Display for WebhookEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown webhook event type {s:?}"))
    }
}

/// Delivery lifecycle of a webhook event.
///
/// `Delivered` is terminal. `Failed` stays retryable until the retry
/// schedule is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookEventStatus {
    Pending,
    Delivered,
    Failed,
}

impl WebhookEventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for WebhookEventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown webhook event status {other:?}")),
        }
    }
}

/// Durable record of a domain change queued for partner delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: EventId,
    pub api_key_id: Option<ApiKeyId>,
    pub event_type: WebhookEventType,
    pub payload: WebhookPayload,
    pub status: WebhookEventStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_response_code: Option<u16>,
    pub last_response_body: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn new(
        api_key_id: Option<ApiKeyId>,
        event_type: WebhookEventType,
        payload: WebhookPayload,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventId::generate(),
            api_key_id,
            event_type,
            payload,
            status: WebhookEventStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            last_response_code: None,
            last_response_body: None,
            created_at,
        }
    }
}

/// Subscription wildcard accepted in [`WebhookEndpoint::events`].
pub const WILDCARD_EVENT: &str = "*";

/// Partner-registered delivery target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub id: EndpointId,
    pub api_key_id: ApiKeyId,
    pub url: String,

    /// Subscribed event type strings, or `*`.
    pub events: Vec<String>,

    /// Signing secret as persisted (encrypted at rest).
    pub secret: String,

    pub is_active: bool,
}

impl WebhookEndpoint {
    pub fn subscribes_to(&self, event_type: WebhookEventType) -> bool {
        self.events
            .iter()
            .any(|e| e == WILDCARD_EVENT || e == event_type.as_str())
    }
}
