//! Single HTTP delivery attempt to one partner endpoint.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::DeliveryError;
use crate::secrets::SecretStore;
use crate::signing::build_webhook_headers;
use crate::types::{EndpointId, EventId, WebhookEndpoint};

/// Default cap on the stored response body, in characters.
pub const RESPONSE_BODY_LIMIT: usize = 1024;

#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Outbound POST. Any response, 2xx or not, is `Ok`; only the absence of a
/// response is an error.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, request: &DeliveryRequest) -> Result<TransportResponse, DeliveryError>;
}

#[cfg(feature = "http")]
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, request: &DeliveryRequest) -> Result<TransportResponse, DeliveryError> {
        let mut builder = self
            .client
            .post(&request.url)
            .body(request.body.clone())
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                DeliveryError::Timeout
            } else {
                DeliveryError::Network(err.to_string())
            }
        })?;

        let status = response.status().as_u16();
        // An unreadable body still counts as a response.
        let body = response.text().await.unwrap_or_default();
        Ok(TransportResponse { status, body })
    }
}

/// Outcome of delivering one event to one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAttempt {
    pub endpoint_id: EndpointId,
    pub delivered: bool,
    pub response_code: Option<u16>,
    pub response_body: Option<String>,
}

/// Everything needed to deliver one serialized event body.
pub(crate) struct Outbound<'a> {
    pub event_id: &'a EventId,
    pub body: &'a [u8],
    pub timestamp_secs: i64,
    pub timeout: Duration,
    pub body_limit: usize,
}

/// Sign and POST `outbound` to `endpoint`. Never fails: a missing secret,
/// a timeout or a non-2xx answer all come back as an undelivered attempt.
pub(crate) async fn deliver_to_endpoint(
    transport: &dyn Transport,
    secrets: &dyn SecretStore,
    endpoint: &WebhookEndpoint,
    outbound: &Outbound<'_>,
) -> EndpointAttempt {
    let failed = |code: Option<u16>, body: String| EndpointAttempt {
        endpoint_id: endpoint.id.clone(),
        delivered: false,
        response_code: code,
        response_body: Some(truncate_chars(&body, outbound.body_limit)),
    };

    let secret = match secrets.decrypt(&endpoint.secret) {
        Ok(secret) => secret,
        Err(err) => {
            tracing::error!(
                endpoint_id = %endpoint.id,
                event_id = %outbound.event_id,
                error = %err,
                "webhooks.secret_unavailable"
            );
            return failed(None, err.to_string());
        }
    };

    let headers = build_webhook_headers(
        outbound.body,
        &secret,
        outbound.event_id.as_str(),
        outbound.timestamp_secs,
    );
    drop(secret);

    let request = DeliveryRequest {
        url: endpoint.url.clone(),
        headers,
        body: outbound.body.to_vec(),
        timeout: outbound.timeout,
    };

    let result = tokio::time::timeout(outbound.timeout, transport.post(&request))
        .await
        .unwrap_or(Err(DeliveryError::Timeout));

    match result {
        Ok(response) if response.is_success() => {
            crate::telemetry::metric_inc("webhooks.delivery.success");
            EndpointAttempt {
                endpoint_id: endpoint.id.clone(),
                delivered: true,
                response_code: Some(response.status),
                response_body: Some(truncate_chars(&response.body, outbound.body_limit)),
            }
        }
        Ok(response) => {
            tracing::warn!(
                endpoint_id = %endpoint.id,
                event_id = %outbound.event_id,
                status = response.status,
                "webhooks.delivery_rejected"
            );
            crate::telemetry::metric_inc("webhooks.delivery.failure");
            failed(Some(response.status), response.body)
        }
        Err(err) => {
            tracing::warn!(
                endpoint_id = %endpoint.id,
                event_id = %outbound.event_id,
                error = %err,
                "webhooks.delivery_error"
            );
            crate::telemetry::metric_inc("webhooks.delivery.failure");
            failed(None, err.to_string())
        }
    }
}

/// First `limit` characters of `text`, never splitting a code point.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::PlaintextSecrets;
    use crate::signing::{verify_header, SIGNATURE_HEADER};
    use std::sync::Mutex;

    struct Canned {
        status: u16,
        seen: Mutex<Vec<DeliveryRequest>>,
    }

    #[async_trait]
    impl Transport for Canned {
        async fn post(&self, request: &DeliveryRequest) -> Result<TransportResponse, DeliveryError> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(TransportResponse {
                status: self.status,
                body: "x".repeat(2_000),
            })
        }
    }

    struct Hanging;

    #[async_trait]
    impl Transport for Hanging {
        async fn post(&self, _request: &DeliveryRequest) -> Result<TransportResponse, DeliveryError> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(TransportResponse { status: 200, body: String::new() })
        }
    }

    fn endpoint(secret: &str) -> WebhookEndpoint {
        WebhookEndpoint {
            id: "ep_1".into(),
            api_key_id: "key_1".into(),
            url: "https://partner.example/hook".into(),
            events: vec!["*".into()],
            secret: secret.into(),
            is_active: true,
        }
    }

    fn outbound<'a>(event_id: &'a EventId, body: &'a [u8]) -> Outbound<'a> {
        Outbound {
            event_id,
            body,
            timestamp_secs: 1_700_000_000,
            timeout: Duration::from_secs(15),
            body_limit: RESPONSE_BODY_LIMIT,
        }
    }

    #[tokio::test]
    async fn signs_body_and_truncates_response() {
        let transport = Canned { status: 500, seen: Mutex::new(Vec::new()) };
        let event_id: EventId = "evt_1".into();
        let body = br#"{"id":"evt_1"}"#;

        let attempt =
            deliver_to_endpoint(&transport, &PlaintextSecrets, &endpoint("whsec"), &outbound(&event_id, body)).await;

        assert!(!attempt.delivered);
        assert_eq!(attempt.response_code, Some(500));
        assert_eq!(attempt.response_body.as_deref().map(str::len), Some(1024));

        let seen = transport.seen.lock().unwrap();
        let signature = seen[0]
            .headers
            .iter()
            .find(|(name, _)| *name == SIGNATURE_HEADER)
            .map(|(_, value)| value.clone())
            .unwrap();
        assert!(verify_header(&signature, body, b"whsec"));
    }

    #[tokio::test]
    async fn missing_secret_fails_without_calling_out() {
        let transport = Canned { status: 200, seen: Mutex::new(Vec::new()) };
        let event_id: EventId = "evt_1".into();

        let attempt =
            deliver_to_endpoint(&transport, &PlaintextSecrets, &endpoint(""), &outbound(&event_id, b"{}")).await;

        assert!(!attempt.delivered);
        assert_eq!(attempt.response_code, None);
        assert!(transport.seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_endpoint_times_out() {
        let event_id: EventId = "evt_1".into();
        let attempt =
            deliver_to_endpoint(&Hanging, &PlaintextSecrets, &endpoint("whsec"), &outbound(&event_id, b"{}")).await;

        assert!(!attempt.delivered);
        assert_eq!(attempt.response_body.as_deref(), Some("request timed out"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
