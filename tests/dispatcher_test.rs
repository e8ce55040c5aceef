use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

use chipin_settlement::{
    verify_header, ApiKeyId, CancelFlag, DeliveryError, DeliveryRequest, DispatcherConfig, DreamBoardId,
    DreamBoardReader, DreamBoardSummary, InMemoryWebhookStore, PartnerId, PayloadBuilder, PlaintextSecrets,
    StoreError, Transport, TransportResponse, WebhookDispatcher, WebhookEndpoint, WebhookEventStatus,
    WebhookEventType, WebhookPayload, WebhookStore, EVENT_ID_HEADER, SIGNATURE_HEADER,
};

/// Answers every POST with the status configured for its URL.
#[derive(Default)]
struct ScriptedTransport {
    statuses: Mutex<HashMap<String, u16>>,
    calls: Mutex<Vec<DeliveryRequest>>,
}

impl ScriptedTransport {
    fn respond(&self, url: &str, status: u16) {
        self.statuses.lock().unwrap().insert(url.to_string(), status);
    }

    fn calls_to(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|r| r.url == url).count()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post(&self, request: &DeliveryRequest) -> Result<TransportResponse, DeliveryError> {
        self.calls.lock().unwrap().push(request.clone());
        let status = self.statuses.lock().unwrap().get(&request.url).copied().unwrap_or(200);
        Ok(TransportResponse {
            status,
            body: format!("status {status}"),
        })
    }
}

#[derive(Default)]
struct Boards(Mutex<HashMap<DreamBoardId, DreamBoardSummary>>);

#[async_trait]
impl DreamBoardReader for Boards {
    async fn dream_board_with_totals(&self, id: &DreamBoardId) -> Result<Option<DreamBoardSummary>, StoreError> {
        Ok(self.0.lock().unwrap().get(id).cloned())
    }
}

fn board(id: &str, created: DateTime<Utc>) -> DreamBoardSummary {
    DreamBoardSummary {
        id: id.into(),
        slug: "mias-bike".into(),
        child_name: "Mia".into(),
        goal_cents: 150_000,
        raised_cents: 20_000,
        contribution_count: 2,
        status: "active".into(),
        created_at: created,
        updated_at: created,
    }
}

fn endpoint(id: &str, url: &str, events: &[&str]) -> WebhookEndpoint {
    WebhookEndpoint {
        id: id.into(),
        api_key_id: "key_1".into(),
        url: url.into(),
        events: events.iter().map(|e| e.to_string()).collect(),
        secret: format!("whsec_{id}"),
        is_active: true,
    }
}

fn created() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 1, 8, 0, 0).unwrap()
}

struct Harness {
    store: Arc<InMemoryWebhookStore>,
    transport: Arc<ScriptedTransport>,
    boards: Arc<Boards>,
    dispatcher: WebhookDispatcher,
}

async fn harness() -> Harness {
    let store = Arc::new(InMemoryWebhookStore::new());
    store.add_api_key("key_1".into(), "partner_1".into(), true).await;
    let transport = Arc::new(ScriptedTransport::default());
    let boards = Arc::new(Boards::default());
    let dispatcher = WebhookDispatcher::new(
        store.clone(),
        Arc::new(PayloadBuilder::new(boards.clone(), "https://chipin.example")),
        transport.clone(),
        Arc::new(PlaintextSecrets),
        DispatcherConfig::default(),
    );
    Harness {
        store,
        transport,
        boards,
        dispatcher,
    }
}

fn full(data: serde_json::Value) -> WebhookPayload {
    WebhookPayload::Full { data }
}

#[tokio::test]
async fn one_failing_endpoint_fails_the_event_and_both_are_retried() {
    let h = harness().await;
    h.store.add_endpoint(endpoint("ep_a", "https://a.example/hook", &["*"])).await;
    h.store
        .add_endpoint(endpoint("ep_b", "https://b.example/hook", &["pot.funded"]))
        .await;
    h.transport.respond("https://b.example/hook", 500);

    let event_id = h
        .dispatcher
        .emit_event(Some("key_1".into()), WebhookEventType::PotFunded, full(json!({"id": "db_1"})), created())
        .await
        .unwrap();

    let cancel = CancelFlag::new();
    let summary = h.dispatcher.process_queue(created(), &cancel).await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 1);

    let event = h.store.get(&event_id).await.unwrap().unwrap();
    assert_eq!(event.status, WebhookEventStatus::Failed);
    assert_eq!(event.attempts, 1);
    assert_eq!(event.last_response_code, Some(500));
    assert_eq!(event.last_response_body.as_deref(), Some("status 500"));

    // Not due again until one minute after creation.
    let early = h
        .dispatcher
        .process_queue(created() + Duration::seconds(30), &cancel)
        .await
        .unwrap();
    assert_eq!(early.processed, 0);

    h.transport.respond("https://b.example/hook", 200);
    let retry = h
        .dispatcher
        .process_queue(created() + Duration::minutes(1), &cancel)
        .await
        .unwrap();
    assert_eq!(retry.delivered, 1);
    assert_eq!(h.transport.calls_to("https://a.example/hook"), 2);
    assert_eq!(h.transport.calls_to("https://b.example/hook"), 2);

    let event = h.store.get(&event_id).await.unwrap().unwrap();
    assert_eq!(event.status, WebhookEventStatus::Delivered);
    assert_eq!(event.attempts, 2);
    assert_eq!(h.dispatcher.next_attempt_at(&event), None);
}

#[tokio::test]
async fn deliveries_are_signed_with_event_id() {
    let h = harness().await;
    h.store.add_endpoint(endpoint("ep_a", "https://a.example/hook", &["*"])).await;

    let event_id = h
        .dispatcher
        .emit_event(
            Some("key_1".into()),
            WebhookEventType::ContributionReceived,
            full(json!({"contribution": {"id": "c_1"}})),
            created(),
        )
        .await
        .unwrap();
    h.dispatcher.process_queue(created(), &CancelFlag::new()).await.unwrap();

    let calls = h.transport.calls.lock().unwrap();
    let request = &calls[0];
    let header = |name: &str| {
        request
            .headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.clone())
            .unwrap()
    };
    assert_eq!(header(EVENT_ID_HEADER), event_id.as_str());
    assert!(verify_header(&header(SIGNATURE_HEADER), &request.body, b"whsec_ep_a"));

    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["id"], event_id.as_str());
    assert_eq!(body["type"], "contribution.received");
    assert_eq!(body["data"]["contribution"]["id"], "c_1");
    assert!(body.get("kind").is_none());
}

#[tokio::test]
async fn event_is_exhausted_after_the_last_scheduled_attempt() {
    let h = harness().await;
    h.store.add_endpoint(endpoint("ep_a", "https://a.example/hook", &["*"])).await;
    h.transport.respond("https://a.example/hook", 503);

    let event_id = h
        .dispatcher
        .emit_event(Some("key_1".into()), WebhookEventType::PayoutReady, full(json!({})), created())
        .await
        .unwrap();

    let cancel = CancelFlag::new();
    let mut exhausted = 0;
    for minutes in [0, 1, 5, 30, 120, 720, 1440] {
        let summary = h
            .dispatcher
            .process_queue(created() + Duration::minutes(minutes), &cancel)
            .await
            .unwrap();
        assert_eq!(summary.processed, 1, "attempt at +{minutes}m");
        exhausted += summary.exhausted;
    }
    assert_eq!(exhausted, 1);

    let later = h
        .dispatcher
        .process_queue(created() + Duration::days(30), &cancel)
        .await
        .unwrap();
    assert_eq!(later.processed, 0);

    let listed = h.dispatcher.exhausted_events(10).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, event_id);
    assert_eq!(listed[0].attempts, 7);
    assert_eq!(h.transport.calls_to("https://a.example/hook"), 7);
}

#[tokio::test]
async fn events_without_endpoints_are_delivered_and_without_key_are_failed() {
    let h = harness().await;
    h.store
        .add_endpoint(endpoint("ep_a", "https://a.example/hook", &["payout.completed"]))
        .await;

    let unmatched = h
        .dispatcher
        .emit_event(Some("key_1".into()), WebhookEventType::PotClosed, full(json!({})), created())
        .await
        .unwrap();
    let orphan = h
        .dispatcher
        .emit_event(None, WebhookEventType::PotClosed, full(json!({})), created())
        .await
        .unwrap();

    h.dispatcher.process_queue(created(), &CancelFlag::new()).await.unwrap();

    let unmatched = h.store.get(&unmatched).await.unwrap().unwrap();
    assert_eq!(unmatched.status, WebhookEventStatus::Delivered);

    let orphan = h.store.get(&orphan).await.unwrap().unwrap();
    assert_eq!(orphan.status, WebhookEventStatus::Failed);
    assert_eq!(orphan.last_response_body.as_deref(), Some("no_api_key"));
    assert_eq!(h.transport.calls.lock().unwrap().len(), 0);
}

#[tokio::test]
async fn deferred_payload_is_enriched_once_the_board_resolves() {
    let h = harness().await;
    h.store.add_endpoint(endpoint("ep_a", "https://a.example/hook", &["*"])).await;
    h.transport.respond("https://a.example/hook", 500);

    let deferred = WebhookPayload::Deferred {
        data: json!({"dream_board_id": "db_1"}),
        dream_board_id: "db_1".into(),
    };
    let event_id = h
        .dispatcher
        .emit_event(Some("key_1".into()), WebhookEventType::PotFunded, deferred, created())
        .await
        .unwrap();

    let cancel = CancelFlag::new();
    h.dispatcher.process_queue(created(), &cancel).await.unwrap();
    {
        let calls = h.transport.calls.lock().unwrap();
        let body: serde_json::Value = serde_json::from_slice(&calls[0].body).unwrap();
        assert_eq!(body["enrichment_required"], true);
        assert_eq!(body["dream_board_id"], "db_1");
    }

    h.boards.0.lock().unwrap().insert("db_1".into(), board("db_1", created()));
    h.transport.respond("https://a.example/hook", 200);
    h.dispatcher
        .process_queue(created() + Duration::minutes(1), &cancel)
        .await
        .unwrap();

    let event = h.store.get(&event_id).await.unwrap().unwrap();
    assert!(!event.payload.is_deferred());
    assert_eq!(event.payload.data()["public_url"], "https://chipin.example/mias-bike");

    let calls = h.transport.calls.lock().unwrap();
    let body: serde_json::Value = serde_json::from_slice(&calls[1].body).unwrap();
    assert!(body.get("enrichment_required").is_none());
    assert_eq!(body["data"]["raised_cents"], 20_000);
}

#[tokio::test]
async fn partner_emission_fans_out_to_active_keys() {
    let h = harness().await;
    h.store.add_api_key("key_2".into(), "partner_1".into(), true).await;
    h.store.add_api_key("key_3".into(), "partner_1".into(), false).await;

    let partner: PartnerId = "partner_1".into();
    let ids = h
        .dispatcher
        .emit_for_partner(&partner, WebhookEventType::DreamBoardCreated, full(json!({})), created())
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);

    let mut keys = Vec::new();
    for id in &ids {
        keys.push(h.store.get(id).await.unwrap().unwrap().api_key_id.unwrap());
    }
    keys.sort();
    assert_eq!(keys, vec![ApiKeyId::from("key_1"), ApiKeyId::from("key_2")]);

    let nobody = h
        .dispatcher
        .emit_for_partner(&"partner_x".into(), WebhookEventType::DreamBoardCreated, full(json!({})), created())
        .await
        .unwrap();
    assert!(nobody.is_empty());
}

#[tokio::test]
async fn cancelled_batch_leaves_events_for_the_next_run() {
    let h = harness().await;
    h.dispatcher
        .emit_event(Some("key_1".into()), WebhookEventType::PotFunded, full(json!({})), created())
        .await
        .unwrap();

    let cancel = CancelFlag::new();
    cancel.cancel();
    let summary = h.dispatcher.process_queue(created(), &cancel).await.unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.processed, 0);

    let resumed = h.dispatcher.process_queue(created(), &CancelFlag::new()).await.unwrap();
    assert_eq!(resumed.processed, 1);
}
