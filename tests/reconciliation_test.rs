use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::Mutex;

use chipin_settlement::{
    AlertError, AlertSettings, AlertSink, CancelFlag, ConfigError, Contribution, ContributionId, ContributionStore,
    CreatedRange, DreamBoardId, InMemoryContributionStore, JobError, MismatchAlert, MismatchAlerter, PaymentProvider,
    PaymentStatus, ProviderError, ProviderRegistry, ProviderReport, ProviderStatus, ProviderStatusSource,
    ReconciliationConfig, ReconciliationJob, StatusUpdate, StoreError, WindowSettings,
};

/// Provider double keyed by payment reference.
#[derive(Default)]
struct FakeProvider {
    reports: HashMap<String, Result<ProviderReport, ProviderError>>,
    hang_on: Option<String>,
}

impl FakeProvider {
    fn with(mut self, reference: &str, status: ProviderStatus, received: Option<i64>) -> Self {
        self.reports.insert(
            reference.to_string(),
            Ok(ProviderReport {
                status,
                received_total_cents: received,
            }),
        );
        self
    }

    fn failing(mut self, reference: &str) -> Self {
        self.reports
            .insert(reference.to_string(), Err(ProviderError::Request("502 bad gateway".into())));
        self
    }
}

#[async_trait]
impl ProviderStatusSource for FakeProvider {
    async fn query_status(&self, reference: &str) -> Result<ProviderReport, ProviderError> {
        if self.hang_on.as_deref() == Some(reference) {
            tokio::time::sleep(StdDuration::from_secs(3_600)).await;
        }
        self.reports.get(reference).cloned().unwrap_or(Ok(ProviderReport {
            status: ProviderStatus::Unknown,
            received_total_cents: None,
        }))
    }
}

#[derive(Default)]
struct RecordingSink(Mutex<Vec<MismatchAlert>>);

#[async_trait]
impl AlertSink for RecordingSink {
    async fn send(&self, alert: &MismatchAlert) -> Result<(), AlertError> {
        self.0.lock().await.push(alert.clone());
        Ok(())
    }
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 5, 10, 12, 0, 0).unwrap()
}

fn contribution(id: &str, reference: &str, age: Duration) -> Contribution {
    Contribution {
        id: id.into(),
        dream_board_id: "db_1".into(),
        contributor_name: Some("Thandi".into()),
        message: None,
        amount_cents: 10_000,
        fee_cents: 300,
        payment_provider: PaymentProvider::Ozow,
        payment_ref: reference.into(),
        payment_status: PaymentStatus::Pending,
        created_at: now() - age,
    }
}

/// In-memory store with scripted faults.
struct FaultyStore {
    inner: Arc<InMemoryContributionStore>,
    /// Listing calls from this index on fail.
    fail_listing_from: Option<usize>,
    listings: AtomicUsize,
    /// Settle the row to this status just before each guarded write.
    settle_first: Option<PaymentStatus>,
}

impl FaultyStore {
    fn new(inner: Arc<InMemoryContributionStore>) -> Self {
        Self {
            inner,
            fail_listing_from: None,
            listings: AtomicUsize::new(0),
            settle_first: None,
        }
    }
}

#[async_trait]
impl ContributionStore for FaultyStore {
    async fn list_unsettled(&self, range: CreatedRange) -> Result<Vec<Contribution>, StoreError> {
        let call = self.listings.fetch_add(1, Ordering::SeqCst);
        if self.fail_listing_from.is_some_and(|from| call >= from) {
            return Err(StoreError::Backend("connection reset".into()));
        }
        self.inner.list_unsettled(range).await
    }

    async fn update_status(&self, id: &ContributionId, status: PaymentStatus) -> Result<StatusUpdate, StoreError> {
        if let Some(settled) = self.settle_first {
            self.inner.override_status(id, settled).await?;
        }
        self.inner.update_status(id, status).await
    }

    async fn override_status(&self, id: &ContributionId, status: PaymentStatus) -> Result<(), StoreError> {
        self.inner.override_status(id, status).await
    }

    async fn mark_dream_board_funded_if_needed(&self, id: &DreamBoardId) -> Result<(), StoreError> {
        self.inner.mark_dream_board_funded_if_needed(id).await
    }
}

/// Raises the run's cancel flag on its first query.
struct CancellingProvider {
    cancel: CancelFlag,
    inner: FakeProvider,
}

#[async_trait]
impl ProviderStatusSource for CancellingProvider {
    async fn query_status(&self, reference: &str) -> Result<ProviderReport, ProviderError> {
        self.cancel.cancel();
        self.inner.query_status(reference).await
    }
}

fn job(
    store: Arc<dyn ContributionStore>,
    provider: impl ProviderStatusSource + 'static,
    sink: Arc<RecordingSink>,
    window: WindowSettings,
) -> ReconciliationJob {
    ReconciliationJob::new(
        store,
        ProviderRegistry::new().with_source(PaymentProvider::Ozow, Arc::new(provider)),
        MismatchAlerter::new(
            sink,
            AlertSettings {
                enabled: true,
                recipient: Some("ops@example.com".into()),
            },
        ),
        ReconciliationConfig {
            window,
            provider_timeout: StdDuration::from_secs(5),
        },
    )
}

#[tokio::test]
async fn matching_total_completes_and_short_total_raises_one_alert() {
    let store = Arc::new(InMemoryContributionStore::new());
    store.insert(contribution("c_ok", "OZ-1", Duration::hours(1))).await;
    store.insert(contribution("c_short", "OZ-2", Duration::hours(2))).await;
    store.insert(contribution("c_fail", "OZ-3", Duration::hours(3))).await;

    let provider = FakeProvider::default()
        .with("OZ-1", ProviderStatus::Completed, Some(10_300))
        .with("OZ-2", ProviderStatus::Completed, Some(10_200))
        .with("OZ-3", ProviderStatus::Failed, None);
    let sink = Arc::new(RecordingSink::default());

    let report = job(store.clone(), provider, sink.clone(), WindowSettings::default())
        .run(now(), &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(report.scanned(), 3);
    assert_eq!(report.updated(), 1);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.mismatches().len(), 1);
    assert!(report.alert_sent);

    assert_eq!(store.get(&"c_ok".into()).await.unwrap().payment_status, PaymentStatus::Completed);
    assert_eq!(store.get(&"c_short".into()).await.unwrap().payment_status, PaymentStatus::Pending);
    assert_eq!(store.get(&"c_fail".into()).await.unwrap().payment_status, PaymentStatus::Failed);
    assert_eq!(store.funded_checks().await, vec![DreamBoardId::from("db_1")]);

    let alerts = sink.0.lock().await;
    assert_eq!(alerts.len(), 1);
    let mismatch = &alerts[0].mismatches[0];
    assert_eq!(mismatch.expected_total, 10_300);
    assert_eq!(mismatch.received_total, Some(10_200));
    assert!(alerts[0].body.contains("OZ-2"));
}

#[tokio::test]
async fn provider_failure_is_isolated_to_its_record() {
    let store = Arc::new(InMemoryContributionStore::new());
    store.insert(contribution("c_err", "OZ-1", Duration::hours(1))).await;
    store.insert(contribution("c_ok", "OZ-2", Duration::hours(2))).await;

    let provider = FakeProvider::default()
        .failing("OZ-1")
        .with("OZ-2", ProviderStatus::Completed, Some(10_300));
    let sink = Arc::new(RecordingSink::default());

    let report = job(store.clone(), provider, sink.clone(), WindowSettings::default())
        .run(now(), &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(report.scanned(), 2);
    assert_eq!(report.updated(), 1);
    assert_eq!(report.unresolved(), 1);
    assert_eq!(store.get(&"c_err".into()).await.unwrap().payment_status, PaymentStatus::Pending);
    assert!(!report.alert_sent);
    assert!(sink.0.lock().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn hung_provider_times_out_as_unknown() {
    let store = Arc::new(InMemoryContributionStore::new());
    store.insert(contribution("c_slow", "OZ-1", Duration::hours(1))).await;

    let provider = FakeProvider {
        hang_on: Some("OZ-1".into()),
        ..FakeProvider::default()
    };
    let report = job(store.clone(), provider, Arc::new(RecordingSink::default()), WindowSettings::default())
        .run(now(), &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(report.unresolved(), 1);
    assert_eq!(store.get(&"c_slow".into()).await.unwrap().payment_status, PaymentStatus::Pending);
}

#[tokio::test]
async fn window_boundaries_select_primary_and_long_tail_records() {
    let store = Arc::new(InMemoryContributionStore::new());
    // Too fresh: inside the settlement grace period.
    store.insert(contribution("c_fresh", "OZ-1", Duration::minutes(5))).await;
    // Exactly at the cutoff: primary.
    store.insert(contribution("c_cutoff", "OZ-2", Duration::minutes(10))).await;
    // Exactly at lookback start: primary, not long tail.
    store.insert(contribution("c_edge", "OZ-3", Duration::hours(24))).await;
    // Straggler.
    store.insert(contribution("c_tail", "OZ-4", Duration::hours(72))).await;
    // Older than the long tail.
    store.insert(contribution("c_ancient", "OZ-5", Duration::hours(200))).await;

    let provider = FakeProvider::default()
        .with("OZ-1", ProviderStatus::Completed, Some(10_300))
        .with("OZ-2", ProviderStatus::Completed, Some(10_300))
        .with("OZ-3", ProviderStatus::Completed, Some(10_300))
        .with("OZ-4", ProviderStatus::Completed, Some(10_300))
        .with("OZ-5", ProviderStatus::Completed, Some(10_300));

    let report = job(store.clone(), provider, Arc::new(RecordingSink::default()), WindowSettings::default())
        .run(now(), &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(report.primary.scanned, 2);
    assert!(report.long_tail_ran);
    assert_eq!(report.long_tail.scanned, 1);
    assert_eq!(report.long_tail.updated, 1);

    let status = |id: &'static str| {
        let store = store.clone();
        async move { store.get(&id.into()).await.unwrap().payment_status }
    };
    assert_eq!(status("c_fresh").await, PaymentStatus::Pending);
    assert_eq!(status("c_cutoff").await, PaymentStatus::Completed);
    assert_eq!(status("c_edge").await, PaymentStatus::Completed);
    assert_eq!(status("c_tail").await, PaymentStatus::Completed);
    assert_eq!(status("c_ancient").await, PaymentStatus::Pending);
}

#[tokio::test]
async fn long_tail_is_skipped_when_it_does_not_reach_past_lookback() {
    let store = Arc::new(InMemoryContributionStore::new());
    store.insert(contribution("c_tail", "OZ-1", Duration::hours(30))).await;

    let provider = FakeProvider::default().with("OZ-1", ProviderStatus::Completed, Some(10_300));
    let window = WindowSettings {
        lookback_hours: 48,
        min_age_minutes: 10,
        long_tail_hours: 24,
    };
    let report = job(store.clone(), provider, Arc::new(RecordingSink::default()), window)
        .run(now(), &CancelFlag::new())
        .await
        .unwrap();

    assert!(!report.long_tail_ran);
    assert_eq!(report.long_tail.scanned, 0);
    // Still covered by the wider primary window.
    assert_eq!(report.primary.updated, 1);
}

#[tokio::test]
async fn settled_contributions_are_never_rewritten() {
    let store = Arc::new(InMemoryContributionStore::new());
    store.insert(contribution("c_1", "OZ-1", Duration::hours(1))).await;
    store
        .override_status(&"c_1".into(), PaymentStatus::Refunded)
        .await
        .unwrap();

    let provider = FakeProvider::default().with("OZ-1", ProviderStatus::Completed, Some(10_300));
    let report = job(store.clone(), provider, Arc::new(RecordingSink::default()), WindowSettings::default())
        .run(now(), &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(report.scanned(), 0);
    assert_eq!(store.get(&"c_1".into()).await.unwrap().payment_status, PaymentStatus::Refunded);
}

#[tokio::test]
async fn providers_without_a_source_stay_unresolved() {
    let store = Arc::new(InMemoryContributionStore::new());
    let mut payfast = contribution("c_pf", "PF-1", Duration::hours(1));
    payfast.payment_provider = PaymentProvider::Payfast;
    store.insert(payfast).await;

    let report = job(store.clone(), FakeProvider::default(), Arc::new(RecordingSink::default()), WindowSettings::default())
        .run(now(), &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(report.unresolved(), 1);
    assert_eq!(store.get(&"c_pf".into()).await.unwrap().payment_status, PaymentStatus::Pending);
}

#[tokio::test]
async fn primary_and_long_tail_mismatches_share_one_alert() {
    let store = Arc::new(InMemoryContributionStore::new());
    store.insert(contribution("c_recent", "OZ-1", Duration::hours(2))).await;
    store.insert(contribution("c_old", "OZ-2", Duration::hours(72))).await;

    let provider = FakeProvider::default()
        .with("OZ-1", ProviderStatus::Completed, Some(10_200))
        .with("OZ-2", ProviderStatus::Completed, Some(10_100));
    let sink = Arc::new(RecordingSink::default());

    let report = job(store, provider, sink.clone(), WindowSettings::default())
        .run(now(), &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(report.primary.mismatches.len(), 1);
    assert_eq!(report.long_tail.mismatches.len(), 1);
    assert!(report.alert_sent);

    let alerts = sink.0.lock().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].mismatches.len(), 2);
    assert!(alerts[0].body.contains("OZ-1"));
    assert!(alerts[0].body.contains("OZ-2"));
}

#[tokio::test]
async fn long_tail_load_failure_still_alerts_primary_mismatches() {
    let inner = Arc::new(InMemoryContributionStore::new());
    inner.insert(contribution("c_short", "OZ-1", Duration::hours(2))).await;
    inner.insert(contribution("c_old", "OZ-2", Duration::hours(72))).await;
    let store = FaultyStore {
        fail_listing_from: Some(1),
        ..FaultyStore::new(inner.clone())
    };

    let provider = FakeProvider::default()
        .with("OZ-1", ProviderStatus::Completed, Some(10_200))
        .with("OZ-2", ProviderStatus::Completed, Some(10_300));
    let sink = Arc::new(RecordingSink::default());

    let report = job(Arc::new(store), provider, sink.clone(), WindowSettings::default())
        .run(now(), &CancelFlag::new())
        .await
        .unwrap();

    assert!(report.long_tail_failed);
    assert!(!report.long_tail_ran);
    assert!(report.alert_sent);
    assert_eq!(sink.0.lock().await.len(), 1);
    assert_eq!(inner.get(&"c_old".into()).await.unwrap().payment_status, PaymentStatus::Pending);
}

#[tokio::test]
async fn cancellation_stops_between_records() {
    let store = Arc::new(InMemoryContributionStore::new());
    store.insert(contribution("c_1", "OZ-1", Duration::hours(3))).await;
    store.insert(contribution("c_2", "OZ-2", Duration::hours(2))).await;
    store.insert(contribution("c_3", "OZ-3", Duration::hours(72))).await;

    let cancel = CancelFlag::new();
    let provider = CancellingProvider {
        cancel: cancel.clone(),
        inner: FakeProvider::default()
            .with("OZ-1", ProviderStatus::Completed, Some(10_300))
            .with("OZ-2", ProviderStatus::Completed, Some(10_300))
            .with("OZ-3", ProviderStatus::Completed, Some(10_300)),
    };

    let report = job(store.clone(), provider, Arc::new(RecordingSink::default()), WindowSettings::default())
        .run(now(), &cancel)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.scanned(), 1);
    assert!(!report.long_tail_ran);
    // The record in flight finishes; the rest wait for the next run.
    assert_eq!(store.get(&"c_1".into()).await.unwrap().payment_status, PaymentStatus::Completed);
    assert_eq!(store.get(&"c_2".into()).await.unwrap().payment_status, PaymentStatus::Pending);
    assert_eq!(store.get(&"c_3".into()).await.unwrap().payment_status, PaymentStatus::Pending);
}

#[tokio::test]
async fn row_settled_mid_run_is_left_alone() {
    let inner = Arc::new(InMemoryContributionStore::new());
    inner.insert(contribution("c_1", "OZ-1", Duration::hours(1))).await;
    let store = FaultyStore {
        settle_first: Some(PaymentStatus::Refunded),
        ..FaultyStore::new(inner.clone())
    };

    let provider = FakeProvider::default().with("OZ-1", ProviderStatus::Completed, Some(10_300));
    let report = job(Arc::new(store), provider, Arc::new(RecordingSink::default()), WindowSettings::default())
        .run(now(), &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(report.scanned(), 1);
    assert_eq!(report.updated(), 0);
    assert_eq!(report.unresolved(), 1);
    assert_eq!(inner.get(&"c_1".into()).await.unwrap().payment_status, PaymentStatus::Refunded);
    assert!(inner.funded_checks().await.is_empty());
}

#[tokio::test]
async fn oversized_window_setting_fails_the_run_as_misconfigured() {
    let window = WindowSettings {
        lookback_hours: 10_000_000_000,
        ..WindowSettings::default()
    };
    let err = job(
        Arc::new(InMemoryContributionStore::new()),
        FakeProvider::default(),
        Arc::new(RecordingSink::default()),
        window,
    )
    .run(now(), &CancelFlag::new())
    .await
    .unwrap_err();

    assert!(matches!(err, JobError::Misconfigured(ConfigError::Invalid { .. })));
}
