mod support;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use factory_events::webhook::{
    verify_signature, DeliveryStatus, NewDelivery, NewSubscription, SenderConfig,
    WebhookDelivery, WebhookSubscription,
};
use factory_events::{
    bind_webhook_channel, timestamp, DispatcherConfig, EventSerializer, HandlerRegistry,
    InMemoryStore, InMemoryWebhookStore, OutboxDispatcher, OutboxStatus, SerializedEvent, Store,
    UnitOfWork, WebhookChannel, WebhookError, WebhookEventMap, WebhookNotifier, WebhookSender,
    WebhookStore,
};
use uuid::Uuid;

use support::{
    registry, Batch, BatchClosed, BatchOpened, BatchStatus, Endpoint, WorkCenterCode,
    BATCH_CLOSED, BATCH_OPENED,
};

const SECRET: &str = "line-3-secret";

struct Harness {
    store: Arc<InMemoryWebhookStore>,
    notifier: Arc<WebhookNotifier>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(InMemoryWebhookStore::new());
        let sender = WebhookSender::new(
            store.clone(),
            SenderConfig::default().with_base_delay(Duration::from_millis(5)),
        )
        .unwrap();
        let notifier = Arc::new(WebhookNotifier::new(
            store.clone(),
            sender,
            WebhookEventMap::new().with(BATCH_OPENED, "batch.opened"),
        ));
        Self { store, notifier }
    }

    async fn subscribe(&self, subscription: NewSubscription) -> WebhookSubscription {
        self.store.create_subscription(subscription).await.unwrap()
    }
}

fn opened(id: &str) -> SerializedEvent {
    EventSerializer::new(registry())
        .serialize(&BatchOpened {
            aggregate_id: id.to_string(),
            occurred_at: timestamp(),
            product_sku: "SKU-77".into(),
            quantity: 12,
            work_center: WorkCenterCode::new(7),
        })
        .unwrap()
}

#[tokio::test]
async fn delivery_is_signed_over_the_exact_body() {
    let endpoint = Endpoint::start().await;
    let harness = Harness::new();
    let subscription = harness
        .subscribe(NewSubscription::new(&endpoint.url, SECRET).with_events(["batch.opened"]))
        .await;

    let report = harness.notifier.notify(&opened("B-1")).await.unwrap();
    assert_eq!(report.subscriptions, 1);
    assert_eq!(report.delivered, 1);

    let requests = endpoint.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    verify_signature(&request.body, request.signature.as_deref(), SECRET).unwrap();
    assert!(verify_signature(&request.body, request.signature.as_deref(), "other").is_err());
    assert_eq!(request.event.as_deref(), Some("batch.opened"));
    assert_eq!(request.content_type.as_deref(), Some("application/json"));

    let body = request.json();
    assert_eq!(body["event"], "batch.opened");
    assert_eq!(body["data"]["aggregate_id"], "B-1");
    assert_eq!(body["data"]["work_center"], "WC-007");
    assert_eq!(body["data"]["quantity"], 12);
    assert!(body["timestamp"].is_string());

    let deliveries = harness.store.deliveries_for(subscription.id).await.unwrap();
    assert_eq!(deliveries.len(), 1);
    let delivery = &deliveries[0];
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.attempts, 1);
    assert_eq!(delivery.response_status, Some(200));
    assert_eq!(delivery.response_body.as_deref(), Some("accepted"));
    assert!(delivery.delivered_at.is_some());
    assert!(delivery.error_message.is_none());
}

#[tokio::test]
async fn persistent_server_error_exhausts_retries() {
    let endpoint = Endpoint::always_failing(500).await;
    let harness = Harness::new();
    let subscription = harness
        .subscribe(
            NewSubscription::new(&endpoint.url, SECRET)
                .with_events(["batch.opened"])
                .with_retry_count(3),
        )
        .await;

    let report = harness.notifier.notify(&opened("B-2")).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(endpoint.hits(), 4);

    let delivery = &harness.store.deliveries_for(subscription.id).await.unwrap()[0];
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.attempts, 4);
    assert_eq!(delivery.response_status, Some(500));
    assert!(delivery.delivered_at.is_none());
    assert!(delivery.error_message.as_deref().unwrap().contains("500"));
}

#[tokio::test]
async fn transient_failures_then_success() {
    let endpoint = Endpoint::failing_first(2, 503).await;
    let harness = Harness::new();
    let subscription = harness
        .subscribe(NewSubscription::new(&endpoint.url, SECRET).with_events(["batch.opened"]))
        .await;

    let report = harness.notifier.notify(&opened("B-3")).await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(endpoint.hits(), 3);

    let delivery = &harness.store.deliveries_for(subscription.id).await.unwrap()[0];
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.attempts, 3);
    assert_eq!(delivery.response_status, Some(200));

    let signatures: Vec<_> = endpoint
        .requests()
        .into_iter()
        .map(|request| request.signature)
        .collect();
    assert!(signatures.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn unreachable_endpoint_fails_without_status() {
    let harness = Harness::new();
    let subscription = harness
        .subscribe(
            NewSubscription::new(Endpoint::unreachable(), SECRET)
                .with_events(["batch.opened"])
                .with_retry_count(1)
                .with_timeout_secs(1),
        )
        .await;

    let report = harness.notifier.notify(&opened("B-4")).await.unwrap();
    assert_eq!(report.failed, 1);

    let delivery = &harness.store.deliveries_for(subscription.id).await.unwrap()[0];
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.attempts, 2);
    assert!(delivery.response_status.is_none());
    assert!(delivery.error_message.is_some());
}

#[tokio::test]
async fn inactive_and_unfiltered_subscriptions_are_skipped() {
    let endpoint = Endpoint::start().await;
    let harness = Harness::new();
    let inactive = harness
        .subscribe(
            NewSubscription::new(&endpoint.url, SECRET)
                .with_events(["batch.opened"])
                .inactive(),
        )
        .await;
    let other = harness
        .subscribe(NewSubscription::new(&endpoint.url, SECRET).with_events(["batch.closed"]))
        .await;

    let report = harness.notifier.notify(&opened("B-5")).await.unwrap();
    assert_eq!(report.subscriptions, 0);
    assert_eq!(endpoint.hits(), 0);
    for id in [inactive.id, other.id] {
        assert!(harness.store.deliveries_for(id).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn unmapped_event_is_not_exposed() {
    let endpoint = Endpoint::start().await;
    let harness = Harness::new();
    harness
        .subscribe(NewSubscription::new(&endpoint.url, SECRET).with_events(["batch.closed"]))
        .await;

    let closed = EventSerializer::new(registry())
        .serialize(&BatchClosed {
            aggregate_id: "B-6".into(),
            occurred_at: timestamp(),
            good: 10,
            scrap: 0,
            status: BatchStatus::Closed,
        })
        .unwrap();
    assert_eq!(closed.event_name, BATCH_CLOSED);

    let report = harness.notifier.notify(&closed).await.unwrap();
    assert_eq!(report.subscriptions, 0);
    assert_eq!(endpoint.hits(), 0);
}

#[tokio::test]
async fn every_subscriber_gets_its_own_signature() {
    let first = Endpoint::start().await;
    let second = Endpoint::start().await;
    let harness = Harness::new();
    harness
        .subscribe(NewSubscription::new(&first.url, "first-secret").with_events(["batch.opened"]))
        .await;
    harness
        .subscribe(NewSubscription::new(&second.url, "second-secret").with_events(["batch.opened"]))
        .await;

    let report = harness.notifier.notify(&opened("B-7")).await.unwrap();
    assert_eq!(report.delivered, 2);

    let a = &first.requests()[0];
    let b = &second.requests()[0];
    assert_eq!(a.body, b.body);
    verify_signature(&a.body, a.signature.as_deref(), "first-secret").unwrap();
    verify_signature(&b.body, b.signature.as_deref(), "second-secret").unwrap();
    assert_ne!(a.signature, b.signature);
}

#[tokio::test]
async fn invalid_subscription_is_rejected() {
    let harness = Harness::new();
    let err = harness
        .store
        .create_subscription(NewSubscription::new("ftp://plant.example/hook", SECRET))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("scheme"));
}

#[tokio::test]
async fn committed_event_reaches_the_endpoint_through_the_outbox() {
    let endpoint = Endpoint::start().await;
    let harness = Harness::new();
    harness
        .subscribe(NewSubscription::new(&endpoint.url, SECRET).with_events(["batch.opened"]))
        .await;

    let store = InMemoryStore::new();
    let registry = registry();
    let mut uow = UnitOfWork::begin(&store, registry.clone()).await.unwrap();
    uow.repository::<Batch>()
        .create(Batch::open("B-8", "SKU-8", 8, WorkCenterCode::new(12)))
        .unwrap();
    let ids = uow.commit().await.unwrap().outbox_ids;

    let handlers = bind_webhook_channel(
        HandlerRegistry::<InMemoryStore>::builder(),
        &registry,
        WebhookChannel::Outbox,
        harness.notifier.clone(),
        None,
    )
    .unwrap()
    .build();
    let dispatcher = OutboxDispatcher::new(
        store.clone(),
        registry,
        handlers,
        DispatcherConfig::default(),
    );
    let result = dispatcher.run_once().await.unwrap();
    assert_eq!(result.completed, 1);

    let record = store.outbox_record(ids[0]).await.unwrap().unwrap();
    assert_eq!(record.status, OutboxStatus::Done);
    assert_eq!(endpoint.hits(), 1);
    let body = endpoint.requests()[0].json();
    assert_eq!(body["data"]["aggregate_id"], "B-8");
    assert_eq!(body["data"]["work_center"], "WC-012");
}

/// Delegates to an in-memory store but refuses the `n`th delivery row.
struct RejectingDeliveryStore {
    inner: InMemoryWebhookStore,
    created: AtomicUsize,
    reject_at: usize,
}

impl RejectingDeliveryStore {
    fn new(reject_at: usize) -> Self {
        Self {
            inner: InMemoryWebhookStore::new(),
            created: AtomicUsize::new(0),
            reject_at,
        }
    }
}

#[async_trait]
impl WebhookStore for RejectingDeliveryStore {
    async fn create_subscription(
        &self,
        subscription: NewSubscription,
    ) -> Result<WebhookSubscription, WebhookError> {
        self.inner.create_subscription(subscription).await
    }

    async fn delete_subscription(&self, id: Uuid) -> Result<bool, WebhookError> {
        self.inner.delete_subscription(id).await
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<(), WebhookError> {
        self.inner.set_active(id, active).await
    }

    async fn set_event_filter(
        &self,
        id: Uuid,
        event_filter: BTreeSet<String>,
    ) -> Result<(), WebhookError> {
        self.inner.set_event_filter(id, event_filter).await
    }

    async fn subscription(&self, id: Uuid) -> Result<Option<WebhookSubscription>, WebhookError> {
        self.inner.subscription(id).await
    }

    async fn active_subscriptions_for(
        &self,
        event_type: &str,
    ) -> Result<Vec<WebhookSubscription>, WebhookError> {
        self.inner.active_subscriptions_for(event_type).await
    }

    async fn create_delivery(&self, delivery: NewDelivery) -> Result<WebhookDelivery, WebhookError> {
        if self.created.fetch_add(1, Ordering::SeqCst) + 1 == self.reject_at {
            return Err(WebhookError::Storage("disk full".into()));
        }
        self.inner.create_delivery(delivery).await
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<(), WebhookError> {
        self.inner.update_delivery(delivery).await
    }

    async fn delivery(&self, id: i64) -> Result<Option<WebhookDelivery>, WebhookError> {
        self.inner.delivery(id).await
    }

    async fn deliveries_for(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<WebhookDelivery>, WebhookError> {
        self.inner.deliveries_for(subscription_id).await
    }
}

#[tokio::test]
async fn interrupted_fan_out_fails_rows_already_created() {
    let endpoint = Endpoint::start().await;
    let store = Arc::new(RejectingDeliveryStore::new(2));
    let sender = WebhookSender::new(store.clone(), SenderConfig::default()).unwrap();
    let notifier = WebhookNotifier::new(
        store.clone(),
        sender,
        WebhookEventMap::new().with(BATCH_OPENED, "batch.opened"),
    );
    let mut subscriptions = Vec::new();
    for _ in 0..2 {
        let subscription = store
            .create_subscription(
                NewSubscription::new(&endpoint.url, SECRET).with_events(["batch.opened"]),
            )
            .await
            .unwrap();
        subscriptions.push(subscription.id);
    }

    let event = opened("B-9");
    let err = notifier.notify(&event).await.unwrap_err();
    assert!(err.to_string().contains("disk full"));
    assert_eq!(endpoint.hits(), 0);

    let mut abandoned = Vec::new();
    for id in &subscriptions {
        abandoned.extend(store.deliveries_for(*id).await.unwrap());
    }
    assert_eq!(abandoned.len(), 1);
    assert_eq!(abandoned[0].status, DeliveryStatus::Failed);
    assert_eq!(abandoned[0].attempts, 0);
    assert!(abandoned[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("fan-out aborted"));

    let report = notifier.notify(&event).await.unwrap();
    assert_eq!(report.delivered, 2);
    assert_eq!(endpoint.hits(), 2);
    for id in &subscriptions {
        let rows = store.deliveries_for(*id).await.unwrap();
        assert!(rows
            .iter()
            .any(|row| row.status == DeliveryStatus::Success));
        assert!(rows
            .iter()
            .all(|row| row.status != DeliveryStatus::Pending));
    }
}
