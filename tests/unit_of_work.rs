mod support;

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use factory_events::registry::dedup_key;
use factory_events::{
    timestamp, Aggregate, Event, InMemoryStore, SerializationError, Store, StoreError,
    Tracked, Transaction, UnitOfWork, UnitOfWorkError,
};
use support::{
    registry, Batch, BatchStatus, FailingCommitStore, Product, ProductRetired, WorkCenterCode,
    BATCH_CLOSED, BATCH_OPENED, PRODUCT_RETIRED,
};

async fn seed_batch(store: &InMemoryStore, id: &str) {
    let mut uow = UnitOfWork::begin(store, registry()).await.unwrap();
    uow.repository::<Batch>()
        .create(Batch::open(id, "SKU-100", 40, WorkCenterCode::new(7)))
        .unwrap();
    uow.commit().await.unwrap();
}

#[tokio::test]
async fn commit_writes_aggregate_and_outbox_together() {
    let store = InMemoryStore::new();
    let mut uow = UnitOfWork::begin(&store, registry()).await.unwrap();

    let batch = uow
        .repository::<Batch>()
        .create(Batch::open("B-1", "SKU-100", 40, WorkCenterCode::new(7)))
        .unwrap();
    batch.with(|batch| batch.close(38, 2)).unwrap();
    let occurred: Vec<_> = batch
        .with(|batch| {
            batch
                .entity()
                .pending_events()
                .iter()
                .map(|event| event.occurred_at())
                .collect()
        })
        .unwrap();

    let summary = uow.commit().await.unwrap();
    assert_eq!(summary.aggregates, 1);
    assert_eq!(summary.outbox_ids.len(), 2);

    let records = store.outbox_records(None).await.unwrap();
    let names: Vec<&str> = records.iter().map(|r| r.event_name.as_str()).collect();
    assert_eq!(names, vec![BATCH_OPENED, BATCH_CLOSED]);
    assert_eq!(
        records[0].dedup_key,
        dedup_key(BATCH_OPENED, "B-1", occurred[0])
    );
    assert!(records[0].dedup_key.ends_with('Z'));
    assert_eq!(records[0].payload["work_center"], "WC-007");
    assert_eq!(records[1].payload["status"], "closed");

    let mut tx = store.begin().await.unwrap();
    let stored = tx.load_aggregate("batch", "B-1").await.unwrap().unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.state["good"], 38);
    assert!(stored.state.get("entity").is_none());

    let guard = batch.lock().unwrap();
    assert_eq!(guard.entity().version(), 1);
    assert!(!guard.entity().has_pending());
}

#[tokio::test]
async fn repeated_get_shares_one_instance() {
    let store = InMemoryStore::new();
    seed_batch(&store, "B-2").await;

    let mut uow = UnitOfWork::begin(&store, registry()).await.unwrap();
    let first = uow.repository::<Batch>().get("B-2").await.unwrap().unwrap();
    let second = uow.repository::<Batch>().get("B-2").await.unwrap().unwrap();
    assert!(first.ptr_eq(&second));

    first.with(|batch| batch.close(40, 0)).unwrap();
    assert_eq!(second.lock().unwrap().status, BatchStatus::Closed);
    assert_eq!(uow.identity_map().instance_count("batch", "B-2"), 1);

    let summary = uow.commit().await.unwrap();
    assert_eq!(summary.outbox_ids.len(), 1);
    assert_eq!(second.lock().unwrap().entity().version(), 2);
}

#[tokio::test]
async fn missing_aggregate_loads_as_none() {
    let store = InMemoryStore::new();
    let mut uow = UnitOfWork::begin(&store, registry()).await.unwrap();
    assert!(uow.repository::<Batch>().get("nope").await.unwrap().is_none());
    assert!(uow.identity_map().is_empty());
}

#[tokio::test]
async fn events_from_merged_instances_are_all_collected() {
    let store = InMemoryStore::new();
    let mut uow = UnitOfWork::begin(&store, registry()).await.unwrap();
    let mut repo = uow.repository::<Product>();

    let first = repo
        .create(Product::register("P-1", "SKU-1", "Bracket"))
        .unwrap();
    let second = Tracked::new(Product::register("P-1", "SKU-1", "Bracket"));
    let at = timestamp();
    second
        .with(|product| {
            product.entity_mut().raise(ProductRetired {
                aggregate_id: "P-1".into(),
                occurred_at: at + ChronoDuration::milliseconds(1),
                reason: Some("superseded".into()),
            })
        })
        .unwrap();
    repo.update(&second).unwrap();
    repo.update(&first).unwrap();

    assert_eq!(uow.identity_map().len(), 1);
    assert_eq!(uow.identity_map().instance_count("product", "P-1"), 2);

    let summary = uow.commit().await.unwrap();
    let records = store.outbox_records(None).await.unwrap();
    let retired: Vec<_> = records
        .iter()
        .filter(|r| r.event_name == PRODUCT_RETIRED)
        .collect();
    assert_eq!(retired.len(), 1);
    assert!(summary.outbox_ids.len() >= 2);
    assert!(!first.lock().unwrap().entity().has_pending());
    assert!(!second.lock().unwrap().entity().has_pending());
}

#[tokio::test]
async fn identical_events_collapse_into_one_row() {
    let store = InMemoryStore::new();
    let mut uow = UnitOfWork::begin(&store, registry()).await.unwrap();
    let mut repo = uow.repository::<Product>();

    let first = repo
        .create(Product::register("P-2", "SKU-2", "Hinge"))
        .unwrap();
    let second = Tracked::new(Product::register("P-2", "SKU-2", "Hinge"));
    repo.update(&second).unwrap();

    let at = timestamp();
    for handle in [&first, &second] {
        handle
            .with(|product| {
                product.entity_mut().raise(ProductRetired {
                    aggregate_id: "P-2".into(),
                    occurred_at: at,
                    reason: None,
                })
            })
            .unwrap();
    }

    uow.commit().await.unwrap();
    let retired = store
        .outbox_records(None)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.event_name == PRODUCT_RETIRED)
        .count();
    assert_eq!(retired, 1);
}

#[tokio::test]
async fn failed_commit_leaves_nothing_and_keeps_buffers() {
    let store = FailingCommitStore::new();
    store.fail_commits(true);

    let mut uow = UnitOfWork::begin(&store, registry()).await.unwrap();
    let batch = uow
        .repository::<Batch>()
        .create(Batch::open("B-3", "SKU-300", 10, WorkCenterCode::new(2)))
        .unwrap();
    let err = uow.commit().await.unwrap_err();
    assert!(matches!(
        err,
        UnitOfWorkError::Store(StoreError::Database(_))
    ));

    assert!(store.inner().outbox_records(None).await.unwrap().is_empty());
    {
        let guard = batch.lock().unwrap();
        assert_eq!(guard.entity().pending_len(), 1);
        assert_eq!(guard.entity().version(), 0);
    }

    store.fail_commits(false);
    let mut uow = UnitOfWork::begin(&store, registry()).await.unwrap();
    uow.repository::<Batch>().update(&batch).unwrap();
    let summary = uow.commit().await.unwrap();
    assert_eq!(summary.outbox_ids.len(), 1);
    assert_eq!(store.inner().outbox_records(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn unregistered_event_fails_the_whole_commit() {
    let store = InMemoryStore::new();
    let mut uow = UnitOfWork::begin(&store, registry()).await.unwrap();
    let batch = uow
        .repository::<Batch>()
        .create(Batch::open("B-4", "SKU-400", 5, WorkCenterCode::new(3)))
        .unwrap();
    batch.with(|batch| batch.note("jammed feeder")).unwrap();

    let err = uow.commit().await.unwrap_err();
    assert!(matches!(
        err,
        UnitOfWorkError::Serialization(SerializationError::UnregisteredShape { .. })
    ));

    assert!(store.outbox_records(None).await.unwrap().is_empty());
    let mut tx = store.begin().await.unwrap();
    assert!(tx.load_aggregate("batch", "B-4").await.unwrap().is_none());
    assert_eq!(batch.lock().unwrap().entity().pending_len(), 2);
}

#[tokio::test]
async fn rollback_discards_writes_and_keeps_buffers() {
    let store = InMemoryStore::new();
    let mut uow = UnitOfWork::begin(&store, registry()).await.unwrap();
    let batch = uow
        .repository::<Batch>()
        .create(Batch::open("B-5", "SKU-500", 12, WorkCenterCode::new(4)))
        .unwrap();
    uow.rollback().await.unwrap();

    assert!(store.outbox_records(None).await.unwrap().is_empty());
    assert_eq!(batch.lock().unwrap().entity().pending_len(), 1);
}

#[tokio::test]
async fn stale_snapshot_conflicts() {
    let store = InMemoryStore::new();
    seed_batch(&store, "B-6").await;

    let mut winner = UnitOfWork::begin(&store, registry()).await.unwrap();
    let mut loser = UnitOfWork::begin(&store, registry()).await.unwrap();
    let ours = winner.repository::<Batch>().get("B-6").await.unwrap().unwrap();
    let theirs = loser.repository::<Batch>().get("B-6").await.unwrap().unwrap();

    ours.with(|batch| batch.close(12, 0)).unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    theirs.with(|batch| batch.close(11, 1)).unwrap();

    winner.commit().await.unwrap();
    let err = loser.commit().await.unwrap_err();
    assert!(matches!(
        err,
        UnitOfWorkError::Store(StoreError::ConcurrentWrite {
            expected: 1,
            actual: 2,
            ..
        })
    ));
    assert_eq!(theirs.lock().unwrap().entity().pending_len(), 1);
    assert_eq!(store.outbox_records(None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn aggregate_without_id_is_rejected() {
    let store = InMemoryStore::new();
    let mut uow = UnitOfWork::begin(&store, registry()).await.unwrap();
    let err = uow
        .repository::<Batch>()
        .create(Batch::open("", "SKU-0", 1, WorkCenterCode::new(1)))
        .unwrap_err();
    assert!(matches!(err, UnitOfWorkError::MissingId { kind: "batch" }));
}
