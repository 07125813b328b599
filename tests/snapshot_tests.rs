mod common;

use async_trait::async_trait;
use common::TempDb;
use eventwire::config::{DdlAuto, SnapshotterConfig};
use eventwire::error::InfraError;
use eventwire::snapshot::{
    AggregateSnapshotBuilder, EventCountSnapshotTrigger, SnapshotState, Snapshotter,
};
use eventwire::tx::UnitOfWork;
use eventwire::wiring::{Infrastructure, InfrastructureBuilder};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;

const ORDER: &str = "Order";

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct OrderState {
    events: i64,
}

/// Folds the order's stored events into a count. When gated, every build
/// waits for a permit.
struct OrderSnapshots {
    builds: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

impl OrderSnapshots {
    fn new(gate: Option<Arc<Semaphore>>) -> Arc<Self> {
        Arc::new(Self {
            builds: AtomicUsize::new(0),
            gate,
        })
    }
}

#[async_trait]
impl AggregateSnapshotBuilder for OrderSnapshots {
    fn aggregate_type(&self) -> &str {
        ORDER
    }

    async fn build_snapshot(
        &self,
        uow: &mut UnitOfWork,
        aggregate_id: &str,
    ) -> Result<Option<SnapshotState>, InfraError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        self.builds.fetch_add(1, Ordering::SeqCst);

        let (last, count): (Option<i64>, i64) = sqlx::query_as(
            "SELECT MAX(sequence_number), COUNT(*) FROM domain_event_entry \
             WHERE aggregate_identifier = ? AND type = ?",
        )
        .bind(aggregate_id)
        .bind(ORDER)
        .fetch_one(uow.connection())
        .await
        .expect("read events");

        match last {
            Some(last) => Ok(Some(SnapshotState::new(last, &OrderState { events: count })?)),
            None => Ok(None),
        }
    }
}

async fn infra(db: &TempDb, threshold: u32) -> Infrastructure {
    let mut jpa = db.jpa(DdlAuto::Create);
    jpa.non_contextual_creation = Some(true);
    InfrastructureBuilder::new(jpa)
        .snapshotter(SnapshotterConfig {
            thread_name: "order-snapshots".to_string(),
            queue_capacity: 16,
            event_count_threshold: threshold,
        })
        .build()
        .await
        .expect("wiring failed")
}

async fn append_event(conn: &mut SqliteConnection, aggregate_id: &str, sequence_number: i64) {
    sqlx::query(
        "INSERT INTO domain_event_entry \
         (event_identifier, aggregate_identifier, sequence_number, type, payload_type, payload, time_stamp) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(format!("{aggregate_id}-{sequence_number}"))
    .bind(aggregate_id)
    .bind(sequence_number)
    .bind(ORDER)
    .bind("OrderPlaced")
    .bind(b"{}".to_vec())
    .bind(chrono::Utc::now())
    .execute(conn)
    .await
    .expect("append event");
}

async fn append_events(infra: &Infrastructure, aggregate_id: &str, sequence: std::ops::RangeInclusive<i64>) {
    let mut conn = infra.data_source().acquire().await.expect("connection");
    for seq in sequence {
        append_event(&mut conn, aggregate_id, seq).await;
    }
}

async fn stored_snapshots(infra: &Infrastructure, aggregate_id: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM snapshot_event_entry WHERE aggregate_identifier = ?")
        .bind(aggregate_id)
        .fetch_one(infra.data_source().pool())
        .await
        .expect("count snapshots")
}

fn snapshotter(infra: &Infrastructure, builder: Arc<OrderSnapshots>) -> Arc<Snapshotter> {
    infra
        .snapshotter_factory()
        .create(vec![builder as Arc<dyn AggregateSnapshotBuilder>])
        .expect("snapshotter")
}

#[tokio::test]
async fn newer_snapshots_replace_older_ones() {
    let db = TempDb::new("snap-replace");
    let infra = infra(&db, 50).await;
    let builder = OrderSnapshots::new(None);
    let snapshotter = snapshotter(&infra, builder.clone());

    append_events(&infra, "o-1", 1..=3).await;
    assert!(snapshotter.schedule_snapshot(ORDER, "o-1").expect("schedule"));
    snapshotter.flush().await.expect("flush");

    let snapshot = snapshotter
        .latest_snapshot(ORDER, "o-1")
        .await
        .expect("read")
        .expect("snapshot stored");
    assert_eq!(snapshot.state.sequence_number, 3);
    assert_eq!(snapshot.state.payload_type, "OrderState");
    assert_eq!(snapshot.state.payload, serde_json::json!({ "events": 3 }));

    append_events(&infra, "o-1", 4..=5).await;
    snapshotter.schedule_snapshot(ORDER, "o-1").expect("schedule");
    snapshotter.flush().await.expect("flush");

    let snapshot = snapshotter
        .latest_snapshot(ORDER, "o-1")
        .await
        .expect("read")
        .expect("snapshot stored");
    assert_eq!(snapshot.state.sequence_number, 5);
    assert_eq!(stored_snapshots(&infra, "o-1").await, 1);
    assert_eq!(builder.builds.load(Ordering::SeqCst), 2);

    infra.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn pending_requests_are_coalesced() {
    let db = TempDb::new("snap-coalesce");
    let infra = infra(&db, 50).await;
    let gate = Arc::new(Semaphore::new(0));
    let builder = OrderSnapshots::new(Some(gate.clone()));
    let snapshotter = snapshotter(&infra, builder.clone());

    append_events(&infra, "o-1", 1..=2).await;
    append_events(&infra, "o-2", 1..=1).await;

    assert!(snapshotter.schedule_snapshot(ORDER, "o-1").expect("schedule"));
    assert!(!snapshotter.schedule_snapshot(ORDER, "o-1").expect("coalesced"));
    assert!(snapshotter.is_pending(ORDER, "o-1"));
    assert!(snapshotter.schedule_snapshot(ORDER, "o-2").expect("schedule"));

    gate.add_permits(2);
    snapshotter.flush().await.expect("flush");

    assert_eq!(builder.builds.load(Ordering::SeqCst), 2);
    assert!(!snapshotter.is_pending(ORDER, "o-1"));
    assert_eq!(stored_snapshots(&infra, "o-1").await, 1);
    assert_eq!(stored_snapshots(&infra, "o-2").await, 1);

    infra.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn aggregates_without_events_are_skipped() {
    let db = TempDb::new("snap-empty");
    let infra = infra(&db, 50).await;
    let snapshotter = snapshotter(&infra, OrderSnapshots::new(None));

    snapshotter.schedule_snapshot(ORDER, "ghost").expect("schedule");
    snapshotter.flush().await.expect("flush");
    assert_eq!(
        snapshotter.latest_snapshot(ORDER, "ghost").await.expect("read"),
        None
    );

    infra.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn unknown_aggregate_types_are_rejected() {
    let db = TempDb::new("snap-unknown");
    let infra = infra(&db, 50).await;
    let snapshotter = snapshotter(&infra, OrderSnapshots::new(None));

    let err = snapshotter.schedule_snapshot("Invoice", "i-1").unwrap_err();
    assert!(matches!(err, InfraError::UnknownAggregateType(t) if t == "Invoice"));

    infra.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn factory_creates_a_single_snapshotter() {
    let db = TempDb::new("snap-single");
    let infra = infra(&db, 50).await;
    let first = snapshotter(&infra, OrderSnapshots::new(None));

    let err = infra
        .snapshotter_factory()
        .create(vec![OrderSnapshots::new(None) as Arc<dyn AggregateSnapshotBuilder>])
        .unwrap_err();
    assert!(matches!(err, InfraError::SnapshotterAlreadyCreated));
    let current = infra.snapshotter_factory().snapshotter().expect("created");
    assert!(Arc::ptr_eq(&first, &current));

    infra.shutdown().await.expect("shutdown failed");
    assert!(matches!(
        first.schedule_snapshot(ORDER, "o-1"),
        Err(InfraError::SnapshotterStopped)
    ));
    assert!(matches!(first.flush().await, Err(InfraError::SnapshotterStopped)));
}

#[tokio::test]
async fn trigger_waits_for_the_commit() {
    let db = TempDb::new("snap-trigger");
    let infra = infra(&db, 2).await;
    let snapshotter = snapshotter(&infra, OrderSnapshots::new(None));
    let trigger = EventCountSnapshotTrigger::new(
        snapshotter.clone(),
        infra.snapshotter_factory().config().event_count_threshold,
    );
    let tm = infra.transaction_manager();

    let mut rolled_back = trigger.prepare_trigger(ORDER, "o-1");
    let mut uow = tm.begin().await.expect("begin");
    for seq in 1..=2 {
        append_event(uow.connection(), "o-1", seq).await;
        rolled_back.event_handled(Some(&mut uow)).expect("count");
    }
    assert!(!snapshotter.is_pending(ORDER, "o-1"));
    tm.rollback(uow).await.expect("rollback");
    snapshotter.flush().await.expect("flush");
    assert_eq!(snapshotter.latest_snapshot(ORDER, "o-1").await.expect("read"), None);

    let mut committed = trigger.prepare_trigger(ORDER, "o-1");
    let mut uow = tm.begin().await.expect("begin");
    for seq in 1..=3 {
        append_event(uow.connection(), "o-1", seq).await;
        committed.event_handled(Some(&mut uow)).expect("count");
    }
    assert_eq!(committed.counter(), 1);
    tm.commit(uow).await.expect("commit");
    snapshotter.flush().await.expect("flush");

    let snapshot = snapshotter
        .latest_snapshot(ORDER, "o-1")
        .await
        .expect("read")
        .expect("snapshot after commit");
    assert_eq!(snapshot.state.sequence_number, 3);

    infra.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn trigger_without_unit_of_work_schedules_immediately() {
    let db = TempDb::new("snap-trigger-now");
    let infra = infra(&db, 1).await;
    let snapshotter = snapshotter(&infra, OrderSnapshots::new(None));
    let trigger = EventCountSnapshotTrigger::new(snapshotter.clone(), 0);
    assert_eq!(trigger.threshold(), 1);

    append_events(&infra, "o-9", 1..=1).await;
    let mut counter = trigger.prepare_trigger(ORDER, "o-9");
    counter.event_handled(None).expect("schedule");
    snapshotter.flush().await.expect("flush");

    assert!(
        snapshotter
            .latest_snapshot(ORDER, "o-9")
            .await
            .expect("read")
            .is_some()
    );

    infra.shutdown().await.expect("shutdown failed");
}
