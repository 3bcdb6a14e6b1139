use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

use super::*;
use crate::billing::UsageRecord;
use crate::model::ObservedRecord;
use crate::storage::InMemoryBlobStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Counter {
    count: u64,
    last: Option<MessagePosition>,
}

impl AggregationState for Counter {
    fn empty(_partition_id: &PartitionId) -> Self {
        Self { count: 0, last: None }
    }

    fn apply(mut self, record: &ObservedRecord) -> Self {
        self.count += 1;
        self.last = Some(record.position());
        self
    }

    fn pending_usage(&self) -> Vec<UsageRecord> {
        Vec::new()
    }

    fn last_position(&self) -> Option<&MessagePosition> {
        self.last.as_ref()
    }
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 12, 2, 14, 0, 0).unwrap()
}

fn position(partition: &str, sequence_number: i64) -> MessagePosition {
    MessagePosition::new(
        PartitionId::new(partition),
        sequence_number,
        base_time() + ChronoDuration::seconds(sequence_number),
    )
}

fn counter_at(partition: &str, sequence_number: i64) -> Counter {
    Counter {
        count: sequence_number as u64 + 1,
        last: Some(position(partition, sequence_number)),
    }
}

fn store(blobs: Arc<InMemoryBlobStore>) -> SnapshotStore<Counter> {
    SnapshotStore::new(blobs, DEFAULT_PREFIX)
}

// ============================================================================
// Policy
// ============================================================================

#[test]
fn test_policy_snapshots_on_new_bucket() {
    let policy = SnapshotPolicy::every_sequence_numbers(100);

    assert!(!policy.should_snapshot(None, &position("0", 50)));
    assert!(!policy.should_snapshot(None, &position("0", 99)));
    assert!(policy.should_snapshot(None, &position("0", 100)));
    assert!(!policy.should_snapshot(Some(&position("0", 100)), &position("0", 150)));
    assert!(policy.should_snapshot(Some(&position("0", 150)), &position("0", 200)));
    assert!(policy.should_snapshot(Some(&position("0", 100)), &position("0", 420)));
}

#[test]
fn test_policy_never_snapshots_backwards() {
    let policy = SnapshotPolicy::every_sequence_numbers(1);

    assert!(!policy.should_snapshot(Some(&position("0", 200)), &position("0", 200)));
    assert!(!policy.should_snapshot(Some(&position("0", 200)), &position("0", 150)));
}

#[test]
fn test_policy_interval_uses_enqueued_time() {
    let policy =
        SnapshotPolicy::every_sequence_numbers(1_000_000).with_interval(Duration::from_secs(60));

    assert!(!policy.should_snapshot(Some(&position("0", 10)), &position("0", 69)));
    assert!(policy.should_snapshot(Some(&position("0", 10)), &position("0", 70)));
}

// ============================================================================
// Store
// ============================================================================

#[test]
fn test_keys_sort_by_position() {
    let store = store(Arc::new(InMemoryBlobStore::new()));

    assert_eq!(
        store.key(&PartitionId::new("3"), 42),
        "snapshots/3/00000000000000000042.json"
    );
    assert!(store.key(&PartitionId::new("3"), 9) < store.key(&PartitionId::new("3"), 10));
}

#[tokio::test]
async fn test_store_never_overwrites() {
    let blobs = Arc::new(InMemoryBlobStore::new());
    let store = store(blobs.clone());

    assert!(store.store(&counter_at("0", 100)).await.unwrap());

    let mut different = counter_at("0", 100);
    different.count = 999;
    assert!(!store.store(&different).await.unwrap());

    let loaded = store.load_latest(&PartitionId::new("0"), None).await.unwrap().unwrap();
    assert_eq!(loaded.state.count, 101);
    assert_eq!(blobs.len().await, 1);
}

#[tokio::test]
async fn test_store_rejects_state_without_position() {
    let store = store(Arc::new(InMemoryBlobStore::new()));

    let result = store.store(&Counter::empty(&PartitionId::new("0"))).await;

    assert!(matches!(result, Err(SnapshotError::NoPosition)));
}

#[tokio::test]
async fn test_load_latest_respects_upper_bound() {
    let store = store(Arc::new(InMemoryBlobStore::new()));
    for n in [100, 200, 300] {
        store.store(&counter_at("1", n)).await.unwrap();
    }
    store.store(&counter_at("10", 900)).await.unwrap();
    let partition = PartitionId::new("1");

    let latest = store.load_latest(&partition, None).await.unwrap().unwrap();
    assert_eq!(latest.position.sequence_number, 300);
    assert_eq!(latest.state, counter_at("1", 300));

    let bounded = store.load_latest(&partition, Some(250)).await.unwrap().unwrap();
    assert_eq!(bounded.position.sequence_number, 200);

    let exact = store.load_latest(&partition, Some(200)).await.unwrap().unwrap();
    assert_eq!(exact.position.sequence_number, 200);

    assert!(store.load_latest(&partition, Some(50)).await.unwrap().is_none());
    assert!(store
        .load_latest(&PartitionId::new("2"), None)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_foreign_keys_are_ignored() {
    let blobs = Arc::new(InMemoryBlobStore::new());
    blobs
        .put_if_absent("snapshots/0/readme.txt", Bytes::from_static(b"hi"))
        .await
        .unwrap();
    let store = store(blobs);
    store.store(&counter_at("0", 7)).await.unwrap();

    assert_eq!(store.positions(&PartitionId::new("0")).await.unwrap(), vec![7]);
}

// ============================================================================
// Scheduler
// ============================================================================

async fn run_scheduler(
    blobs: Arc<InMemoryBlobStore>,
    policy: SnapshotPolicy,
    max_pending_writes: usize,
    sequence_numbers: &[i64],
    cancel: CancellationToken,
) -> Option<MessagePosition> {
    let (tx, rx) = mpsc::channel(sequence_numbers.len().max(1));
    for n in sequence_numbers {
        tx.send(Arc::new(counter_at("0", *n))).await.unwrap();
    }
    drop(tx);

    SnapshotScheduler::new(PartitionId::new("0"), policy, store(blobs), max_pending_writes)
        .run(rx, cancel)
        .await
}

#[tokio::test]
async fn test_scheduler_writes_every_hundred() {
    let blobs = Arc::new(InMemoryBlobStore::new());

    let last = run_scheduler(
        blobs.clone(),
        SnapshotPolicy::every_sequence_numbers(100),
        4,
        &[50, 100, 150, 200],
        CancellationToken::new(),
    )
    .await;

    assert_eq!(last.map(|p| p.sequence_number), Some(200));
    assert_eq!(
        store(blobs).positions(&PartitionId::new("0")).await.unwrap(),
        vec![100, 200]
    );
}

#[tokio::test]
async fn test_scheduler_resumes_after_seeded_snapshot() {
    let blobs = Arc::new(InMemoryBlobStore::new());
    let (tx, rx) = mpsc::channel(4);
    for n in [120, 180, 210] {
        tx.send(Arc::new(counter_at("0", n))).await.unwrap();
    }
    drop(tx);

    SnapshotScheduler::new(
        PartitionId::new("0"),
        SnapshotPolicy::every_sequence_numbers(100),
        store(blobs.clone()),
        4,
    )
    .with_last_snapshot(Some(position("0", 100)))
    .run(rx, CancellationToken::new())
    .await;

    assert_eq!(
        store(blobs).positions(&PartitionId::new("0")).await.unwrap(),
        vec![210]
    );
}

#[tokio::test(start_paused = true)]
async fn test_slow_writer_does_not_stall_the_stream() {
    let blobs = Arc::new(InMemoryBlobStore::new());
    blobs.set_put_delay(Some(Duration::from_secs(5))).await;
    let sequence_numbers: Vec<i64> = (1..=20).collect();

    run_scheduler(
        blobs.clone(),
        SnapshotPolicy::every_sequence_numbers(1),
        1,
        &sequence_numbers,
        CancellationToken::new(),
    )
    .await;

    let written = store(blobs).positions(&PartitionId::new("0")).await.unwrap();
    assert!(!written.is_empty());
    assert!(written.len() <= 2, "expected deferred snapshots, got {:?}", written);
    assert!(written.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_cancelled_scheduler_writes_nothing() {
    let blobs = Arc::new(InMemoryBlobStore::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let last = run_scheduler(
        blobs.clone(),
        SnapshotPolicy::every_sequence_numbers(1),
        4,
        &[1, 2, 3],
        cancel,
    )
    .await;

    assert!(last.is_none());
    assert!(blobs.is_empty().await);
}

#[tokio::test]
async fn test_write_failures_are_not_fatal() {
    let blobs = Arc::new(InMemoryBlobStore::new());
    blobs.set_fail_on_put(true).await;

    let last = run_scheduler(
        blobs.clone(),
        SnapshotPolicy::every_sequence_numbers(10),
        4,
        &[10, 20],
        CancellationToken::new(),
    )
    .await;

    assert_eq!(last.map(|p| p.sequence_number), Some(20));
    assert!(blobs.is_empty().await);
}
