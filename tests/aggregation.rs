//! End-to-end tests of the aggregation engine over the in-memory log,
//! in-memory blob stores and the recording billing API.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use metering_aggregator::billing::{BillingApi, RecordingBillingApi, ResourceId};
use metering_aggregator::bus::{
    BusError, InMemoryLog, LiveLog, LivePosition, LiveLogStream, Result as BusResult,
};
use metering_aggregator::capture::{
    write_capture, CaptureCatalog, FilenameTemplate, DEFAULT_FILE_NAME_FORMAT,
};
use metering_aggregator::config::SupervisorConfig;
use metering_aggregator::fold::AggregationState;
use metering_aggregator::metering::{
    BillingDimension, MeterCollection, MeteringEvent, Plan, RenewalInterval,
    SubscriptionPurchased, UsageReported,
};
use metering_aggregator::model::{OutgoingMessage, PartitionId, SequenceNumber};
use metering_aggregator::partitioning;
use metering_aggregator::pipeline::PipelineState;
use metering_aggregator::snapshot::{SnapshotPolicy, SnapshotStore};
use metering_aggregator::storage::{BlobStore, InMemoryBlobStore};
use metering_aggregator::supervisor::{AggregationSupervisor, SupervisorError};

const PARTITIONS: i16 = 2;
const WAIT: Duration = Duration::from_secs(10);

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 12, 2, hour, minute, 0).unwrap()
}

fn purchase(subscription: &str) -> MeteringEvent {
    let mut dimensions = BTreeMap::new();
    dimensions.insert(
        "cpu".to_string(),
        BillingDimension {
            dimension_id: "cpu-hours".to_string(),
            included_quantity: 10.0,
        },
    );
    MeteringEvent::SubscriptionPurchased(SubscriptionPurchased {
        resource: ResourceId::SaasSubscription(subscription.to_string()),
        plan: Plan {
            plan_id: "gold".to_string(),
            dimensions,
        },
        subscription_start: at(14, 0),
        renewal: RenewalInterval::Monthly,
    })
}

fn usage(subscription: &str, quantity: f64, timestamp: DateTime<Utc>) -> MeteringEvent {
    MeteringEvent::UsageReported(UsageReported {
        resource: ResourceId::SaasSubscription(subscription.to_string()),
        timestamp,
        meter_name: "cpu".to_string(),
        quantity,
    })
}

async fn eventually<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

struct World {
    log: Arc<InMemoryLog>,
    api: Arc<RecordingBillingApi>,
    snapshot_blobs: Arc<InMemoryBlobStore>,
    capture_blobs: Arc<InMemoryBlobStore>,
}

impl World {
    fn new() -> Self {
        Self {
            log: Arc::new(InMemoryLog::new(PARTITIONS).unwrap()),
            api: Arc::new(RecordingBillingApi::new()),
            snapshot_blobs: Arc::new(InMemoryBlobStore::new()),
            capture_blobs: Arc::new(InMemoryBlobStore::new()),
        }
    }

    fn partition_of(subscription: &str) -> PartitionId {
        let index = partitioning::assign(Some(subscription), PARTITIONS).unwrap();
        PartitionId::from(index as usize)
    }

    fn snapshots(&self) -> SnapshotStore<MeterCollection> {
        SnapshotStore::new(self.snapshot_blobs.clone(), "snapshots")
    }

    fn supervisor(&self) -> AggregationSupervisor<MeterCollection> {
        AggregationSupervisor::new(self.log.clone(), self.snapshots(), self.api.clone())
            .with_snapshot_policy(SnapshotPolicy::every_sequence_numbers(1), 64)
            .with_submission(25, Duration::from_millis(10))
            .with_settings(SupervisorConfig {
                channel_capacity: 64,
                restart_min_delay_ms: 10,
                restart_max_delay_ms: 50,
            })
    }

    fn archived_supervisor(&self) -> AggregationSupervisor<MeterCollection> {
        self.supervisor().with_archive(CaptureCatalog::new(
            self.capture_blobs.clone(),
            FilenameTemplate::new(DEFAULT_FILE_NAME_FORMAT),
            "ns",
            "hub",
        ))
    }

    async fn append(&self, subscription: &str, time: DateTime<Utc>, event: MeteringEvent) -> SequenceNumber {
        self.log
            .append_at(
                &Self::partition_of(subscription),
                event.to_message().unwrap(),
                time,
            )
            .await
            .unwrap()
    }

    /// Purchase, 12 cpu in the 14:00 hour (2 over the included 10), then a
    /// record in the next hour that closes it.
    async fn overage_history(&self, subscription: &str) {
        self.append(subscription, at(14, 0), purchase(subscription)).await;
        self.append(subscription, at(14, 10), usage(subscription, 12.0, at(14, 10)))
            .await;
        self.append(subscription, at(15, 5), usage(subscription, 1.0, at(15, 5)))
            .await;
    }

    async fn latest_state(&self, partition_id: &PartitionId) -> Option<MeterCollection> {
        self.snapshots()
            .load_latest(partition_id, None)
            .await
            .unwrap()
            .map(|record| record.state)
    }

    async fn settled(&self, partition_id: &PartitionId, through: SequenceNumber) -> bool {
        match self.latest_state(partition_id).await {
            Some(state) => {
                state.pending_usage().is_empty()
                    && state
                        .last_position()
                        .is_some_and(|p| p.sequence_number >= through)
            }
            None => false,
        }
    }
}

fn start(supervisor: AggregationSupervisor<MeterCollection>) -> (CancellationToken, JoinHandle<Result<(), SupervisorError>>) {
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(supervisor.run(cancel.clone()));
    (cancel, handle)
}

async fn stop(cancel: CancellationToken, handle: JoinHandle<Result<(), SupervisorError>>) {
    cancel.cancel();
    tokio::time::timeout(WAIT, handle)
        .await
        .expect("supervisor did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_overage_is_billed_once_and_settled() {
    let world = World::new();
    let partition = World::partition_of("sub-1");
    world.overage_history("sub-1").await;

    let (cancel, handle) = start(world.supervisor());

    // The acknowledgement is enqueued at wall-clock time, which also closes
    // the 15:00 hour.
    eventually("both hours billed and settled", || async {
        world.api.calls().await.len() == 2 && world.settled(&partition, 4).await
    })
    .await;
    stop(cancel, handle).await;

    let calls = world.api.calls().await;
    assert_eq!(calls[0].len(), 1);
    assert_eq!(calls[0][0].quantity, 2.0);
    assert_eq!(calls[0][0].effective_start_time, at(14, 0));
    assert_eq!(calls[1].len(), 1);
    assert_eq!(calls[1][0].quantity, 1.0);
    assert_eq!(calls[1][0].effective_start_time, at(15, 0));
    assert_eq!(world.api.accepted().await.len(), 2);

    let state = world.latest_state(&partition).await.unwrap();
    assert!(state.meter("sub-1").is_some());
    assert!(state.rejected.is_empty());
}

#[tokio::test]
async fn test_restart_resumes_from_snapshot_without_rebilling() {
    let world = World::new();
    let partition = World::partition_of("sub-1");
    world.overage_history("sub-1").await;

    let (cancel, handle) = start(world.supervisor());
    eventually("first run settled", || async {
        world.api.calls().await.len() == 2 && world.settled(&partition, 4).await
    })
    .await;
    stop(cancel, handle).await;

    let next = world.append("sub-1", Utc::now(), usage("sub-1", 0.5, Utc::now())).await;
    let (cancel, handle) = start(world.supervisor());
    eventually("second run caught up", || async {
        world.settled(&partition, next).await
    })
    .await;
    stop(cancel, handle).await;

    assert_eq!(world.api.calls().await.len(), 2);
}

#[tokio::test]
async fn test_aged_out_history_is_replayed_from_the_archive() {
    let world = World::new();
    let partition = World::partition_of("sub-2");
    world.overage_history("sub-2").await;

    let records = world.log.records(&partition).await.unwrap();
    let name = format!("ns/hub/{}/2021/12/02/14/00/00.avro", partition);
    world
        .capture_blobs
        .put_if_absent(&name, Bytes::from(write_capture(&records).unwrap()))
        .await
        .unwrap();
    world.log.purge_before(&partition, 3).await.unwrap();
    assert_eq!(
        world.log.earliest_available_sequence_number(&partition).await.unwrap(),
        3
    );

    let (cancel, handle) = start(world.archived_supervisor());
    eventually("archived overage billed", || async {
        world.api.calls().await.len() == 2 && world.settled(&partition, 4).await
    })
    .await;
    stop(cancel, handle).await;

    assert_eq!(world.api.calls().await[0][0].quantity, 2.0);
}

#[tokio::test]
async fn test_failed_partition_restarts_without_affecting_others() {
    let world = World::new();
    let supervisor = world.supervisor();
    let status = supervisor.status();
    let (cancel, handle) = start(supervisor);
    let failing = PartitionId::new("0");
    let healthy = PartitionId::new("1");

    eventually("partitions tailing", || async {
        status.render().await == "0-1"
            && world.log.subscriber_count(&failing).unwrap() == 1
    })
    .await;

    world.log.inject_fault(&failing, "connection reset").unwrap();

    eventually("partition restarted", || async {
        status
            .get(&failing)
            .await
            .is_some_and(|s| s.restarts >= 1 && s.state == PipelineState::LiveTailing)
            && world.log.subscriber_count(&failing).unwrap() == 1
    })
    .await;
    assert_eq!(status.get(&healthy).await.unwrap().restarts, 0);

    world
        .log
        .append_at(&failing, purchase("sub-9").to_message().unwrap(), at(14, 0))
        .await
        .unwrap();
    let sequence_number = world
        .log
        .append_at(
            &failing,
            usage("sub-9", 1.0, at(14, 1)).to_message().unwrap(),
            at(14, 1),
        )
        .await
        .unwrap();
    eventually("restarted partition processes records", || async {
        world
            .latest_state(&failing)
            .await
            .and_then(|s| s.last_position().map(|p| p.sequence_number))
            == Some(sequence_number)
    })
    .await;

    stop(cancel, handle).await;
    assert_eq!(status.render().await, "_-_");
}

/// Live log whose partitions cannot be listed.
struct UndiscoverableLog;

#[async_trait]
impl LiveLog for UndiscoverableLog {
    async fn list_partitions(&self) -> BusResult<Vec<PartitionId>> {
        Err(BusError::Transport("unreachable".to_string()))
    }

    async fn earliest_available_sequence_number(
        &self,
        _partition_id: &PartitionId,
    ) -> BusResult<SequenceNumber> {
        Ok(0)
    }

    async fn subscribe(
        &self,
        partition_id: &PartitionId,
        _position: LivePosition,
    ) -> BusResult<LiveLogStream> {
        Err(BusError::UnknownPartition(partition_id.clone()))
    }

    async fn append(
        &self,
        partition_id: &PartitionId,
        _message: OutgoingMessage,
    ) -> BusResult<SequenceNumber> {
        Err(BusError::UnknownPartition(partition_id.clone()))
    }
}

#[tokio::test]
async fn test_discovery_failure_is_fatal() {
    let billing: Arc<dyn BillingApi> = Arc::new(RecordingBillingApi::new());
    let supervisor = AggregationSupervisor::<MeterCollection>::new(
        Arc::new(UndiscoverableLog),
        SnapshotStore::new(Arc::new(InMemoryBlobStore::new()), "snapshots"),
        billing,
    );

    let result = supervisor.run(CancellationToken::new()).await;

    assert!(matches!(result, Err(SupervisorError::Discovery(_))));
}
