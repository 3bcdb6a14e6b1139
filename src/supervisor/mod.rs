//! Partition supervision.
//!
//! The [`AggregationSupervisor`] discovers the partitions of the live log and
//! runs one independent chain per partition:
//!
//! ```text
//! PartitionPipeline ──► fold ──┬──► SnapshotScheduler
//!                              └──► UsageSubmissionPipeline
//! ```
//!
//! A chain that ends with a transport failure, ownership loss or the end of
//! its live stream is rebuilt after a backoff. Only failing to list the
//! partitions stops the supervisor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use backon::BackoffBuilder;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::billing::BillingApi;
use crate::bus::{BusError, LiveLog};
use crate::capture::{CaptureCatalog, FilenameTemplate};
use crate::config::{Config, SupervisorConfig};
use crate::fold::{run_fold, AggregationState};
use crate::model::PartitionId;
use crate::pipeline::{PartitionPipeline, PingSchedule, PipelineOutcome, Result as PipelineResult};
use crate::snapshot::{SnapshotPolicy, SnapshotScheduler, SnapshotStore};
use crate::storage::{init_storage, StorageError};
use crate::submission::UsageSubmissionPipeline;
use crate::utils::retry::restart_backoff;

mod status;

pub use status::{PartitionStatus, PartitionStatusTable};

/// How often the owned-partitions line is logged.
const STATUS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to discover partitions: {0}")]
    Discovery(BusError),

    #[error("Storage initialization failed: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Everything a partition chain needs, shared by all partitions.
struct Shared<S> {
    log: Arc<dyn LiveLog>,
    billing: Arc<dyn BillingApi>,
    snapshots: SnapshotStore<S>,
    archive: Option<CaptureCatalog>,
    policy: SnapshotPolicy,
    max_pending_writes: usize,
    batch_size: usize,
    poll_interval: Duration,
    ping: Option<PingSchedule>,
    settings: SupervisorConfig,
    status: PartitionStatusTable,
}

/// Runs one aggregation chain per partition of the live log.
pub struct AggregationSupervisor<S> {
    shared: Shared<S>,
}

impl<S: AggregationState> AggregationSupervisor<S> {
    pub fn new(
        log: Arc<dyn LiveLog>,
        snapshots: SnapshotStore<S>,
        billing: Arc<dyn BillingApi>,
    ) -> Self {
        let snapshot_defaults = crate::config::SnapshotConfig::default();
        let submission_defaults = crate::config::SubmissionConfig::default();
        Self {
            shared: Shared {
                log,
                billing,
                snapshots,
                archive: None,
                policy: snapshot_defaults.policy(),
                max_pending_writes: snapshot_defaults.max_pending_writes,
                batch_size: submission_defaults.batch_size,
                poll_interval: submission_defaults.poll_interval(),
                ping: None,
                settings: SupervisorConfig::default(),
                status: PartitionStatusTable::new(),
            },
        }
    }

    /// Build a supervisor from configuration, opening the configured stores.
    pub async fn from_config(
        config: &Config,
        log: Arc<dyn LiveLog>,
        billing: Arc<dyn BillingApi>,
    ) -> Result<Self> {
        let snapshot_blobs = init_storage(&config.snapshot.storage).await?;
        let snapshots = SnapshotStore::new(snapshot_blobs, config.snapshot.prefix.clone());

        let mut supervisor = Self::new(log, snapshots, billing)
            .with_snapshot_policy(config.snapshot.policy(), config.snapshot.max_pending_writes)
            .with_submission(config.submission.batch_size, config.submission.poll_interval())
            .with_settings(config.supervisor.clone());
        if let Some(schedule) = config.ping.schedule() {
            supervisor = supervisor.with_ping(schedule);
        }
        if config.capture.enabled {
            let capture_blobs = init_storage(&config.capture.storage).await?;
            supervisor = supervisor.with_archive(CaptureCatalog::new(
                capture_blobs,
                FilenameTemplate::new(config.capture.file_name_format.clone()),
                config.log.namespace.clone(),
                config.log.event_hub.clone(),
            ));
        }
        Ok(supervisor)
    }

    pub fn with_archive(mut self, archive: CaptureCatalog) -> Self {
        self.shared.archive = Some(archive);
        self
    }

    pub fn with_snapshot_policy(mut self, policy: SnapshotPolicy, max_pending_writes: usize) -> Self {
        self.shared.policy = policy;
        self.shared.max_pending_writes = max_pending_writes;
        self
    }

    pub fn with_submission(mut self, batch_size: usize, poll_interval: Duration) -> Self {
        self.shared.batch_size = batch_size;
        self.shared.poll_interval = poll_interval;
        self
    }

    pub fn with_ping(mut self, schedule: PingSchedule) -> Self {
        self.shared.ping = Some(schedule);
        self
    }

    pub fn with_settings(mut self, settings: SupervisorConfig) -> Self {
        self.shared.settings = settings;
        self
    }

    /// Status of every partition this supervisor has started.
    pub fn status(&self) -> PartitionStatusTable {
        self.shared.status.clone()
    }

    /// Run every partition until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let partitions = self
            .shared
            .log
            .list_partitions()
            .await
            .map_err(SupervisorError::Discovery)?;
        info!(partitions = partitions.len(), "Starting partition chains");

        let shared = Arc::new(self.shared);
        let mut chains = JoinSet::new();
        for partition_id in partitions {
            chains.spawn(supervise_partition(
                shared.clone(),
                partition_id,
                cancel.clone(),
            ));
        }

        let mut report = tokio::time::interval(STATUS_REPORT_INTERVAL);
        report.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                joined = chains.join_next() => match joined {
                    Some(Ok(())) => {}
                    Some(Err(e)) => error!(error = %e, "Partition supervisor task failed"),
                    None => break,
                },
                _ = report.tick() => {
                    let owned = shared.status.render().await;
                    info!(owned = %owned, "Partition status");
                }
            }
        }

        info!("All partition chains stopped");
        Ok(())
    }
}

/// Keep one partition's chain running until cancellation.
async fn supervise_partition<S: AggregationState>(
    shared: Arc<Shared<S>>,
    partition_id: PartitionId,
    cancel: CancellationToken,
) {
    let min_delay = shared.settings.restart_min_delay();
    let max_delay = shared.settings.restart_max_delay();
    let mut delays = restart_backoff(min_delay, max_delay).build();

    loop {
        let started = Instant::now();
        let result = run_chain(&shared, &partition_id, &cancel).await;
        if cancel.is_cancelled() {
            break;
        }
        match result {
            Ok(PipelineOutcome::Cancelled) => break,
            Ok(outcome) => {
                info!(partition_id = %partition_id, ?outcome, "Partition chain ended, restarting")
            }
            Err(e) => {
                warn!(partition_id = %partition_id, error = %e, "Partition chain failed, restarting")
            }
        }

        if started.elapsed() > max_delay {
            delays = restart_backoff(min_delay, max_delay).build();
        }
        let delay = delays.next().unwrap_or(max_delay);
        shared.status.record_restart(&partition_id).await;
        debug!(partition_id = %partition_id, ?delay, "Waiting before restart");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!(partition_id = %partition_id, "Partition supervision stopped");
}

/// Build and run one chain: pipeline, fold, snapshot and submission stages.
async fn run_chain<S: AggregationState>(
    shared: &Shared<S>,
    partition_id: &PartitionId,
    cancel: &CancellationToken,
) -> PipelineResult<PipelineOutcome> {
    let chain_cancel = cancel.child_token();
    let capacity = shared.settings.channel_capacity.max(1);
    let (events_tx, events_rx) = mpsc::channel(capacity);
    let (snapshot_tx, snapshot_rx) = mpsc::channel(capacity);
    let (submission_tx, submission_rx) = mpsc::channel(capacity);

    let fold = tokio::spawn(run_fold(
        partition_id.clone(),
        events_rx,
        vec![snapshot_tx, submission_tx],
    ));
    let snapshot = tokio::spawn(
        SnapshotScheduler::new(
            partition_id.clone(),
            shared.policy.clone(),
            shared.snapshots.clone(),
            shared.max_pending_writes,
        )
        .run(snapshot_rx, chain_cancel.clone()),
    );
    let submission = tokio::spawn(
        UsageSubmissionPipeline::new(partition_id.clone(), shared.billing.clone(), shared.log.clone())
            .with_batch_size(shared.batch_size)
            .with_poll_interval(shared.poll_interval)
            .run::<S>(submission_rx, chain_cancel.clone()),
    );

    let mut pipeline =
        PartitionPipeline::new(partition_id.clone(), shared.log.clone(), shared.snapshots.clone())
            .with_status(shared.status.clone());
    if let Some(archive) = &shared.archive {
        pipeline = pipeline.with_archive(archive.clone());
    }
    if let Some(schedule) = shared.ping {
        pipeline = pipeline.with_ping(schedule);
    }

    let result = pipeline.run(events_tx, chain_cancel.clone()).await;

    if let Err(e) = fold.await {
        warn!(partition_id = %partition_id, error = %e, "Fold task failed");
    }
    if let Err(e) = snapshot.await {
        warn!(partition_id = %partition_id, error = %e, "Snapshot task failed");
    }
    chain_cancel.cancel();
    if let Err(e) = submission.await {
        warn!(partition_id = %partition_id, error = %e, "Submission task failed");
    }

    result
}
