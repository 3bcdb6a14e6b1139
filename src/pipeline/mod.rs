//! Per-partition pipeline.
//!
//! A [`PartitionPipeline`] turns one partition of the live log, preceded by
//! whatever the capture archive has to contribute, into a single ordered
//! stream of [`PartitionEvent`]s for the fold:
//!
//! ```text
//! Initializing ──► ReplayingArchive ──► LiveTailing ──► Closing ──► Closed
//!      │                                    ▲
//!      └────────────────────────────────────┘          (any) ──► Failed
//! ```
//!
//! The fold sees strictly increasing sequence numbers: every record at or
//! below the last forwarded one is dropped, whichever source it came from.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, LiveLog, LiveLogEvent, LivePosition};
use crate::capture::{CaptureCatalog, CaptureError, CaptureReader, CaptureSegment};
use crate::fold::AggregationState;
use crate::model::{
    CloseReason, EventSource, LogRecord, ObservedRecord, PartitionEvent, PartitionId,
    SequenceNumber,
};
use crate::snapshot::{SnapshotError, SnapshotStore};
use crate::supervisor::PartitionStatusTable;

mod ping;
mod starting;

pub use ping::{run_ping_task, PingSchedule};
pub use starting::{archive_replay_required, decide_starting_position, StartingPosition};

/// Decoded records buffered between the blocking segment decoder and the pipeline.
const DECODE_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Live log error: {0}")]
    Transport(#[from] BusError),

    #[error("Capture archive error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Downstream stages closed")]
    DownstreamClosed,
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Lifecycle state of a partition pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Initializing,
    ReplayingArchive,
    LiveTailing,
    Closing,
    Closed,
    Failed,
}

impl PipelineState {
    /// Whether the partition is currently owned and being processed.
    pub fn is_active(&self) -> bool {
        !matches!(self, PipelineState::Closed | PipelineState::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Initializing => "initializing",
            PipelineState::ReplayingArchive => "replaying archive",
            PipelineState::LiveTailing => "live tailing",
            PipelineState::Closing => "closing",
            PipelineState::Closed => "closed",
            PipelineState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How a pipeline run ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Cancelled,
    OwnershipLost,
    StreamEnded,
}

impl From<PipelineOutcome> for CloseReason {
    fn from(outcome: PipelineOutcome) -> Self {
        match outcome {
            PipelineOutcome::Cancelled => CloseReason::Shutdown,
            PipelineOutcome::OwnershipLost => CloseReason::OwnershipLost,
            PipelineOutcome::StreamEnded => CloseReason::StreamEnded,
        }
    }
}

/// Whether a record still has to be folded after `resume`.
pub fn is_relevant(resume: Option<SequenceNumber>, sequence_number: SequenceNumber) -> bool {
    resume.map_or(true, |last| last < sequence_number)
}

/// Control flow inside a run.
enum Flow {
    Continue,
    Stop(PipelineOutcome),
}

/// Context of one partition: its collaborators and its progress.
pub struct PartitionPipeline<S> {
    partition_id: PartitionId,
    log: Arc<dyn LiveLog>,
    snapshots: SnapshotStore<S>,
    archive: Option<CaptureCatalog>,
    ping: Option<PingSchedule>,
    status: Option<PartitionStatusTable>,
    state: PipelineState,
    last_sequence_number: Option<SequenceNumber>,
}

impl<S: AggregationState> PartitionPipeline<S> {
    pub fn new(partition_id: PartitionId, log: Arc<dyn LiveLog>, snapshots: SnapshotStore<S>) -> Self {
        Self {
            partition_id,
            log,
            snapshots,
            archive: None,
            ping: None,
            status: None,
            state: PipelineState::Initializing,
            last_sequence_number: None,
        }
    }

    pub fn with_archive(mut self, archive: CaptureCatalog) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_ping(mut self, schedule: PingSchedule) -> Self {
        self.ping = Some(schedule);
        self
    }

    pub fn with_status(mut self, status: PartitionStatusTable) -> Self {
        self.status = Some(status);
        self
    }

    pub fn partition_id(&self) -> &PartitionId {
        &self.partition_id
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    async fn transition(&mut self, state: PipelineState) {
        debug!(partition_id = %self.partition_id, from = %self.state, to = %state, "Pipeline state change");
        self.state = state;
        if let Some(status) = &self.status {
            status
                .update(&self.partition_id, state, self.last_sequence_number)
                .await;
        }
    }

    /// Process the partition until cancellation, ownership loss, the end of
    /// the live stream or a transport failure.
    ///
    /// Events are sent to `events` in order; the last one is always
    /// `Closing`.
    pub async fn run(
        mut self,
        events: mpsc::Sender<PartitionEvent<S>>,
        cancel: CancellationToken,
    ) -> Result<PipelineOutcome> {
        info!(partition_id = %self.partition_id, "Partition pipeline starting");
        self.transition(PipelineState::Initializing).await;

        let result = self.drive(&events, &cancel).await;

        let reason = match &result {
            Ok(outcome) => CloseReason::from(*outcome),
            Err(_) => CloseReason::Failed,
        };
        self.transition(PipelineState::Closing).await;
        let closing = PartitionEvent::Closing {
            partition_id: self.partition_id.clone(),
            reason,
        };
        let delivered = if cancel.is_cancelled() {
            events.try_send(closing).is_ok()
        } else {
            matches!(self.forward(&events, &cancel, closing).await, Ok(Flow::Continue))
        };
        if !delivered {
            debug!(partition_id = %self.partition_id, "Closing notification not delivered");
        }

        match &result {
            Ok(outcome) => {
                info!(partition_id = %self.partition_id, ?outcome, last_sequence_number = ?self.last_sequence_number, "Partition pipeline closed");
                self.transition(PipelineState::Closed).await;
            }
            Err(e) => {
                error!(partition_id = %self.partition_id, last_sequence_number = ?self.last_sequence_number, error = %e, "Partition pipeline failed");
                self.transition(PipelineState::Failed).await;
            }
        }
        result
    }

    async fn drive(
        &mut self,
        events: &mpsc::Sender<PartitionEvent<S>>,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        // Initializing
        let snapshot = self.snapshots.load_latest(&self.partition_id, None).await?;
        let earliest_available = self
            .log
            .earliest_available_sequence_number(&self.partition_id)
            .await?;
        let starting_position = decide_starting_position(
            snapshot.as_ref().map(|s| &s.position),
            earliest_available,
            self.archive.is_some(),
        );
        info!(
            partition_id = %self.partition_id,
            starting_position = %starting_position,
            earliest_available,
            "Resolved starting position"
        );

        let resume = starting_position.resume_position();
        self.last_sequence_number = resume.map(|p| p.sequence_number);
        let resume_time = resume.map(|p| p.enqueued_time);
        let initializing = PartitionEvent::Initializing {
            partition_id: self.partition_id.clone(),
            starting_position: starting_position.clone(),
            initial_state: snapshot.map(|s| s.state),
        };
        if let Flow::Stop(outcome) = self.forward(events, cancel, initializing).await? {
            return Ok(outcome);
        }

        // ReplayingArchive
        if starting_position.replays_archive() {
            if let Some(archive) = self.archive.clone() {
                self.transition(PipelineState::ReplayingArchive).await;
                if let Flow::Stop(outcome) =
                    self.replay_archive(&archive, resume_time, events, cancel).await?
                {
                    return Ok(outcome);
                }
            }
        }
        if cancel.is_cancelled() {
            return Ok(PipelineOutcome::Cancelled);
        }

        // LiveTailing
        self.transition(PipelineState::LiveTailing).await;
        let ping_cancel = cancel.child_token();
        let ping = self.ping.map(|schedule| {
            tokio::spawn(run_ping_task(
                self.log.clone(),
                self.partition_id.clone(),
                schedule,
                ping_cancel.clone(),
            ))
        });

        let result = self.tail_live_log(events, cancel).await;

        ping_cancel.cancel();
        if let Some(ping) = ping {
            if let Err(e) = ping.await {
                warn!(partition_id = %self.partition_id, error = %e, "Ping task failed");
            }
        }
        result
    }

    async fn replay_archive(
        &mut self,
        archive: &CaptureCatalog,
        resume_time: Option<DateTime<Utc>>,
        events: &mpsc::Sender<PartitionEvent<S>>,
        cancel: &CancellationToken,
    ) -> Result<Flow> {
        let segments = archive
            .relevant_segments(&self.partition_id, resume_time)
            .await?;
        info!(partition_id = %self.partition_id, segments = segments.len(), "Replaying capture archive");

        for segment in segments {
            if cancel.is_cancelled() {
                return Ok(Flow::Stop(PipelineOutcome::Cancelled));
            }
            let data = archive.open_segment(&segment).await?;
            if let Flow::Stop(outcome) = self.replay_segment(&segment, data, events, cancel).await? {
                return Ok(Flow::Stop(outcome));
            }
        }

        debug!(partition_id = %self.partition_id, last_sequence_number = ?self.last_sequence_number, "Archive replay finished");
        Ok(Flow::Continue)
    }

    async fn replay_segment(
        &mut self,
        segment: &CaptureSegment,
        data: Bytes,
        events: &mpsc::Sender<PartitionEvent<S>>,
        cancel: &CancellationToken,
    ) -> Result<Flow> {
        let (tx, mut rx) = mpsc::channel(DECODE_BUFFER);
        let decode_cancel = cancel.child_token();
        let decoder = tokio::task::spawn_blocking(move || decode_segment(data, decode_cancel, tx));

        let mut replayed = 0usize;
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Flow::Stop(PipelineOutcome::Cancelled)),
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            match item {
                Ok(record) => {
                    let source = EventSource::Capture {
                        segment: segment.name.clone(),
                    };
                    match self.observe(record, source) {
                        Some(event) => {
                            replayed += 1;
                            if let Flow::Stop(outcome) = self.forward(events, cancel, event).await? {
                                return Ok(Flow::Stop(outcome));
                            }
                        }
                        None => continue,
                    }
                }
                Err(e) if e.is_record_level() => {
                    warn!(partition_id = %self.partition_id, segment = %segment.name, error = %e, "Skipping malformed capture record");
                }
                Err(CaptureError::Cancelled) => {
                    return Ok(Flow::Stop(PipelineOutcome::Cancelled));
                }
                Err(e) => {
                    warn!(partition_id = %self.partition_id, segment = %segment.name, error = %e, "Abandoning capture segment");
                    break;
                }
            }
        }

        drop(rx);
        if let Err(e) = decoder.await {
            warn!(partition_id = %self.partition_id, segment = %segment.name, error = %e, "Segment decoder failed");
        }
        debug!(partition_id = %self.partition_id, segment = %segment.name, replayed, "Segment replayed");
        Ok(Flow::Continue)
    }

    async fn tail_live_log(
        &mut self,
        events: &mpsc::Sender<PartitionEvent<S>>,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        let position = match self.last_sequence_number {
            Some(n) => LivePosition::After(n),
            None => LivePosition::Earliest,
        };
        let mut stream = self.log.subscribe(&self.partition_id, position).await?;
        info!(partition_id = %self.partition_id, ?position, "Tailing live log");

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(PipelineOutcome::Cancelled),
                event = stream.next() => event,
            };

            match event {
                Some(LiveLogEvent::Record(record)) => {
                    if let Some(event) = self.observe(record, EventSource::LiveLog) {
                        if let Flow::Stop(outcome) = self.forward(events, cancel, event).await? {
                            return Ok(outcome);
                        }
                    }
                }
                Some(LiveLogEvent::Error(e)) => {
                    let notification = PartitionEvent::Error {
                        partition_id: self.partition_id.clone(),
                        message: e.to_string(),
                    };
                    // The pipeline is failing either way.
                    let _ = self.forward(events, cancel, notification).await;
                    return Err(PipelineError::Transport(e));
                }
                Some(LiveLogEvent::OwnershipLost) => {
                    info!(partition_id = %self.partition_id, "Partition ownership lost");
                    return Ok(PipelineOutcome::OwnershipLost);
                }
                None => {
                    info!(partition_id = %self.partition_id, "Live log subscription ended");
                    return Ok(PipelineOutcome::StreamEnded);
                }
            }
        }
    }

    /// Filter a record against the last forwarded one and wrap it for the fold.
    fn observe(&mut self, record: LogRecord, source: EventSource) -> Option<PartitionEvent<S>> {
        let sequence_number = record.sequence_number;
        if !is_relevant(self.last_sequence_number, sequence_number) {
            debug!(partition_id = %self.partition_id, sequence_number, %source, "Skipping already applied record");
            return None;
        }
        if let Some(last) = self.last_sequence_number {
            if sequence_number != last + 1 {
                warn!(
                    partition_id = %self.partition_id,
                    last_sequence_number = last,
                    sequence_number,
                    %source,
                    "Gap in partition sequence numbers"
                );
            }
        }
        self.last_sequence_number = Some(sequence_number);
        Some(PartitionEvent::Record(ObservedRecord {
            partition_id: self.partition_id.clone(),
            record,
            source,
        }))
    }

    async fn forward(
        &self,
        events: &mpsc::Sender<PartitionEvent<S>>,
        cancel: &CancellationToken,
        event: PartitionEvent<S>,
    ) -> Result<Flow> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(Flow::Stop(PipelineOutcome::Cancelled)),
            sent = events.send(event) => match sent {
                Ok(()) => Ok(Flow::Continue),
                Err(_) => Err(PipelineError::DownstreamClosed),
            },
        }
    }
}

/// Decode a segment on a blocking thread, handing items to the pipeline.
fn decode_segment(
    data: Bytes,
    cancel: CancellationToken,
    items: mpsc::Sender<std::result::Result<LogRecord, CaptureError>>,
) {
    let reader = match CaptureReader::new(data, cancel) {
        Ok(reader) => reader,
        Err(e) => {
            let _ = items.blocking_send(Err(e));
            return;
        }
    };
    for item in reader {
        if items.blocking_send(item).is_err() {
            break;
        }
    }
}
