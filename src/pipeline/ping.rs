//! Liveness pings.
//!
//! While a partition is tailed, a ping is appended to it when processing
//! starts and then once an hour, so the fold clock moves and closes hours
//! even on idle partitions.

use std::sync::Arc;

use chrono::{DateTime, Duration, DurationRound, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::LiveLog;
use crate::metering::{MeteringEvent, PingReason};
use crate::model::PartitionId;

/// Hourly ping at a fixed minute of the hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingSchedule {
    minute_offset: u32,
}

impl PingSchedule {
    pub fn new(minute_offset: u32) -> Self {
        Self {
            minute_offset: minute_offset % 60,
        }
    }

    pub fn minute_offset(&self) -> u32 {
        self.minute_offset
    }

    /// First scheduled ping strictly after `now`.
    pub fn next_ping_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let hour = now.duration_trunc(Duration::hours(1)).unwrap_or(now);
        let candidate = hour + Duration::minutes(i64::from(self.minute_offset));
        if candidate > now {
            candidate
        } else {
            candidate + Duration::hours(1)
        }
    }
}

impl Default for PingSchedule {
    fn default() -> Self {
        Self::new(0)
    }
}

async fn send_ping(log: &dyn LiveLog, partition_id: &PartitionId, reason: PingReason) {
    let event = MeteringEvent::ping(partition_id, reason, Utc::now());
    let message = match event.to_message() {
        Ok(message) => message,
        Err(e) => {
            warn!(partition_id = %partition_id, error = %e, "Failed to encode ping");
            return;
        }
    };
    match log.append(partition_id, message).await {
        Ok(sequence_number) => {
            debug!(partition_id = %partition_id, ?reason, sequence_number, "Ping sent")
        }
        Err(e) => warn!(partition_id = %partition_id, ?reason, error = %e, "Failed to send ping"),
    }
}

/// Send pings for a partition until `cancel` fires.
pub async fn run_ping_task(
    log: Arc<dyn LiveLog>,
    partition_id: PartitionId,
    schedule: PingSchedule,
    cancel: CancellationToken,
) {
    send_ping(log.as_ref(), &partition_id, PingReason::ProcessingStarting).await;

    loop {
        let now = Utc::now();
        let wait = (schedule.next_ping_after(now) - now)
            .to_std()
            .unwrap_or_default();

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {
                send_ping(log.as_ref(), &partition_id, PingReason::TopOfHour).await;
            }
        }
    }

    debug!(partition_id = %partition_id, "Ping task stopped");
}
