//! Where a partition resumes.

use std::fmt;

use tracing::warn;

use crate::model::{MessagePosition, SequenceNumber};

/// Where a partition pipeline starts reading.
#[derive(Debug, Clone, PartialEq)]
pub enum StartingPosition {
    /// No snapshot and no archive: the oldest record the live log retains.
    Earliest,
    /// No snapshot: replay every capture segment, then tail the live log.
    ArchiveFromBeginning,
    /// The record after the snapshot has aged out of the live log: replay
    /// the archive from the snapshot position, then tail the live log.
    ArchiveFromPosition(MessagePosition),
    /// The record after the snapshot is still retained: tail the live log
    /// right after the snapshot position.
    LiveLogDirect(MessagePosition),
}

impl StartingPosition {
    pub fn replays_archive(&self) -> bool {
        matches!(
            self,
            StartingPosition::ArchiveFromBeginning | StartingPosition::ArchiveFromPosition(_)
        )
    }

    /// Position of the last record already folded, if any.
    pub fn resume_position(&self) -> Option<&MessagePosition> {
        match self {
            StartingPosition::ArchiveFromPosition(position)
            | StartingPosition::LiveLogDirect(position) => Some(position),
            StartingPosition::Earliest | StartingPosition::ArchiveFromBeginning => None,
        }
    }
}

impl fmt::Display for StartingPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartingPosition::Earliest => f.write_str("earliest"),
            StartingPosition::ArchiveFromBeginning => f.write_str("archive from beginning"),
            StartingPosition::ArchiveFromPosition(p) => write!(f, "archive after {}", p),
            StartingPosition::LiveLogDirect(p) => write!(f, "live log after {}", p),
        }
    }
}

/// Whether the record after `last_sequence_number` is gone from the live log.
///
/// Equality with the earliest retained sequence number means the next record
/// is still there.
pub fn archive_replay_required(
    last_sequence_number: SequenceNumber,
    earliest_available: SequenceNumber,
) -> bool {
    last_sequence_number.saturating_add(1) < earliest_available
}

/// Choose the starting position from the restored snapshot position, the
/// live log's earliest retained sequence number and archive availability.
pub fn decide_starting_position(
    snapshot: Option<&MessagePosition>,
    earliest_available: SequenceNumber,
    archive_available: bool,
) -> StartingPosition {
    let Some(position) = snapshot else {
        return if archive_available {
            StartingPosition::ArchiveFromBeginning
        } else {
            StartingPosition::Earliest
        };
    };

    if !archive_replay_required(position.sequence_number, earliest_available) {
        return StartingPosition::LiveLogDirect(position.clone());
    }
    if archive_available {
        return StartingPosition::ArchiveFromPosition(position.clone());
    }

    warn!(
        partition_id = %position.partition_id,
        sequence_number = position.sequence_number,
        earliest_available,
        "Records after the snapshot are no longer retained and no archive is configured"
    );
    StartingPosition::LiveLogDirect(position.clone())
}
