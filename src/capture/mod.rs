//! Capture archive access.
//!
//! Records that have aged out of the live log are kept in capture segments:
//! Avro object-container files, one per partition per time window, named by
//! a configurable template that embeds the window's start time.
//!
//! - [`CaptureReader`] decodes one segment into [`LogRecord`]s.
//! - [`CaptureCatalog`] finds and orders the segments for a partition and
//!   decides which of them a resume point needs.
//!
//! [`LogRecord`]: crate::model::LogRecord

use thiserror::Error;

use crate::storage::StorageError;

mod catalog;
mod reader;

pub use catalog::{
    select_relevant, CaptureCatalog, CaptureSegment, FilenameTemplate, PartitionTemplate,
    DEFAULT_FILE_NAME_FORMAT,
};
pub use reader::{
    format_enqueued_time, parse_enqueued_time, write_capture, CaptureReader, CAPTURE_SCHEMA,
};

/// Errors raised while reading the capture archive.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// A single record lacks a required field or has an unusable value.
    /// The record is skipped; the rest of the segment is still readable.
    #[error("Malformed capture record: {0}")]
    MalformedRecord(String),

    /// The container itself could not be decoded. The segment is abandoned.
    #[error("Malformed capture container: {0}")]
    Container(#[from] apache_avro::Error),

    #[error("Capture read cancelled")]
    Cancelled,

    #[error("Invalid capture file name format '{format}': {reason}")]
    InvalidTemplate { format: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl CaptureError {
    /// Whether the error only affects one record.
    pub fn is_record_level(&self) -> bool {
        matches!(self, CaptureError::MalformedRecord(_))
    }
}

pub type Result<T> = std::result::Result<T, CaptureError>;

#[cfg(test)]
mod tests;
