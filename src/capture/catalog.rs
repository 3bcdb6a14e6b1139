//! Capture segment discovery and selection.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use tracing::debug;

use super::{CaptureError, Result};
use crate::model::PartitionId;
use crate::storage::{open_blob, BlobStore};

/// Default capture file name layout.
pub const DEFAULT_FILE_NAME_FORMAT: &str =
    "{Namespace}/{EventHub}/{PartitionId}/{Year}/{Month}/{Day}/{Hour}/{Minute}/{Second}";

const SEGMENT_EXTENSION: &str = ".avro";

/// Time placeholders and the digit count each one matches.
const TIME_PLACEHOLDERS: [(&str, usize); 6] = [
    ("Year", 4),
    ("Month", 2),
    ("Day", 2),
    ("Hour", 2),
    ("Minute", 2),
    ("Second", 2),
];

/// Capture file name format, e.g. [`DEFAULT_FILE_NAME_FORMAT`].
#[derive(Debug, Clone)]
pub struct FilenameTemplate {
    format: String,
}

impl FilenameTemplate {
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
        }
    }

    /// Resolve the identity placeholders for one partition.
    pub fn for_partition(
        &self,
        namespace: &str,
        event_hub: &str,
        partition_id: &PartitionId,
    ) -> Result<PartitionTemplate> {
        let resolved = format!("{}{}", self.format, SEGMENT_EXTENSION)
            .replace("{Namespace}", namespace)
            .replace("{EventHub}", event_hub)
            .replace("{PartitionId}", partition_id.as_str());

        let placeholder = Regex::new(r"\{(Year|Month|Day|Hour|Minute|Second)\}")
            .map_err(|e| self.invalid(e.to_string()))?;

        let mut prefix = None;
        let mut pattern = String::from("^");
        let mut literal_start = 0;
        for found in placeholder.find_iter(&resolved) {
            let literal = &resolved[literal_start..found.start()];
            prefix.get_or_insert_with(|| literal.to_string());
            pattern.push_str(&regex::escape(literal));

            let name = &resolved[found.start() + 1..found.end() - 1];
            let digits = TIME_PLACEHOLDERS
                .iter()
                .find(|(placeholder, _)| *placeholder == name)
                .map(|(_, digits)| *digits)
                .unwrap_or(2);
            pattern.push_str(&format!(r"(?P<{}>\d{{{}}})", name, digits));
            literal_start = found.end();
        }
        pattern.push_str(&regex::escape(&resolved[literal_start..]));
        pattern.push('$');

        let pattern = Regex::new(&pattern).map_err(|e| self.invalid(e.to_string()))?;
        Ok(PartitionTemplate {
            prefix: prefix.unwrap_or(resolved),
            pattern,
        })
    }

    fn invalid(&self, reason: String) -> CaptureError {
        CaptureError::InvalidTemplate {
            format: self.format.clone(),
            reason,
        }
    }
}

impl Default for FilenameTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_FILE_NAME_FORMAT)
    }
}

/// A template resolved for one partition: a listing prefix and a matcher.
#[derive(Debug, Clone)]
pub struct PartitionTemplate {
    prefix: String,
    pattern: Regex,
}

impl PartitionTemplate {
    /// Literal portion of the name before the first time placeholder.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Start time embedded in a segment name, if the name matches.
    pub fn segment_time(&self, name: &str) -> Option<DateTime<Utc>> {
        let captures = self.pattern.captures(name)?;
        let field = |name: &str, default: u32| -> Option<u32> {
            match captures.name(name) {
                Some(m) => m.as_str().parse().ok(),
                None => Some(default),
            }
        };
        let year = captures.name("Year")?.as_str().parse().ok()?;
        NaiveDate::from_ymd_opt(year, field("Month", 1)?, field("Day", 1)?)?
            .and_hms_opt(field("Hour", 0)?, field("Minute", 0)?, field("Second", 0)?)
            .map(|t| t.and_utc())
    }
}

/// One capture segment with the start time parsed from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSegment {
    pub name: String,
    pub start_time: DateTime<Utc>,
}

/// Pick the segments needed to resume at `resume_time`.
///
/// Replay starts one segment before the first segment starting at or after
/// the resume time, since that earlier segment may still hold records
/// sequenced after the resume point. Without a resume time, or when no
/// segment starts at or after it, every segment is returned.
pub fn select_relevant(
    segments: Vec<CaptureSegment>,
    resume_time: Option<DateTime<Utc>>,
) -> Vec<CaptureSegment> {
    let Some(resume_time) = resume_time else {
        return segments;
    };
    match segments.iter().position(|s| s.start_time >= resume_time) {
        Some(first) => segments.into_iter().skip(first.saturating_sub(1)).collect(),
        None => segments,
    }
}

/// Lists and orders the capture segments of a log.
#[derive(Clone)]
pub struct CaptureCatalog {
    store: Arc<dyn BlobStore>,
    template: FilenameTemplate,
    namespace: String,
    event_hub: String,
}

impl CaptureCatalog {
    pub fn new(
        store: Arc<dyn BlobStore>,
        template: FilenameTemplate,
        namespace: impl Into<String>,
        event_hub: impl Into<String>,
    ) -> Self {
        Self {
            store,
            template,
            namespace: namespace.into(),
            event_hub: event_hub.into(),
        }
    }

    /// All segments of a partition, oldest first.
    pub async fn list_segments(&self, partition_id: &PartitionId) -> Result<Vec<CaptureSegment>> {
        let template = self
            .template
            .for_partition(&self.namespace, &self.event_hub, partition_id)?;

        let names = self.store.list(template.prefix()).await?;
        let mut segments: Vec<CaptureSegment> = names
            .into_iter()
            .filter_map(|name| match template.segment_time(&name) {
                Some(start_time) => Some(CaptureSegment { name, start_time }),
                None => {
                    debug!(partition_id = %partition_id, blob = %name, "Ignoring blob that does not match capture template");
                    None
                }
            })
            .collect();
        segments.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.name.cmp(&b.name)));
        Ok(segments)
    }

    /// Segments to replay for a resume point, oldest first.
    pub async fn relevant_segments(
        &self,
        partition_id: &PartitionId,
        resume_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<CaptureSegment>> {
        let segments = self.list_segments(partition_id).await?;
        Ok(select_relevant(segments, resume_time))
    }

    /// Raw bytes of a segment.
    pub async fn open_segment(&self, segment: &CaptureSegment) -> Result<Bytes> {
        Ok(open_blob(self.store.as_ref(), &segment.name).await?)
    }
}
