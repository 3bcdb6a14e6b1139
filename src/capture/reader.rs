//! Capture segment decoding.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;

use apache_avro::types::Value;
use apache_avro::{Reader, Schema, Writer};
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::{CaptureError, Result};
use crate::model::{LogRecord, PARTITION_KEY_PROPERTY};

/// Writer schema of capture segments.
pub const CAPTURE_SCHEMA: &str = r#"
{
    "type": "record",
    "name": "EventData",
    "namespace": "Microsoft.ServiceBus.Messaging",
    "fields": [
        {"name": "SequenceNumber", "type": "long"},
        {"name": "Offset", "type": "string"},
        {"name": "EnqueuedTimeUtc", "type": "string"},
        {"name": "SystemProperties", "type": {"type": "map", "values": ["long", "double", "string", "bytes"]}},
        {"name": "Properties", "type": {"type": "map", "values": ["long", "double", "string", "bytes", "null"]}},
        {"name": "Body", "type": ["null", "bytes"]}
    ]
}
"#;

/// Enqueued times are written as e.g. `12/2/2021 2:58:24 PM`, always UTC.
const ENQUEUED_TIME_PARSE: &str = "%m/%d/%Y %I:%M:%S %p";
const ENQUEUED_TIME_FORMAT: &str = "%-m/%-d/%Y %-I:%M:%S %p";

/// Union branch indices in the capture schema.
const STRING_BRANCH: u32 = 2;
const BYTES_BRANCH: u32 = 1;

/// Lazy decoder over one capture segment.
///
/// Yields one item per container record. Record-level problems surface as
/// [`CaptureError::MalformedRecord`] and iteration continues; a container
/// error or cancellation ends the iteration after being reported once.
pub struct CaptureReader {
    reader: Reader<'static, Cursor<Bytes>>,
    cancel: CancellationToken,
    done: bool,
}

impl CaptureReader {
    pub fn new(segment: Bytes, cancel: CancellationToken) -> Result<Self> {
        let reader = Reader::new(Cursor::new(segment))?;
        Ok(Self {
            reader,
            cancel,
            done: false,
        })
    }
}

impl Iterator for CaptureReader {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.done = true;
            return Some(Err(CaptureError::Cancelled));
        }
        match self.reader.next()? {
            Ok(value) => Some(decode_record(value)),
            Err(e) => {
                self.done = true;
                Some(Err(CaptureError::Container(e)))
            }
        }
    }
}

/// Parse a capture enqueued-time string as UTC.
pub fn parse_enqueued_time(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(value.trim(), ENQUEUED_TIME_PARSE) {
        return Ok(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| CaptureError::MalformedRecord(format!("unparseable EnqueuedTimeUtc '{}'", value)))
}

pub fn format_enqueued_time(time: &DateTime<Utc>) -> String {
    time.format(ENQUEUED_TIME_FORMAT).to_string()
}

/// Encode records as a capture segment.
pub fn write_capture(records: &[LogRecord]) -> Result<Vec<u8>> {
    let schema = Schema::parse_str(CAPTURE_SCHEMA)?;
    let mut writer = Writer::new(&schema, Vec::new());
    for record in records {
        writer.append(encode_record(record))?;
    }
    Ok(writer.into_inner()?)
}

fn encode_record(record: &LogRecord) -> Value {
    let string = |s: &str| Value::Union(STRING_BRANCH, Box::new(Value::String(s.to_string())));

    let mut system_properties = HashMap::new();
    if !record.partition_key.is_empty() {
        system_properties.insert(PARTITION_KEY_PROPERTY.to_string(), string(&record.partition_key));
    }
    let properties = record
        .properties
        .iter()
        .map(|(k, v)| (k.clone(), string(v)))
        .collect();

    Value::Record(vec![
        ("SequenceNumber".to_string(), Value::Long(record.sequence_number)),
        ("Offset".to_string(), Value::String(record.offset.to_string())),
        (
            "EnqueuedTimeUtc".to_string(),
            Value::String(format_enqueued_time(&record.enqueued_time)),
        ),
        ("SystemProperties".to_string(), Value::Map(system_properties)),
        ("Properties".to_string(), Value::Map(properties)),
        (
            "Body".to_string(),
            Value::Union(BYTES_BRANCH, Box::new(Value::Bytes(record.body.to_vec()))),
        ),
    ])
}

fn decode_record(value: Value) -> Result<LogRecord> {
    let Value::Record(fields) = value else {
        return Err(CaptureError::MalformedRecord("not a record".to_string()));
    };
    let mut fields: HashMap<String, Value> = fields.into_iter().collect();

    let sequence_number = match required(&mut fields, "SequenceNumber")? {
        Value::Long(n) => n,
        Value::Int(n) => n as i64,
        other => return Err(unexpected("SequenceNumber", &other)),
    };
    let offset = match required(&mut fields, "Offset")? {
        Value::String(s) => s
            .parse()
            .map_err(|_| CaptureError::MalformedRecord(format!("unparseable Offset '{}'", s)))?,
        Value::Long(n) => n,
        other => return Err(unexpected("Offset", &other)),
    };
    let enqueued_time = match required(&mut fields, "EnqueuedTimeUtc")? {
        Value::String(s) => parse_enqueued_time(&s)?,
        other => return Err(unexpected("EnqueuedTimeUtc", &other)),
    };
    let body = match required(&mut fields, "Body")? {
        Value::Bytes(b) => Bytes::from(b),
        Value::Null => Bytes::new(),
        other => return Err(unexpected("Body", &other)),
    };

    let system_properties = string_map(fields.remove("SystemProperties"));
    let partition_key = system_properties
        .get(PARTITION_KEY_PROPERTY)
        .cloned()
        .unwrap_or_default();

    Ok(LogRecord {
        sequence_number,
        offset,
        enqueued_time,
        partition_key,
        properties: string_map(fields.remove("Properties")),
        body,
    })
}

fn required(fields: &mut HashMap<String, Value>, name: &str) -> Result<Value> {
    fields
        .remove(name)
        .map(strip_union)
        .ok_or_else(|| CaptureError::MalformedRecord(format!("missing field {}", name)))
}

fn unexpected(name: &str, value: &Value) -> CaptureError {
    CaptureError::MalformedRecord(format!("unexpected value for {}: {:?}", name, value))
}

fn strip_union(value: Value) -> Value {
    match value {
        Value::Union(_, inner) => *inner,
        other => other,
    }
}

fn string_map(value: Option<Value>) -> BTreeMap<String, String> {
    match value.map(strip_union) {
        Some(Value::Map(entries)) => entries
            .into_iter()
            .map(|(k, v)| (k, property_string(strip_union(v))))
            .collect(),
        _ => BTreeMap::new(),
    }
}

fn property_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Long(n) => n.to_string(),
        Value::Int(n) => n.to_string(),
        Value::Double(n) => n.to_string(),
        Value::Float(n) => n.to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Bytes(b) => String::from_utf8_lossy(&b).into_owned(),
        Value::Null => String::new(),
        other => format!("{:?}", other),
    }
}
