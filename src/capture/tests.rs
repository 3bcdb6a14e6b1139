use std::collections::BTreeMap;
use std::sync::Arc;

use apache_avro::types::Value;
use apache_avro::{Schema, Writer};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::model::{LogRecord, PartitionId};
use crate::storage::{BlobStore, InMemoryBlobStore};

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 12, 2, h, m, s).unwrap()
}

fn record(sequence_number: i64) -> LogRecord {
    let mut properties = BTreeMap::new();
    properties.insert("source".to_string(), "test".to_string());
    LogRecord {
        sequence_number,
        offset: sequence_number * 100,
        enqueued_time: at(14, 58, 24),
        partition_key: format!("sub-{}", sequence_number % 3),
        properties,
        body: Bytes::from(format!("{{\"n\":{}}}", sequence_number)),
    }
}

fn read_all(bytes: Vec<u8>) -> Vec<Result<LogRecord>> {
    CaptureReader::new(Bytes::from(bytes), CancellationToken::new())
        .unwrap()
        .collect()
}

// ============================================================================
// Reader
// ============================================================================

#[test]
fn test_reader_decodes_written_segment() {
    let records: Vec<LogRecord> = (10..=20).map(record).collect();
    let segment = write_capture(&records).unwrap();

    let decoded: Vec<LogRecord> = read_all(segment).into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(decoded, records);
}

#[test]
fn test_reader_uses_partition_key_system_property() {
    let mut keyed = record(1);
    keyed.partition_key = "fdc778a6-1281-40e4-cade-4a5fc11f5440".to_string();
    let mut unkeyed = record(2);
    unkeyed.partition_key = String::new();

    let decoded = read_all(write_capture(&[keyed, unkeyed]).unwrap());

    assert_eq!(
        decoded[0].as_ref().unwrap().partition_key,
        "fdc778a6-1281-40e4-cade-4a5fc11f5440"
    );
    assert_eq!(decoded[1].as_ref().unwrap().partition_key, "");
}

#[test]
fn test_reader_reports_missing_field_and_continues() {
    let schema = Schema::parse_str(
        r#"{
            "type": "record", "name": "EventData",
            "fields": [
                {"name": "SequenceNumber", "type": "long"},
                {"name": "EnqueuedTimeUtc", "type": "string"},
                {"name": "Body", "type": ["null", "bytes"]}
            ]
        }"#,
    )
    .unwrap();
    let mut writer = Writer::new(&schema, Vec::new());
    for n in 0..2 {
        writer
            .append(Value::Record(vec![
                ("SequenceNumber".to_string(), Value::Long(n)),
                (
                    "EnqueuedTimeUtc".to_string(),
                    Value::String("12/2/2021 2:58:24 PM".to_string()),
                ),
                ("Body".to_string(), Value::Union(0, Box::new(Value::Null))),
            ]))
            .unwrap();
    }

    let decoded = read_all(writer.into_inner().unwrap());

    assert_eq!(decoded.len(), 2);
    for item in decoded {
        let err = item.unwrap_err();
        assert!(err.is_record_level());
        assert!(err.to_string().contains("Offset"));
    }
}

#[test]
fn test_reader_rejects_garbage_container() {
    let result = CaptureReader::new(Bytes::from_static(b"definitely not avro"), CancellationToken::new());
    assert!(matches!(result, Err(CaptureError::Container(_))));
}

#[test]
fn test_reader_stops_when_cancelled() {
    let segment = write_capture(&(1..=5).map(record).collect::<Vec<_>>()).unwrap();
    let cancel = CancellationToken::new();
    let mut reader = CaptureReader::new(Bytes::from(segment), cancel.clone()).unwrap();

    assert_eq!(reader.next().unwrap().unwrap().sequence_number, 1);
    cancel.cancel();

    assert!(matches!(reader.next(), Some(Err(CaptureError::Cancelled))));
    assert!(reader.next().is_none());
}

#[test]
fn test_enqueued_time_format() {
    let parsed = parse_enqueued_time("12/2/2021 2:58:24 PM").unwrap();
    assert_eq!(parsed, at(14, 58, 24));
    assert_eq!(format_enqueued_time(&parsed), "12/2/2021 2:58:24 PM");

    assert_eq!(parse_enqueued_time("1/5/2022 12:00:01 AM").unwrap(), Utc.with_ymd_and_hms(2022, 1, 5, 0, 0, 1).unwrap());
    assert_eq!(parse_enqueued_time("2021-12-02T14:58:24Z").unwrap(), at(14, 58, 24));
    assert!(parse_enqueued_time("yesterday").is_err());
}

// ============================================================================
// Catalog
// ============================================================================

#[test]
fn test_template_prefix_and_time() {
    let template = FilenameTemplate::default()
        .for_partition("ns", "hub", &PartitionId::new("3"))
        .unwrap();

    assert_eq!(template.prefix(), "ns/hub/3/");
    assert_eq!(
        template.segment_time("ns/hub/3/2021/12/02/14/58/24.avro"),
        Some(at(14, 58, 24))
    );
    assert_eq!(template.segment_time("ns/hub/3/2021/12/02/14/58/24.json"), None);
    assert_eq!(template.segment_time("ns/hub/31/2021/12/02/14/58/24.avro"), None);
    assert_eq!(template.segment_time("ns/hub/3/2021/13/02/14/58/24.avro"), None);
}

#[test]
fn test_template_literals_are_not_patterns() {
    let template = FilenameTemplate::new("capture.{EventHub}/{PartitionId}-{Year}{Month}{Day}{Hour}")
        .for_partition("ns", "hub", &PartitionId::new("0"))
        .unwrap();

    assert_eq!(template.prefix(), "capture.hub/0-");
    assert_eq!(
        template.segment_time("capture.hub/0-2021120214.avro"),
        Some(at(14, 0, 0))
    );
    assert_eq!(template.segment_time("captureXhub/0-2021120214.avro"), None);
}

#[test]
fn test_template_rejects_repeated_placeholder() {
    let result = FilenameTemplate::new("{Year}/{Year}").for_partition("ns", "hub", &PartitionId::new("0"));
    assert!(matches!(result, Err(CaptureError::InvalidTemplate { .. })));
}

fn segments(times: &[DateTime<Utc>]) -> Vec<CaptureSegment> {
    times
        .iter()
        .enumerate()
        .map(|(i, t)| CaptureSegment {
            name: format!("segment-{}", i),
            start_time: *t,
        })
        .collect()
}

#[test]
fn test_select_includes_one_segment_before_first_fully_relevant() {
    let all = segments(&[at(10, 0, 0), at(11, 0, 0), at(12, 0, 0)]);

    let selected = select_relevant(all.clone(), Some(at(11, 0, 0)));

    assert_eq!(selected, all);
}

#[test]
fn test_select_skips_segments_well_before_resume_point() {
    let all = segments(&[at(9, 0, 0), at(10, 0, 0), at(11, 0, 0), at(12, 0, 0)]);

    let selected = select_relevant(all.clone(), Some(at(11, 30, 0)));

    assert_eq!(selected, all[2..].to_vec());
}

#[test]
fn test_select_resume_before_first_segment_returns_all() {
    let all = segments(&[at(10, 0, 0), at(11, 0, 0), at(12, 0, 0)]);
    assert_eq!(select_relevant(all.clone(), Some(at(8, 0, 0))), all);
}

#[test]
fn test_select_without_resume_or_relevant_segment_returns_all() {
    let all = segments(&[at(10, 0, 0), at(11, 0, 0)]);
    assert_eq!(select_relevant(all.clone(), None), all);
    assert_eq!(select_relevant(all.clone(), Some(at(23, 0, 0))), all);
}

#[tokio::test]
async fn test_catalog_orders_by_embedded_time() {
    let store = Arc::new(InMemoryBlobStore::new());
    for name in [
        "ns/hub/1/2021/12/02/15/00/00.avro",
        "ns/hub/1/2021/12/02/09/00/00.avro",
        "ns/hub/1/2021/12/01/23/59/59.avro",
        "ns/hub/1/readme.txt",
        "ns/hub/2/2021/12/02/10/00/00.avro",
    ] {
        store.put_if_absent(name, Bytes::new()).await.unwrap();
    }
    let catalog = CaptureCatalog::new(store, FilenameTemplate::default(), "ns", "hub");

    let listed = catalog.list_segments(&PartitionId::new("1")).await.unwrap();
    let names: Vec<&str> = listed.iter().map(|s| s.name.as_str()).collect();

    assert_eq!(
        names,
        vec![
            "ns/hub/1/2021/12/01/23/59/59.avro",
            "ns/hub/1/2021/12/02/09/00/00.avro",
            "ns/hub/1/2021/12/02/15/00/00.avro",
        ]
    );

    let relevant = catalog
        .relevant_segments(&PartitionId::new("1"), Some(at(12, 0, 0)))
        .await
        .unwrap();
    assert_eq!(relevant, listed[1..].to_vec());
}

#[tokio::test]
async fn test_catalog_opens_segment_bytes() {
    let store = Arc::new(InMemoryBlobStore::new());
    let segment = write_capture(&[record(7)]).unwrap();
    store
        .put_if_absent("ns/hub/0/2021/12/02/14/00/00.avro", Bytes::from(segment))
        .await
        .unwrap();
    let catalog = CaptureCatalog::new(store, FilenameTemplate::default(), "ns", "hub");

    let listed = catalog.list_segments(&PartitionId::new("0")).await.unwrap();
    let bytes = catalog.open_segment(&listed[0]).await.unwrap();
    let decoded: Vec<LogRecord> = CaptureReader::new(bytes, CancellationToken::new())
        .unwrap()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(decoded, vec![record(7)]);
}
