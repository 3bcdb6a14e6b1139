use std::time::Duration;

use futures::StreamExt;

use super::*;

fn p(id: &str) -> PartitionId {
    PartitionId::new(id)
}

async fn next_event(stream: &mut LiveLogStream) -> LiveLogEvent {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("timed out waiting for live log event")
        .expect("stream ended")
}

fn sequence_of(event: LiveLogEvent) -> SequenceNumber {
    match event {
        LiveLogEvent::Record(record) => record.sequence_number,
        other => panic!("expected record, got {:?}", other),
    }
}

#[tokio::test]
async fn test_lists_numbered_partitions() {
    let log = InMemoryLog::new(3).unwrap();
    assert_eq!(log.list_partitions().await.unwrap(), vec![p("0"), p("1"), p("2")]);
}

#[tokio::test]
async fn test_publish_routes_by_partition_key() {
    let log = InMemoryLog::new(4).unwrap();
    let hasher = PartitionHasher::new(4).unwrap();
    let key = "fdc778a6-1281-40e4-cade-4a5fc11f5440";

    let (partition_id, sequence_number) = log.publish(key, "body").await.unwrap();

    assert_eq!(partition_id, PartitionId::from(hasher.assign(Some(key)) as usize));
    assert_eq!(sequence_number, 0);
    let records = log.records(&partition_id).await.unwrap();
    assert_eq!(records[0].partition_key, key);
}

#[tokio::test]
async fn test_subscribe_after_replays_backlog_then_tails() {
    let log = InMemoryLog::new(1).unwrap();
    for i in 0..5 {
        log.append(&p("0"), OutgoingMessage::new(format!("{}", i))).await.unwrap();
    }

    let mut stream = log.subscribe(&p("0"), LivePosition::After(2)).await.unwrap();
    log.append(&p("0"), OutgoingMessage::new("live")).await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(sequence_of(next_event(&mut stream).await));
    }
    assert_eq!(seen, vec![3, 4, 5]);
}

#[tokio::test]
async fn test_earliest_tracks_retention() {
    let log = InMemoryLog::new(1).unwrap();
    assert_eq!(log.earliest_available_sequence_number(&p("0")).await.unwrap(), 0);

    for _ in 0..10 {
        log.append(&p("0"), OutgoingMessage::new("x")).await.unwrap();
    }
    let purged = log.purge_before(&p("0"), 6).await.unwrap();

    assert_eq!(purged.len(), 6);
    assert_eq!(log.earliest_available_sequence_number(&p("0")).await.unwrap(), 6);

    log.purge_before(&p("0"), 100).await.unwrap();
    assert_eq!(log.earliest_available_sequence_number(&p("0")).await.unwrap(), 10);
}

#[tokio::test]
async fn test_subscribe_earliest_skips_purged_records() {
    let log = InMemoryLog::new(1).unwrap();
    for _ in 0..4 {
        log.append(&p("0"), OutgoingMessage::new("x")).await.unwrap();
    }
    log.purge_before(&p("0"), 2).await.unwrap();

    let mut stream = log.subscribe(&p("0"), LivePosition::Earliest).await.unwrap();

    assert_eq!(sequence_of(next_event(&mut stream).await), 2);
    assert_eq!(sequence_of(next_event(&mut stream).await), 3);
}

#[tokio::test]
async fn test_fault_and_revoke_reach_subscribers() {
    let log = InMemoryLog::new(1).unwrap();
    let mut stream = log.subscribe(&p("0"), LivePosition::Earliest).await.unwrap();
    assert_eq!(log.subscriber_count(&p("0")).unwrap(), 1);

    log.inject_fault(&p("0"), "connection reset").unwrap();
    log.revoke_ownership(&p("0")).unwrap();

    assert!(matches!(
        next_event(&mut stream).await,
        LiveLogEvent::Error(BusError::Transport(m)) if m == "connection reset"
    ));
    assert!(matches!(next_event(&mut stream).await, LiveLogEvent::OwnershipLost));

    drop(stream);
    assert_eq!(log.subscriber_count(&p("0")).unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_partition() {
    let log = InMemoryLog::new(2).unwrap();
    assert!(matches!(
        log.append(&p("9"), OutgoingMessage::new("x")).await,
        Err(BusError::UnknownPartition(id)) if id == p("9")
    ));
    assert!(log.subscribe(&p("9"), LivePosition::Earliest).await.is_err());
}
