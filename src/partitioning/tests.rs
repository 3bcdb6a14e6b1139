use super::*;

#[test]
fn test_scenario_key_is_stable() {
    let hasher = PartitionHasher::new(4).unwrap();
    let key = Some("fdc778a6-1281-40e4-cade-4a5fc11f5440");

    let first = hasher.assign(key);
    let second = hasher.assign(key);

    assert!((0..4).contains(&first));
    assert_eq!(first, second);
}

#[test]
fn test_known_slots() {
    assert_eq!(logical_slot("fdc778a6-1281-40e4-cade-4a5fc11f5440"), 7313);
    assert_eq!(logical_slot("a"), 18463);
    assert_eq!(logical_slot("abcd"), 9977);
    assert_eq!(logical_slot("hello world!"), 26504);
    assert_eq!(logical_slot("sub-1"), 17280);
}

#[test]
fn test_known_assignments() {
    assert_eq!(assign(Some("fdc778a6-1281-40e4-cade-4a5fc11f5440"), 4), Ok(0));
    assert_eq!(assign(Some("fdc778a6-1281-40e4-cade-4a5fc11f5440"), 32), Ok(7));
    assert_eq!(assign(Some("hello world!"), 4), Ok(3));
    assert_eq!(assign(Some("hello world!"), 32), Ok(25));
}

#[test]
fn test_key_is_case_insensitive() {
    let hasher = PartitionHasher::new(32).unwrap();
    assert_eq!(
        hasher.assign(Some("FDC778A6-1281-40E4-CADE-4A5FC11F5440")),
        hasher.assign(Some("fdc778a6-1281-40e4-cade-4a5fc11f5440")),
    );
}

#[test]
fn test_expanding_upper_case_is_kept_and_masked() {
    assert_eq!(key_bytes("straße"), b"STRA?E".to_vec());
    assert_eq!(key_bytes("ǆx"), b"?X".to_vec());

    let (hash1, hash2) = compute_hash(b"STRA?E", 0, 0);
    let expected = ((hash1 ^ hash2) % LOGICAL_SLOT_COUNT as u32) as i16;
    assert_eq!(logical_slot("straße"), expected);
}

#[test]
fn test_every_tail_length_hashes() {
    let key = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let slots: Vec<i16> = (1..=key.len()).map(|n| logical_slot(&key[..n])).collect();
    for slot in &slots {
        assert!((0..LOGICAL_SLOT_COUNT).contains(slot));
    }
}

#[test]
fn test_missing_and_empty_keys_map_to_slot_zero() {
    let hasher = PartitionHasher::new(8).unwrap();
    assert_eq!(logical_slot(""), 0);
    assert_eq!(hasher.assign(None), 0);
    assert_eq!(hasher.assign(Some("")), 0);
}

#[test]
fn test_range_boundaries_split_evenly() {
    assert_eq!(range_boundaries(1), vec![32766]);
    assert_eq!(range_boundaries(4), vec![8191, 16383, 24575, 32766]);
    // 32767 = 3 * 10922 + 1, so the first range gets the extra slot.
    assert_eq!(range_boundaries(3), vec![10922, 21844, 32766]);
}

#[test]
fn test_find_partition_edges() {
    let ranges = range_boundaries(4);
    assert_eq!(find_partition(&ranges, 0), 0);
    assert_eq!(find_partition(&ranges, 8191), 0);
    assert_eq!(find_partition(&ranges, 8192), 1);
    assert_eq!(find_partition(&ranges, 32766), 3);
}

#[test]
fn test_invalid_partition_count() {
    assert_eq!(
        PartitionHasher::new(0).unwrap_err(),
        PartitionHashError::InvalidPartitionCount(0)
    );
    assert!(PartitionHasher::new(-3).is_err());
}

#[test]
fn test_random_keys_distribute_evenly() {
    const KEYS: usize = 100_000;

    for partition_count in [4i16, 32] {
        let hasher = PartitionHasher::new(partition_count).unwrap();
        let mut counts = vec![0usize; partition_count as usize];
        for _ in 0..KEYS {
            let key = uuid::Uuid::new_v4().to_string();
            counts[hasher.assign(Some(&key)) as usize] += 1;
        }

        let expected = KEYS as f64 / partition_count as f64;
        for (partition, count) in counts.iter().enumerate() {
            let deviation = (*count as f64 - expected).abs() / expected;
            assert!(
                deviation <= 0.10,
                "partition {} of {} got {} keys (expected ~{})",
                partition,
                partition_count,
                count,
                expected
            );
        }
    }
}
