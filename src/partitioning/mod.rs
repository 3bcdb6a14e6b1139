//! Partition key hashing.
//!
//! Keys are hashed into a fixed-width logical slot space `[0, 32767)` first,
//! then mapped onto physical partitions through a range table. Changing the
//! partition count only rebuilds the range table; the slot of a key never
//! changes.

use thiserror::Error;

/// Size of the logical slot space.
pub const LOGICAL_SLOT_COUNT: i16 = i16::MAX;

const SEED: u32 = 0xdead_beef;

/// Errors raised when building a hasher.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartitionHashError {
    #[error("Partition count must be positive, got {0}")]
    InvalidPartitionCount(i16),
}

/// Maps partition keys onto a fixed number of partitions.
#[derive(Debug, Clone)]
pub struct PartitionHasher {
    /// Inclusive upper slot boundary of each partition.
    ranges: Vec<i16>,
}

impl PartitionHasher {
    pub fn new(partition_count: i16) -> Result<Self, PartitionHashError> {
        if partition_count <= 0 {
            return Err(PartitionHashError::InvalidPartitionCount(partition_count));
        }
        Ok(Self {
            ranges: range_boundaries(partition_count),
        })
    }

    pub fn partition_count(&self) -> i16 {
        self.ranges.len() as i16
    }

    /// Partition index for `key`. A missing key maps to slot 0.
    pub fn assign(&self, key: Option<&str>) -> i16 {
        let slot = key.map(logical_slot).unwrap_or(0);
        find_partition(&self.ranges, slot)
    }
}

/// One-shot assignment for callers that do not keep a hasher around.
pub fn assign(key: Option<&str>, partition_count: i16) -> Result<i16, PartitionHashError> {
    Ok(PartitionHasher::new(partition_count)?.assign(key))
}

/// Logical slot of a key in `[0, 32767)`.
pub fn logical_slot(key: &str) -> i16 {
    let (hash1, hash2) = compute_hash(&key_bytes(key), 0, 0);
    ((hash1 ^ hash2) % LOGICAL_SLOT_COUNT as u32) as i16
}

/// Upper-cased ASCII bytes of the key; anything outside ASCII becomes `?`.
///
/// Upper-casing is one char to one char: characters whose upper case
/// expands (such as `ß`) are kept as they are.
fn key_bytes(key: &str) -> Vec<u8> {
    key.chars()
        .map(simple_uppercase)
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect()
}

fn simple_uppercase(c: char) -> char {
    let mut upper = c.to_uppercase();
    match (upper.next(), upper.next()) {
        (Some(single), None) => single,
        _ => c,
    }
}

fn range_boundaries(partition_count: i16) -> Vec<i16> {
    let count = LOGICAL_SLOT_COUNT as i32;
    let partitions = partition_count as i32;
    let base = count / partitions;
    let remaining = count - partitions * base;

    let mut ranges = Vec::with_capacity(partition_count as usize);
    let mut end = -1i32;
    for i in 0..partitions - 1 {
        let size = if i < remaining { base + 1 } else { base };
        end = (end + size).min(count - 1);
        ranges.push(end as i16);
    }
    ranges.push((count - 1) as i16);
    ranges
}

fn find_partition(ranges: &[i16], slot: i16) -> i16 {
    let mut lower = 0usize;
    let mut upper = ranges.len() - 1;
    while lower < upper {
        let middle = (lower + upper) >> 1;
        if slot > ranges[middle] {
            lower = middle + 1;
        } else {
            upper = middle;
        }
    }
    lower as i16
}

/// Three-word Jenkins hash returning the `(c, b)` accumulators.
fn compute_hash(data: &[u8], seed1: u32, seed2: u32) -> (u32, u32) {
    let initial = SEED
        .wrapping_add(data.len() as u32)
        .wrapping_add(seed1);
    let mut a = initial;
    let mut b = initial;
    let mut c = initial.wrapping_add(seed2);

    let mut index = 0usize;
    let mut size = data.len();
    while size > 12 {
        a = a.wrapping_add(read_u32(data, index));
        b = b.wrapping_add(read_u32(data, index + 4));
        c = c.wrapping_add(read_u32(data, index + 8));
        mix(&mut a, &mut b, &mut c);
        index += 12;
        size -= 12;
    }

    let tail = &data[index..];
    let byte = |i: usize| tail[i] as u32;
    match size {
        12 => {
            c = c.wrapping_add(read_u32(tail, 8));
            b = b.wrapping_add(read_u32(tail, 4));
            a = a.wrapping_add(read_u32(tail, 0));
        }
        9..=11 => {
            if size == 11 {
                c = c.wrapping_add(byte(10) << 16);
            }
            if size >= 10 {
                c = c.wrapping_add(byte(9) << 8);
            }
            c = c.wrapping_add(byte(8));
            b = b.wrapping_add(read_u32(tail, 4));
            a = a.wrapping_add(read_u32(tail, 0));
        }
        8 => {
            b = b.wrapping_add(read_u32(tail, 4));
            a = a.wrapping_add(read_u32(tail, 0));
        }
        5..=7 => {
            if size == 7 {
                b = b.wrapping_add(byte(6) << 16);
            }
            if size >= 6 {
                b = b.wrapping_add(byte(5) << 8);
            }
            b = b.wrapping_add(byte(4));
            a = a.wrapping_add(read_u32(tail, 0));
        }
        4 => {
            a = a.wrapping_add(read_u32(tail, 0));
        }
        1..=3 => {
            if size == 3 {
                a = a.wrapping_add(byte(2) << 16);
            }
            if size >= 2 {
                a = a.wrapping_add(byte(1) << 8);
            }
            a = a.wrapping_add(byte(0));
        }
        // Empty input skips the final mix.
        _ => return (c, b),
    }

    final_mix(&mut a, &mut b, &mut c);
    (c, b)
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(4);
    *c = c.wrapping_add(*b);

    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(6);
    *a = a.wrapping_add(*c);

    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(8);
    *b = b.wrapping_add(*a);

    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(16);
    *c = c.wrapping_add(*b);

    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(19);
    *a = a.wrapping_add(*c);

    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(4);
    *b = b.wrapping_add(*a);
}

fn final_mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(14));

    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(11));

    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(25));

    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(16));

    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(4));

    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(14));

    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(24));
}

#[cfg(test)]
mod tests;
