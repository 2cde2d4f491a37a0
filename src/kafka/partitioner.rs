use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Picks a partition for records that don't name one.
///
/// Keyed records hash with Kafka's murmur2 so they land where the Java
/// client would put them. Keyless records rotate round-robin per topic.
#[derive(Debug, Default)]
pub struct Partitioner {
    round_robin: Mutex<HashMap<String, u32>>,
}

impl Partitioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(&self, topic: &str, key: Option<&[u8]>, num_partitions: u32) -> i32 {
        if num_partitions == 0 {
            return 0;
        }

        if let Some(key) = key {
            return murmur2_partition(key, num_partitions) as i32;
        }

        let mut counters = self
            .round_robin
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let next = counters.entry(topic.to_string()).or_insert(0);
        let partition = *next % num_partitions;
        *next = next.wrapping_add(1);
        partition as i32
    }
}

/// Kafka-compatible murmur2 hash (seed `0x9747b28c`), matching the Java
/// client's `Utils.murmur2()`.
pub fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747b28c;
    const M: u32 = 0x5bd1e995;
    const R: u32 = 24;

    let len = data.len();
    let mut h: u32 = SEED ^ (len as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;

    h
}

/// `toPositive(murmur2(key)) % num_partitions`, as the Java client does it.
#[inline]
pub fn murmur2_partition(key: &[u8], num_partitions: u32) -> u32 {
    (murmur2(key) & 0x7fffffff) % num_partitions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_murmur2_known_vectors() {
        assert_eq!(murmur2(b""), 275646681);
        assert_eq!(murmur2(b"hello"), 2132663229);

        // Kafka's UtilsTest compares the signed Java int
        assert_eq!(murmur2(b"21") as i32, -973932308);
        assert_eq!(murmur2(b"foobar") as i32, -790332482);
        assert_eq!(murmur2(b"a-little-bit-long-string") as i32, -985981536);
    }

    #[test]
    fn test_keyed_records_are_sticky() {
        let partitioner = Partitioner::new();
        let first = partitioner.partition("orders", Some(b"customer-42"), 12);
        for _ in 0..10 {
            assert_eq!(partitioner.partition("orders", Some(b"customer-42"), 12), first);
        }
        assert!((0..12).contains(&first));
    }

    #[test]
    fn test_keyless_round_robin_per_topic() {
        let partitioner = Partitioner::new();
        let picks: Vec<i32> = (0..6).map(|_| partitioner.partition("a", None, 3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);

        // Other topics keep their own counter
        assert_eq!(partitioner.partition("b", None, 3), 0);
    }

    #[test]
    fn test_zero_partitions() {
        let partitioner = Partitioner::new();
        assert_eq!(partitioner.partition("a", Some(b"k"), 0), 0);
    }
}
