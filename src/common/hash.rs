//! Hashing utilities for shardplace
//!
//! - BLAKE3-derived 32-bit hashes for route keys
//! - Hash ranges owned by shards
//! - HRW (Highest Random Weight) ordering for policy tie-breaks

use serde::{Deserialize, Serialize};

fn hash32(data: &str) -> u32 {
    let hash = blake3::hash(data.as_bytes());
    let bytes = hash.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Hash a route key onto the 32-bit ring.
///
/// Composite keys (`prefix!id`) keep the prefix hash in the upper 16 bits so
/// every id sharing a prefix lands in the same slice of the ring.
pub fn route_hash(key: &str) -> u32 {
    match key.split_once('!') {
        Some((prefix, rest)) if !prefix.is_empty() => {
            (hash32(prefix) & 0xFFFF_0000) | (hash32(rest) & 0x0000_FFFF)
        }
        _ => hash32(key),
    }
}

/// Inclusive range on the 32-bit hash ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRange {
    pub min: u32,
    pub max: u32,
}

impl HashRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn full() -> Self {
        Self::new(0, u32::MAX)
    }

    pub fn includes(&self, hash: u32) -> bool {
        self.min <= hash && hash <= self.max
    }

    /// Split into `n` contiguous ranges covering `self`
    pub fn split(&self, n: usize) -> Vec<HashRange> {
        if n == 0 {
            return Vec::new();
        }
        let span = u64::from(self.max) - u64::from(self.min) + 1;
        let step = span / n as u64;
        let mut ranges = Vec::with_capacity(n);
        let mut start = u64::from(self.min);
        for i in 0..n {
            let end = if i == n - 1 {
                u64::from(self.max)
            } else {
                start + step - 1
            };
            ranges.push(HashRange::new(start as u32, end as u32));
            start = end + 1;
        }
        ranges
    }
}

/// HRW weight of `node` for `key`
pub fn hrw_weight(key: &str, node: &str) -> u64 {
    let combined = format!("{}{}", key, node);
    let hash = blake3::hash(combined.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(bytes)
}
