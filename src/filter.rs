//! Per-table bloom filter.
//!
//! Sized from the expected key count and a target false-positive rate.
//! Membership hashing is double hashing over xxhash64:
//! `h_i(x) = h1(x) + i * h2(x) (mod m)` with `h1 = xxh64(x)` and
//! `h2 = h1 >> 32`.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::error::{Error, Result};

/// Bloom filter over raw keys. `add` is single-writer during table
/// construction; once built, `contains` is safe from any thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    hashes: u32,
}

impl BloomFilter {
    /// Build a filter for `n` expected keys at false-positive rate `p`.
    /// The bit count `m = ⌈−n·ln(p)/(ln 2)²⌉` is rounded up to a multiple
    /// of 64; the hash count is `k = ⌈(m/n)·ln 2⌉`.
    pub fn new(n: u32, p: f64) -> Result<Self> {
        if n == 0 {
            return Err(Error::InvalidInput(
                "expected key count must be positive".into(),
            ));
        }
        if !(p > 0.0 && p < 1.0) {
            return Err(Error::InvalidInput(format!(
                "false positive probability {p} outside (0, 1)"
            )));
        }

        let ln2 = std::f64::consts::LN_2;
        let m = (-(n as f64) * p.ln() / (ln2 * ln2)).ceil();
        let words = ((m as u64) + 63) / 64;
        let m = words * 64;
        let k = ((m as f64 / n as f64) * ln2).ceil() as u32;

        Ok(Self {
            bits: vec![0u64; words as usize],
            hashes: k.max(1),
        })
    }

    fn positions(&self, data: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let h1 = xxh64(data, 0);
        let h2 = h1 >> 32;
        let m = self.bits.len() as u64 * 64;
        (0..self.hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % m)
    }

    /// Record a key.
    pub fn add(&mut self, data: &[u8]) {
        let positions: Vec<u64> = self.positions(data).collect();
        for pos in positions {
            self.bits[(pos / 64) as usize] |= 1 << (pos % 64);
        }
    }

    /// Whether a key may have been recorded. False positives happen at
    /// roughly the configured rate; false negatives never do.
    pub fn contains(&self, data: &[u8]) -> bool {
        self.positions(data)
            .all(|pos| self.bits[(pos / 64) as usize] & (1 << (pos % 64)) != 0)
    }

    /// Serialise for the table trailer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a trailer previously produced by `to_bytes`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut bf = BloomFilter::new(1000, 0.01).unwrap();
        let keys: Vec<String> = (0..1000).map(|i| format!("key_{i:05}")).collect();
        for key in &keys {
            bf.add(key.as_bytes());
        }
        for key in &keys {
            assert!(bf.contains(key.as_bytes()), "lost {key}");
        }
    }

    #[test]
    fn test_false_positive_rate_is_plausible() {
        let mut bf = BloomFilter::new(1000, 0.01).unwrap();
        for i in 0..1000 {
            bf.add(format!("present_{i}").as_bytes());
        }
        let hits = (0..10_000)
            .filter(|i| bf.contains(format!("absent_{i}").as_bytes()))
            .count();
        // 1% target; allow generous slack before calling it broken.
        assert!(hits < 500, "false positive rate too high: {hits}/10000");
    }

    #[test]
    fn test_serialisation_round_trip() {
        let mut bf = BloomFilter::new(128, 0.01).unwrap();
        bf.add(b"apple");
        bf.add(b"banana");

        let bytes = bf.to_bytes().unwrap();
        let decoded = BloomFilter::from_bytes(&bytes).unwrap();
        assert!(decoded.contains(b"apple"));
        assert!(decoded.contains(b"banana"));
        assert_eq!(decoded.hashes, bf.hashes);
        assert_eq!(decoded.bits, bf.bits);
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(BloomFilter::new(0, 0.01).is_err());
        assert!(BloomFilter::new(100, 0.0).is_err());
        assert!(BloomFilter::new(100, 1.0).is_err());
    }
}
