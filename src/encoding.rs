//! Internal key encoding.
//!
//! A logical key is augmented at insertion time with an 8-byte big-endian
//! microsecond timestamp, forming an internal key. Internal keys order by
//! raw key ascending, then timestamp descending, so the newest version of a
//! key is always encountered first.

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};

/// Length of the timestamp suffix in bytes.
pub const TS_LEN: usize = 8;

/// Largest accepted logical key. The internal key length is stored in a u16,
/// so the raw key leaves room for the timestamp suffix.
pub const MAX_KEY_SIZE: usize = u16::MAX as usize - TS_LEN;

/// Largest accepted value; value lengths are stored in a u32.
pub const MAX_VALUE_SIZE: usize = u32::MAX as usize;

/// Value written for a deletion record.
pub const TOMBSTONE: [u8; 4] = [0xFD, 0xFE, 0xFA, 0xF9];

/// WAL operation: insert.
pub const OP_PUT: u8 = 0;
/// WAL operation: delete.
pub const OP_DELETE: u8 = 1;

/// Current wall clock in microseconds since the epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Build an internal key stamped with the current time.
pub fn internal_key(raw: &[u8]) -> Vec<u8> {
    internal_key_at(raw, now_micros())
}

/// Build an internal key with an explicit timestamp.
pub fn internal_key_at(raw: &[u8], ts: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(raw.len() + TS_LEN);
    key.extend_from_slice(raw);
    let mut buf = [0u8; TS_LEN];
    BigEndian::write_u64(&mut buf, ts);
    key.extend_from_slice(&buf);
    key
}

/// The raw key portion of an internal key.
pub fn raw(ikey: &[u8]) -> &[u8] {
    &ikey[..ikey.len().saturating_sub(TS_LEN)]
}

/// The timestamp of an internal key. Keys shorter than the suffix (the
/// skiplist head) report 0.
pub fn timestamp(ikey: &[u8]) -> u64 {
    if ikey.len() < TS_LEN {
        return 0;
    }
    BigEndian::read_u64(&ikey[ikey.len() - TS_LEN..])
}

/// Compare two internal keys by their raw key portions.
pub fn compare_raw(a: &[u8], b: &[u8]) -> Ordering {
    raw(a).cmp(raw(b))
}

/// Compare two internal keys by timestamp, newest first.
pub fn compare_ts(a: &[u8], b: &[u8]) -> Ordering {
    timestamp(b).cmp(&timestamp(a))
}

/// Full internal-key ordering: raw ascending, timestamp descending.
pub fn compare(a: &[u8], b: &[u8]) -> Ordering {
    compare_raw(a, b).then_with(|| compare_ts(a, b))
}

/// Whether a value is the deletion marker.
pub fn is_tombstone(value: &[u8]) -> bool {
    value == TOMBSTONE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_key_round_trip() {
        let ikey = internal_key_at(b"apple", 42);
        assert_eq!(raw(&ikey), b"apple");
        assert_eq!(timestamp(&ikey), 42);
        assert_eq!(ikey.len(), 5 + TS_LEN);
    }

    #[test]
    fn test_ordering_raw_ascending() {
        let a = internal_key_at(b"apple", 1);
        let b = internal_key_at(b"banana", 1);
        assert_eq!(compare(&a, &b), Ordering::Less);
        assert_eq!(compare(&b, &a), Ordering::Greater);
    }

    #[test]
    fn test_ordering_newest_first_on_ties() {
        let old = internal_key_at(b"apple", 1);
        let new = internal_key_at(b"apple", 2);
        assert_eq!(compare_raw(&old, &new), Ordering::Equal);
        assert_eq!(compare(&new, &old), Ordering::Less);
    }

    #[test]
    fn test_prefix_keys_stay_comparable() {
        // "app" vs "apple": the timestamp never bleeds into the raw compare.
        let short = internal_key_at(b"app", u64::MAX);
        let long = internal_key_at(b"apple", 0);
        assert_eq!(compare(&short, &long), Ordering::Less);
    }

    #[test]
    fn test_tombstone() {
        assert!(is_tombstone(&TOMBSTONE));
        assert!(!is_tombstone(b"value"));
        assert!(!is_tombstone(&[]));
    }
}
