//! Cache entries.

use crate::clock::Time;
use bytes::Bytes;
use std::time::Duration;

/// An entry held by the store of the node owning its bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: Bytes,
    /// Time of the last write.
    pub created: Time,
    /// `created + ttl` of the last write, `None` when the entry never expires.
    pub expiration: Option<Time>,
    pub last_access: Time,
    /// Set by `invalidate`; the entry is dropped on next access.
    pub invalid: bool,
}

impl CacheEntry {
    /// Entry written at `now`.
    pub fn new(value: Bytes, now: Time, ttl: Option<Duration>) -> Self {
        Self {
            value,
            created: now,
            expiration: ttl.map(|ttl| now.add(ttl)),
            last_access: now,
            invalid: false,
        }
    }

    /// Entry carrying times from another node.
    pub fn restored(value: Bytes, created: Time, expiration: Option<Time>) -> Self {
        Self {
            value,
            created,
            expiration,
            last_access: created,
            invalid: false,
        }
    }

    pub fn is_expired(&self, now: Time) -> bool {
        self.expiration.is_some_and(|exp| now >= exp)
    }

    /// Bytes accounted against `max_bytes`.
    pub fn weight(&self, key: &[u8]) -> u64 {
        (key.len() + self.value.len()) as u64
    }
}

/// Read-only view of a live entry handed to executables and filters.
#[derive(Debug, Clone, Copy)]
pub struct EntryView<'a> {
    pub key: &'a Bytes,
    pub value: &'a Bytes,
    pub created: Time,
    pub expiration: Option<Time>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiration_is_created_plus_ttl() {
        let now = Time::new(1_000, 3);
        let entry = CacheEntry::new(Bytes::from_static(b"v"), now, Some(Duration::from_millis(5000)));
        assert_eq!(entry.expiration, Some(Time::new(6_000, 0)));
        assert!(!entry.is_expired(Time::new(5_999, 9)));
        assert!(entry.is_expired(Time::new(6_000, 0)));

        let forever = CacheEntry::new(Bytes::from_static(b"v"), now, None);
        assert!(!forever.is_expired(Time::new(i64::MAX, 0)));
    }

    #[test]
    fn test_weight() {
        let entry = CacheEntry::new(Bytes::from_static(b"value"), Time::ZERO, None);
        assert_eq!(entry.weight(b"key"), 8);
    }
}
