//! Data moved between nodes when buckets change hands.

use crate::cache::entry::CacheEntry;
use crate::clock::Time;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Encoding cost of an entry beyond its key and value: length prefixes and
/// both timestamps.
pub const ENTRY_OVERHEAD: usize = 48;

/// Upper bound on the encoded size of an entry with the given key and value
/// lengths.
pub fn entry_wire_size(key_len: usize, value_len: usize) -> usize {
    key_len + value_len + ENTRY_OVERHEAD
}

/// A cache entry in transit. Times are absolute cluster times, so the
/// receiver keeps the original expiration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEntry {
    pub key: Bytes,
    pub value: Bytes,
    pub created: Time,
    pub expiration: Option<Time>,
}

impl TransferEntry {
    pub fn from_entry(key: Bytes, entry: &CacheEntry) -> Self {
        Self {
            key,
            value: entry.value.clone(),
            created: entry.created,
            expiration: entry.expiration,
        }
    }

    pub fn is_expired(&self, now: Time) -> bool {
        self.expiration.is_some_and(|exp| now >= exp)
    }

    /// Upper bound on the encoded size of this entry.
    pub fn wire_size(&self) -> usize {
        entry_wire_size(self.key.len(), self.value.len())
    }

    pub fn into_entry(self) -> (Bytes, CacheEntry) {
        let entry = CacheEntry::restored(self.value, self.created, self.expiration);
        (self.key, entry)
    }
}

/// One chunk of a bucket handoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferBatch {
    /// Position of the batch within its transfer, starting at 0.
    pub sequence: u64,
    pub entries: Vec<TransferEntry>,
    /// Whether this is the last batch.
    pub is_final: bool,
}

impl TransferBatch {
    pub fn new(sequence: u64, entries: Vec<TransferEntry>, is_final: bool) -> Self {
        Self {
            sequence,
            entries,
            is_final,
        }
    }

    /// The first batch of a transfer replaces whatever the receiver holds.
    pub fn is_first(&self) -> bool {
        self.sequence == 0
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Split a bucket's entries into batches of at most `max_entries` entries
/// and `max_bytes` encoded bytes, dropping entries already expired at `now`.
/// Always yields at least one batch so the receiver learns about empty
/// buckets too.
///
/// An entry larger than `max_bytes` on its own cannot be sent and is left
/// out.
pub fn into_batches(
    entries: Vec<TransferEntry>,
    max_entries: usize,
    max_bytes: usize,
    now: Time,
) -> Vec<TransferBatch> {
    let max_entries = max_entries.max(1);
    let mut batches = Vec::new();
    let mut chunk: Vec<TransferEntry> = Vec::new();
    let mut chunk_bytes = 0;

    for entry in entries.into_iter().filter(|e| !e.is_expired(now)) {
        let size = entry.wire_size();
        if size > max_bytes {
            warn!(size, max_bytes, "Entry too large to transfer, skipped");
            continue;
        }
        if !chunk.is_empty() && (chunk.len() >= max_entries || chunk_bytes + size > max_bytes) {
            let sequence = batches.len() as u64;
            batches.push(TransferBatch::new(sequence, std::mem::take(&mut chunk), false));
            chunk_bytes = 0;
        }
        chunk_bytes += size;
        chunk.push(entry);
    }

    let sequence = batches.len() as u64;
    batches.push(TransferBatch::new(sequence, chunk, true));
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, expiration: Option<Time>) -> TransferEntry {
        TransferEntry {
            key: Bytes::copy_from_slice(key.as_bytes()),
            value: Bytes::from_static(b"v"),
            created: Time::new(100, 0),
            expiration,
        }
    }

    #[test]
    fn test_batches_cover_all_entries() {
        let entries: Vec<_> = (0..10).map(|i| entry(&format!("k{i}"), None)).collect();
        let batches = into_batches(entries, 4, usize::MAX, Time::new(200, 0));

        assert_eq!(batches.len(), 3);
        assert_eq!(batches.iter().map(TransferBatch::len).collect::<Vec<_>>(), vec![4, 4, 2]);
        assert!(batches[0].is_first());
        assert!(!batches[1].is_final);
        assert!(batches[2].is_final);
        assert_eq!(batches[2].sequence, 2);
    }

    #[test]
    fn test_empty_bucket_yields_one_final_batch() {
        let batches = into_batches(Vec::new(), 4, usize::MAX, Time::ZERO);
        assert_eq!(batches.len(), 1);
        assert!(batches[0].is_first() && batches[0].is_final && batches[0].is_empty());
    }

    #[test]
    fn test_expired_entries_are_skipped() {
        let entries = vec![
            entry("live", Some(Time::new(1_000, 0))),
            entry("dead", Some(Time::new(150, 0))),
        ];
        let batches = into_batches(entries, 10, usize::MAX, Time::new(200, 0));
        assert_eq!(batches[0].entries.len(), 1);
        assert_eq!(batches[0].entries[0].key, Bytes::from_static(b"live"));
    }

    #[test]
    fn test_batches_respect_byte_limit() {
        let value = Bytes::from(vec![0u8; 1000]);
        let entries: Vec<_> = (0..10)
            .map(|i| TransferEntry {
                value: value.clone(),
                ..entry(&format!("k{i}"), None)
            })
            .collect();
        let one = entries[0].wire_size();

        // Room for three entries per batch, far below the entry limit.
        let batches = into_batches(entries, 256, one * 3 + one / 2, Time::ZERO);
        assert_eq!(batches.iter().map(TransferBatch::len).collect::<Vec<_>>(), vec![3, 3, 3, 1]);
        assert!(batches.iter().all(|b| b.entries.iter().map(TransferEntry::wire_size).sum::<usize>() <= one * 3 + one / 2));
        assert!(batches[3].is_final);
    }

    #[test]
    fn test_entry_over_byte_limit_is_left_out() {
        let big = TransferEntry {
            value: Bytes::from(vec![0u8; 5000]),
            ..entry("big", None)
        };
        let entries = vec![entry("a", None), big, entry("b", None)];
        let batches = into_batches(entries, 256, 1024, Time::ZERO);
        assert_eq!(batches.len(), 1);
        let keys: Vec<_> = batches[0].entries.iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
    }

    #[test]
    fn test_entry_keeps_times() {
        let transfer = entry("k", Some(Time::new(900, 0)));
        let (key, restored) = transfer.clone().into_entry();
        assert_eq!(key, transfer.key);
        assert_eq!(restored.created, Time::new(100, 0));
        assert_eq!(restored.expiration, Some(Time::new(900, 0)));
    }
}
