//! Scatter-gather execution over entries co-located on each node.
//!
//! An [`Executable`] runs once per node against the entries of the buckets
//! that node owns, optionally narrowed by an [`EntryFilter`]. Partial results
//! come back as bytes and are combined on the caller by an [`Aggregator`].

mod scatter;

pub use scatter::ScatterGather;

use crate::cache::entry::EntryView;
use crate::error::{ExecutionError, Result};
use bytes::Bytes;

/// Computes a partial result from one node's entries.
///
/// Runs inline on the store processor; must not block or perform I/O.
pub trait Executable: Send + Sync + 'static {
    fn execute(&self, entries: &mut dyn Iterator<Item = EntryView<'_>>) -> Result<Bytes>;
}

/// Selects which entries an executable sees.
pub trait EntryFilter: Send + Sync + 'static {
    fn matches(&self, entry: &EntryView<'_>) -> bool;
}

/// Combines partial results on the calling node.
pub trait Aggregator: Send {
    type Output;

    fn aggregate(&self, partials: Vec<Bytes>) -> Result<Self::Output>;
}

/// Counts the entries it is given. Partial result is a bincode `u64`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CountEntries;

impl CountEntries {
    pub const NAME: &'static str = "count";
}

impl Executable for CountEntries {
    fn execute(&self, entries: &mut dyn Iterator<Item = EntryView<'_>>) -> Result<Bytes> {
        let count = entries.count() as u64;
        Ok(Bytes::from(bincode::serialize(&count)?))
    }
}

/// Matches keys starting with a fixed prefix.
#[derive(Debug, Clone)]
pub struct KeyPrefixFilter {
    prefix: Bytes,
}

impl KeyPrefixFilter {
    pub const NAME: &'static str = "key-prefix";

    pub fn new(prefix: impl AsRef<[u8]>) -> Self {
        Self {
            prefix: Bytes::copy_from_slice(prefix.as_ref()),
        }
    }
}

impl EntryFilter for KeyPrefixFilter {
    fn matches(&self, entry: &EntryView<'_>) -> bool {
        entry.key.starts_with(&self.prefix)
    }
}

/// Sums bincode-encoded `u64` partials.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sum;

impl Aggregator for Sum {
    type Output = u64;

    fn aggregate(&self, partials: Vec<Bytes>) -> Result<u64> {
        partials.iter().try_fold(0u64, |total, partial| {
            let value: u64 = bincode::deserialize(partial)
                .map_err(|e| ExecutionError::Failed(format!("bad partial: {e}")))?;
            Ok(total + value)
        })
    }
}

/// Hands back the raw partial results.
#[derive(Debug, Default, Clone, Copy)]
pub struct Collect;

impl Aggregator for Collect {
    type Output = Vec<Bytes>;

    fn aggregate(&self, partials: Vec<Bytes>) -> Result<Vec<Bytes>> {
        Ok(partials)
    }
}

/// Run an executable over entries, applying an optional filter.
pub(crate) fn run_local<'a>(
    executable: &dyn Executable,
    filter: Option<&dyn EntryFilter>,
    entries: impl Iterator<Item = EntryView<'a>>,
) -> Result<Bytes> {
    match filter {
        Some(filter) => {
            let mut matched = entries.filter(|entry| filter.matches(entry));
            executable.execute(&mut matched)
        }
        None => {
            let mut all = entries;
            executable.execute(&mut all)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Time;

    fn views(keys: &[Bytes], value: &Bytes) -> Vec<(Bytes, Bytes)> {
        keys.iter().map(|k| (k.clone(), value.clone())).collect()
    }

    #[test]
    fn test_count_with_filter() {
        let value = Bytes::from_static(b"v");
        let keys: Vec<Bytes> = ["user:1", "user:2", "order:1"]
            .iter()
            .map(|k| Bytes::copy_from_slice(k.as_bytes()))
            .collect();
        let pairs = views(&keys, &value);
        let entries = || {
            pairs.iter().map(|(k, v)| EntryView {
                key: k,
                value: v,
                created: Time::ZERO,
                expiration: None,
            })
        };

        let all = run_local(&CountEntries, None, entries()).unwrap();
        assert_eq!(Sum.aggregate(vec![all]).unwrap(), 3);

        let filter = KeyPrefixFilter::new("user:");
        let users = run_local(&CountEntries, Some(&filter), entries()).unwrap();
        assert_eq!(Sum.aggregate(vec![users]).unwrap(), 2);
    }

    #[test]
    fn test_sum_rejects_garbage() {
        let err = Sum.aggregate(vec![Bytes::from_static(b"x")]).unwrap_err();
        assert!(matches!(err, crate::Error::Execution(ExecutionError::Failed(_))));
        assert_eq!(Sum.aggregate(Vec::new()).unwrap(), 0);
    }
}
