//! Metrics for monitoring caches and the transport.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     CacheMetrics                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────┐  │
//! │  │  Counters    │  │   Gauges     │  │  Histograms    │  │
//! │  │ - hits/miss  │  │ - entries    │  │ - get latency  │  │
//! │  │ - evictions  │  │ - bytes      │  │ - put latency  │  │
//! │  │ - transfers  │  │              │  │ - execute      │  │
//! │  └──────────────┘  └──────────────┘  └────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! One [`CacheMetrics`] exists per cache on a node. The store processor
//! writes it; API handles read it without going through the mailbox.

mod counters;
mod gauges;
mod histograms;

pub use counters::{Counter, LabeledCounter};
pub use gauges::Gauge;
pub use histograms::{Histogram, HistogramSnapshot, HistogramTimer, DEFAULT_BUCKETS};

use crate::error::Error;
use crate::types::CacheStats;
use std::fmt::Write;

/// Latency buckets for single-key cache operations, in seconds.
pub const CACHE_LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Per-cache metrics.
#[derive(Debug)]
pub struct CacheMetrics {
    pub get_total: Counter,
    pub hits: Counter,
    pub misses: Counter,
    pub put_total: Counter,
    pub remove_total: Counter,
    pub evictions: Counter,
    pub expirations: Counter,
    pub invalidations: Counter,
    pub read_through_loads: Counter,
    pub write_through_failures: Counter,
    /// Batches pushed to new bucket owners.
    pub transfer_batches_sent: Counter,
    /// Entries received from previous bucket owners.
    pub entries_transferred_in: Counter,
    /// Buckets whose data was lost because the owner left without a backup.
    pub buckets_lost: Counter,

    /// Entries held for owned buckets.
    pub entries: Gauge,
    /// Bytes held for owned buckets.
    pub bytes: Gauge,

    pub get_latency: Histogram,
    pub put_latency: Histogram,
    pub execute_latency: Histogram,

    /// Operation failures by error kind.
    pub errors: LabeledCounter,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self {
            get_total: Counter::new("cache_get_total", "Total get requests"),
            hits: Counter::new("cache_hits_total", "Cache hits"),
            misses: Counter::new("cache_misses_total", "Cache misses"),
            put_total: Counter::new("cache_put_total", "Total put requests"),
            remove_total: Counter::new("cache_remove_total", "Total remove requests"),
            evictions: Counter::new("cache_evictions_total", "Entries evicted by bounds"),
            expirations: Counter::new("cache_expirations_total", "Entries dropped on expiry"),
            invalidations: Counter::new("cache_invalidations_total", "Entries dropped as invalid"),
            read_through_loads: Counter::new(
                "cache_read_through_loads_total",
                "Values loaded from the data source",
            ),
            write_through_failures: Counter::new(
                "cache_write_through_failures_total",
                "Failed writes to the data store",
            ),
            transfer_batches_sent: Counter::new(
                "cache_transfer_batches_sent_total",
                "Bucket transfer batches sent",
            ),
            entries_transferred_in: Counter::new(
                "cache_entries_transferred_in_total",
                "Entries received by bucket transfer",
            ),
            buckets_lost: Counter::new("cache_buckets_lost_total", "Buckets lost with their owner"),
            entries: Gauge::new("cache_entries", "Entries held locally"),
            bytes: Gauge::new("cache_bytes", "Bytes held locally"),
            get_latency: Histogram::with_buckets(
                "cache_get_latency_seconds",
                "Get latency",
                CACHE_LATENCY_BUCKETS.to_vec(),
            ),
            put_latency: Histogram::with_buckets(
                "cache_put_latency_seconds",
                "Put latency",
                CACHE_LATENCY_BUCKETS.to_vec(),
            ),
            execute_latency: Histogram::new("cache_execute_latency_seconds", "Scatter-gather latency"),
            errors: LabeledCounter::new("cache_errors_total", "Failed operations", "kind"),
        }
    }

    /// Count a failed API call.
    pub fn record_error(&self, error: &Error) {
        let kind = match error {
            Error::Network(_) => "network",
            Error::Store(_) => "store",
            Error::Membership(_) => "membership",
            Error::Config(_) => "config",
            Error::Execution(_) => "execution",
            Error::OwnershipChanged { .. } => "ownership_changed",
            Error::BucketUnowned { .. } => "bucket_unowned",
            Error::Timeout => "timeout",
            Error::Shutdown => "shutdown",
            Error::Remote { .. } => "remote",
            Error::Internal(_) => "internal",
        };
        self.errors.inc(kind);
    }

    /// Local statistics for this cache.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.entries.get_u64(),
            byte_size: self.bytes.get_u64(),
            hits: self.hits.get(),
            misses: self.misses.get(),
            evictions: self.evictions.get(),
            expirations: self.expirations.get(),
            invalidations: self.invalidations.get(),
            read_through_loads: self.read_through_loads.get(),
            write_through_failures: self.write_through_failures.get(),
        }
    }

    /// Prometheus text exposition.
    pub fn to_prometheus(&self, cache: &str) -> String {
        let mut out = String::new();

        for counter in [
            &self.get_total,
            &self.hits,
            &self.misses,
            &self.put_total,
            &self.remove_total,
            &self.evictions,
            &self.expirations,
            &self.invalidations,
            &self.read_through_loads,
            &self.write_through_failures,
            &self.transfer_batches_sent,
            &self.entries_transferred_in,
            &self.buckets_lost,
        ] {
            let _ = write!(
                out,
                "# HELP {name} {help}\n# TYPE {name} counter\n{name}{{cache=\"{cache}\"}} {value}\n",
                name = counter.name(),
                help = counter.help(),
                value = counter.get(),
            );
        }

        for gauge in [&self.entries, &self.bytes] {
            let _ = write!(
                out,
                "# HELP {name} {help}\n# TYPE {name} gauge\n{name}{{cache=\"{cache}\"}} {value}\n",
                name = gauge.name(),
                help = gauge.help(),
                value = gauge.get(),
            );
        }

        for histogram in [&self.get_latency, &self.put_latency, &self.execute_latency] {
            let snap = histogram.snapshot();
            let _ = write!(
                out,
                "# HELP {name} {help}\n# TYPE {name} histogram\n",
                name = histogram.name(),
                help = histogram.help(),
            );
            for (bound, count) in snap.buckets.iter().zip(&snap.bucket_counts) {
                let _ = writeln!(
                    out,
                    "{}_bucket{{cache=\"{cache}\",le=\"{bound}\"}} {count}",
                    histogram.name()
                );
            }
            let _ = write!(
                out,
                "{name}_bucket{{cache=\"{cache}\",le=\"+Inf\"}} {count}\n{name}_sum{{cache=\"{cache}\"}} {sum}\n{name}_count{{cache=\"{cache}\"}} {count}\n",
                name = histogram.name(),
                count = snap.count,
                sum = snap.sum,
            );
        }

        let _ = writeln!(out, "# HELP {} {}", self.errors.name(), self.errors.help());
        let _ = writeln!(out, "# TYPE {} counter", self.errors.name());
        for (kind, value) in self.errors.get_all() {
            let _ = writeln!(
                out,
                "{}{{cache=\"{cache}\",{}=\"{kind}\"}} {value}",
                self.errors.name(),
                self.errors.label()
            );
        }

        out
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport counters shared by the peer senders and the receivers.
#[derive(Debug)]
pub struct TransportMetrics {
    pub messages_sent: Counter,
    pub messages_failed: Counter,
    pub frames_received: Counter,
    pub datagrams_sent: Counter,
    pub datagrams_received: Counter,
    pub connections_created: Counter,
    pub connections_failed: Counter,
    pub handshakes_rejected: Counter,
    pub active_connections: Gauge,
}

impl TransportMetrics {
    pub fn new() -> Self {
        Self {
            messages_sent: Counter::new("transport_messages_sent_total", "Envelopes written to streams"),
            messages_failed: Counter::new(
                "transport_messages_failed_total",
                "Envelopes dropped after retries",
            ),
            frames_received: Counter::new("transport_frames_received_total", "Frames read from streams"),
            datagrams_sent: Counter::new("transport_datagrams_sent_total", "Datagrams sent"),
            datagrams_received: Counter::new("transport_datagrams_received_total", "Datagrams received"),
            connections_created: Counter::new("transport_connections_created_total", "Outbound connections"),
            connections_failed: Counter::new(
                "transport_connections_failed_total",
                "Failed outbound connection attempts",
            ),
            handshakes_rejected: Counter::new(
                "transport_handshakes_rejected_total",
                "Inbound connections rejected at handshake",
            ),
            active_connections: Gauge::new("transport_active_connections", "Open outbound connections"),
        }
    }

    pub fn snapshot(&self) -> TransportMetricsSnapshot {
        TransportMetricsSnapshot {
            messages_sent: self.messages_sent.get(),
            messages_failed: self.messages_failed.get(),
            frames_received: self.frames_received.get(),
            datagrams_sent: self.datagrams_sent.get(),
            datagrams_received: self.datagrams_received.get(),
            connections_created: self.connections_created.get(),
            connections_failed: self.connections_failed.get(),
            handshakes_rejected: self.handshakes_rejected.get(),
            active_connections: self.active_connections.get_u64(),
        }
    }
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportMetricsSnapshot {
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub frames_received: u64,
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub connections_created: u64,
    pub connections_failed: u64,
    pub handshakes_rejected: u64,
    pub active_connections: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkError;

    #[test]
    fn test_cache_stats() {
        let metrics = CacheMetrics::new();
        metrics.hits.inc_by(3);
        metrics.misses.inc();
        metrics.entries.set(12);
        metrics.bytes.set(480);

        let stats = metrics.stats();
        assert_eq!(stats.entry_count, 12);
        assert_eq!(stats.byte_size, 480);
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_record_error_by_kind() {
        let metrics = CacheMetrics::new();
        metrics.record_error(&Error::Timeout);
        metrics.record_error(&Error::Timeout);
        metrics.record_error(&Error::from(NetworkError::ConnectionClosed));

        assert_eq!(metrics.errors.get("timeout"), 2);
        assert_eq!(metrics.errors.get("network"), 1);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = CacheMetrics::new();
        metrics.get_total.inc();
        metrics.get_latency.observe(0.0002);

        let output = metrics.to_prometheus("orders");
        assert!(output.contains("cache_get_total{cache=\"orders\"} 1"));
        assert!(output.contains("# TYPE cache_get_latency_seconds histogram"));
        assert!(output.contains("cache_get_latency_seconds_count{cache=\"orders\"} 1"));
    }
}
