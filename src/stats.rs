//! Relay Metrics
//!
//! Lock-free counters and coarse latency histograms for the dispatch
//! pipeline and the token-bucket caches.
//!
//! # Design
//!
//! - Plain relaxed atomics; recording never takes a lock
//! - The registry is built by the caller and injected, so the core runs
//!   (and tests run) against a throwaway instance with no exporter attached
//! - [`Metrics::prometheus`] renders the text exposition format served by
//!   the daemon's HTTP endpoint

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Histogram bucket upper bounds in microseconds; the last is open-ended.
const BUCKET_BOUNDS_US: [u64; 8] = [1, 5, 10, 50, 100, 500, 1000, u64::MAX];

/// Microsecond histogram for short code paths (dispatch, cache sweep).
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; 8],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl LatencyHistogram {
    /// Record one duration in microseconds
    #[inline]
    pub fn record(&self, us: u64) {
        let idx = BUCKET_BOUNDS_US
            .iter()
            .position(|bound| us <= *bound)
            .unwrap_or(BUCKET_BOUNDS_US.len() - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
    }

    /// Number of recorded durations
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of recorded durations in microseconds
    pub fn sum_us(&self) -> u64 {
        self.sum_us.load(Ordering::Relaxed)
    }

    /// Mean duration in microseconds
    pub fn average_us(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.sum_us() as f64 / count as f64
    }
}

/// Counters for the dispatch pipeline
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub read_errors: AtomicU64,
    pub selector_errors: AtomicU64,
    pub rejects: AtomicU64,
    pub write_errors: AtomicU64,
    pub forwarded: AtomicU64,
    pub forwarded_bytes: AtomicU64,
    pub duration: LatencyHistogram,
}

impl DispatchStats {
    #[inline]
    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_selector_error(&self) {
        self.selector_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reject(&self) {
        self.rejects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_forward(&self, bytes: usize) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        self.forwarded_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            read_errors: self.read_errors.load(Ordering::Relaxed),
            selector_errors: self.selector_errors.load(Ordering::Relaxed),
            rejects: self.rejects.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            forwarded_bytes: self.forwarded_bytes.load(Ordering::Relaxed),
            dispatch_avg_us: self.duration.average_us(),
        }
    }
}

/// Dispatch counters at one point in time
#[derive(Debug, Clone, Serialize)]
pub struct DispatchSnapshot {
    pub read_errors: u64,
    pub selector_errors: u64,
    pub rejects: u64,
    pub write_errors: u64,
    pub forwarded: u64,
    pub forwarded_bytes: u64,
    pub dispatch_avg_us: f64,
}

/// Counters for one cache kind ("users" / "ports"), shared by all shards
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Sweeper threads currently running (gauge)
    pub instances: AtomicU64,
    /// Live buckets across all shards (gauge)
    pub buckets: AtomicU64,
    pub requests: AtomicU64,
    pub misses: AtomicU64,
    pub sweep: LatencyHistogram,
}

impl CacheStats {
    #[inline]
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.buckets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_evictions(&self, n: usize) {
        self.buckets.fetch_sub(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            instances: self.instances.load(Ordering::Relaxed),
            buckets: self.buckets.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sweep_avg_us: self.sweep.average_us(),
        }
    }
}

/// Cache counters at one point in time
#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub instances: u64,
    pub buckets: u64,
    pub requests: u64,
    pub misses: u64,
    pub sweep_avg_us: f64,
}

/// Registry snapshot for the JSON stats endpoint
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub dispatch: DispatchSnapshot,
    pub users: CacheSnapshot,
    pub ports: CacheSnapshot,
}

/// Process-wide metrics registry
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    pub dispatch: Arc<DispatchStats>,
    pub users: Arc<CacheStats>,
    pub ports: Arc<CacheStats>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full registry snapshot for the JSON stats endpoint
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatch: self.dispatch.snapshot(),
            users: self.users.snapshot(),
            ports: self.ports.snapshot(),
        }
    }

    /// Render the Prometheus text exposition format
    pub fn prometheus(&self) -> String {
        let mut out = String::new();

        let d = self.dispatch.snapshot();
        out.push_str("# HELP udp_read_errors_total Count of UDP read errors\n");
        out.push_str(&format!("udp_read_errors_total {}\n", d.read_errors));
        out.push_str("# HELP dispatch_selector_errors_total Count of errors in filtering logic\n");
        out.push_str(&format!(
            "dispatch_selector_errors_total {}\n",
            d.selector_errors
        ));
        out.push_str("# HELP dispatch_selector_rejects_total Count of filtering logic rejects\n");
        out.push_str(&format!("dispatch_selector_rejects_total {}\n", d.rejects));
        out.push_str("# HELP dispatch_writer_errors_total Count of raw socket write errors\n");
        out.push_str(&format!("dispatch_writer_errors_total {}\n", d.write_errors));
        out.push_str("# HELP dispatch_forwarded_total Count of forwarded datagrams\n");
        out.push_str(&format!("dispatch_forwarded_total {}\n", d.forwarded));
        out.push_str(&format!("dispatch_forwarded_bytes {}\n", d.forwarded_bytes));
        out.push_str("# HELP dispatch_duration_us Time spent per dispatched packet\n");
        out.push_str(&format!(
            "dispatch_duration_us_sum {}\n",
            self.dispatch.duration.sum_us()
        ));
        out.push_str(&format!(
            "dispatch_duration_us_count {}\n",
            self.dispatch.duration.count()
        ));

        for (kind, cache) in [("users", &self.users), ("ports", &self.ports)] {
            let c = cache.snapshot();
            out.push_str(&format!(
                "cache_instances{{kind=\"{}\"}} {}\n",
                kind, c.instances
            ));
            out.push_str(&format!("cache_buckets{{kind=\"{}\"}} {}\n", kind, c.buckets));
            out.push_str(&format!(
                "cache_requests_total{{kind=\"{}\"}} {}\n",
                kind, c.requests
            ));
            out.push_str(&format!(
                "cache_miss_total{{kind=\"{}\"}} {}\n",
                kind, c.misses
            ));
            out.push_str(&format!(
                "cache_sweep_duration_us_sum{{kind=\"{}\"}} {}\n",
                kind,
                cache.sweep.sum_us()
            ));
            out.push_str(&format!(
                "cache_sweep_duration_us_count{{kind=\"{}\"}} {}\n",
                kind,
                cache.sweep.count()
            ));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets() {
        let h = LatencyHistogram::default();
        h.record(1);
        h.record(7);
        h.record(5000);

        assert_eq!(h.count(), 3);
        assert_eq!(h.sum_us(), 5008);
        assert!(h.average_us() > 1600.0);
    }

    #[test]
    fn test_dispatch_snapshot() {
        let stats = DispatchStats::default();
        stats.record_forward(37);
        stats.record_forward(28);
        stats.record_reject();

        let snap = stats.snapshot();
        assert_eq!(snap.forwarded, 2);
        assert_eq!(snap.forwarded_bytes, 65);
        assert_eq!(snap.rejects, 1);
    }

    #[test]
    fn test_cache_gauge_tracks_evictions() {
        let stats = CacheStats::default();
        stats.record_miss();
        stats.record_miss();
        stats.record_evictions(1);

        assert_eq!(stats.snapshot().buckets, 1);
    }

    #[test]
    fn test_prometheus_exposition() {
        let metrics = Metrics::new();
        metrics.dispatch.record_forward(37);
        metrics.users.record_request();

        let text = metrics.prometheus();
        assert!(text.contains("dispatch_forwarded_total 1"));
        assert!(text.contains("cache_requests_total{kind=\"users\"} 1"));
        assert!(text.contains("cache_requests_total{kind=\"ports\"} 0"));
    }
}
