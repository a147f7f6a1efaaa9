//! Token-Bucket Cache
//!
//! Concurrent map from 64-bit fingerprints to token buckets, with a
//! background sweep that refills every bucket and evicts idle ones.
//!
//! # Design
//!
//! - One cache-wide mutex; checks and the refill sweep both run under it.
//!   Per-bucket locking would not work: the sweep walks the whole map.
//! - A bucket is debited even when the check is denied, so sustained abuse
//!   accumulates debt down to `-max` and delays recovery
//! - Idleness is measured in sweep ticks, not wall time

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, tick, Sender};
use crossbeam::select;
use parking_lot::Mutex;

use crate::error::{RelayError, RelayResult};
use crate::stats::CacheStats;

/// Sizing callback: `(fill, max)` for a new bucket, keyed by client IP.
pub type Sizer = Arc<dyn Fn(Ipv4Addr) -> (i32, i32) + Send + Sync>;

/// Sizer that ignores the client IP
pub fn fixed_sizer(fill: i32, max: i32) -> Sizer {
    Arc::new(move |_| (fill, max))
}

/// One token bucket. `count` may run negative down to `-max`.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    fill: i32,
    max: i32,
    count: i32,
    unused: u32,
}

struct Shared {
    buckets: Mutex<HashMap<u64, Bucket>>,
    sizer: Sizer,
    unused_ticks: u32,
    stats: Arc<CacheStats>,
}

impl Shared {
    /// One refill pass: top up every bucket and drop the ones idle for more
    /// than `unused_ticks` consecutive passes.
    fn sweep(&self) {
        let started = Instant::now();
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, b| {
            b.count = (b.count + b.fill).min(b.max);
            b.unused += 1;
            b.unused <= self.unused_ticks
        });
        let evicted = before - buckets.len();
        drop(buckets);

        if evicted > 0 {
            self.stats.record_evictions(evicted);
        }
        self.stats.sweep.record(started.elapsed().as_micros() as u64);
    }
}

/// Cache of token buckets with periodic refill and idle eviction.
///
/// All lookups and the sweep serialize on one mutex; the sweep is short
/// relative to its interval.
pub struct Cache {
    shared: Arc<Shared>,
    kind: &'static str,
    stop: Option<Sender<()>>,
    sweeper: Option<thread::JoinHandle<()>>,
}

impl Cache {
    /// Build a cache whose buckets gain `fill` tokens every `rate` and are
    /// evicted after more than `unused_ticks` sweeps without a check.
    pub fn new(
        kind: &'static str,
        rate: Duration,
        unused_ticks: u32,
        sizer: Sizer,
        stats: Arc<CacheStats>,
    ) -> RelayResult<Self> {
        let shared = Arc::new(Shared {
            buckets: Mutex::new(HashMap::new()),
            sizer,
            unused_ticks,
            stats,
        });
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let sweeper = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("sweep-{kind}"))
                .spawn(move || {
                    shared.stats.instances.fetch_add(1, Ordering::Relaxed);
                    let ticker = tick(rate);
                    loop {
                        select! {
                            recv(ticker) -> _ => shared.sweep(),
                            // Fires on send or on the sender being dropped.
                            recv(stop_rx) -> _ => break,
                        }
                    }
                    shared.stats.instances.fetch_sub(1, Ordering::Relaxed);
                })
                .map_err(|e| RelayError::Spawn(format!("{kind} sweeper: {e}")))?
        };

        Ok(Self {
            shared,
            kind,
            stop: Some(stop_tx),
            sweeper: Some(sweeper),
        })
    }

    /// Debit `tokens` from the bucket behind `fingerprint`, creating it via
    /// the sizer on first sight. Returns whether the request is admitted.
    ///
    /// A denied check still debits, down to `-max`.
    pub fn check(&self, ip: Ipv4Addr, fingerprint: u64, tokens: i32) -> bool {
        self.shared.stats.record_request();
        let mut buckets = self.shared.buckets.lock();
        let bucket = buckets.entry(fingerprint).or_insert_with(|| {
            self.shared.stats.record_miss();
            let (fill, max) = (self.shared.sizer)(ip);
            Bucket {
                fill,
                max,
                count: fill,
                unused: 0,
            }
        });
        bucket.unused = 0;
        bucket.count -= tokens;
        if bucket.count < -bucket.max {
            bucket.count = -bucket.max;
        }
        bucket.count >= 0
    }

    /// Number of live buckets
    pub fn len(&self) -> usize {
        self.shared.buckets.lock().len()
    }

    /// True if no bucket is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Halt the background sweep. Idempotent; a stopped cache still answers
    /// [`Cache::check`], its buckets just stop refilling and aging out.
    pub fn stop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.sweeper.take() {
            let _ = handle.join();
            tracing::debug!(kind = self.kind, "bucket sweeper stopped");
        }
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP: Ipv4Addr = Ipv4Addr::new(10, 1, 2, 3);

    /// Cache whose sweeper never fires on its own; tests drive sweeps.
    fn manual_cache(fill: i32, max: i32, unused_ticks: u32) -> Cache {
        Cache::new(
            "users",
            Duration::from_secs(3600),
            unused_ticks,
            fixed_sizer(fill, max),
            Arc::new(CacheStats::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_allows_until_bucket_empty() {
        let cache = manual_cache(5, 10, 5);
        let allowed = (0..11).filter(|_| cache.check(IP, 7, 1)).count();
        assert_eq!(allowed, 5);
    }

    #[test]
    fn test_denied_checks_accumulate_debt() {
        let cache = manual_cache(5, 10, 5);
        for _ in 0..100 {
            cache.check(IP, 7, 1);
        }
        // Debt floors at -max, so three fills of 5 recover the bucket.
        cache.shared.sweep();
        assert!(!cache.check(IP, 7, 0));
        cache.shared.sweep();
        cache.shared.sweep();
        assert!(cache.check(IP, 7, 0));
    }

    #[test]
    fn test_refill_caps_at_max() {
        let cache = manual_cache(5, 10, 5);
        cache.check(IP, 7, 1); // create, count = 4
        for _ in 0..10 {
            cache.shared.sweep();
        }
        // Capped at max=10, not 4 + 10*5.
        let allowed = (0..20).filter(|_| cache.check(IP, 7, 1)).count();
        assert_eq!(allowed, 10);
    }

    #[test]
    fn test_eviction_after_idle_ticks() {
        let cache = manual_cache(5, 10, 3);
        cache.check(IP, 7, 1);

        for _ in 0..3 {
            cache.shared.sweep();
            assert_eq!(cache.len(), 1);
        }
        cache.shared.sweep();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_check_resets_idle_age() {
        let cache = manual_cache(5, 10, 2);
        cache.check(IP, 7, 1);
        cache.shared.sweep();
        cache.shared.sweep();
        cache.check(IP, 7, 1); // back to unused = 0
        cache.shared.sweep();
        cache.shared.sweep();
        assert_eq!(cache.len(), 1);
        cache.shared.sweep();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_sizer_sees_client_ip() {
        let sizer: Sizer = Arc::new(|ip: Ipv4Addr| {
            if ip.octets()[0] == 10 {
                (1, 1)
            } else {
                (100, 100)
            }
        });
        let cache = Cache::new(
            "users",
            Duration::from_secs(3600),
            5,
            sizer,
            Arc::new(CacheStats::default()),
        )
        .unwrap();

        assert!(cache.check(IP, 1, 1));
        assert!(!cache.check(IP, 1, 1));
        assert!(cache.check(Ipv4Addr::new(192, 168, 0, 1), 2, 1));
        assert!(cache.check(Ipv4Addr::new(192, 168, 0, 1), 2, 1));
    }

    #[test]
    fn test_background_sweeper_refills() {
        let mut cache = Cache::new(
            "users",
            Duration::from_millis(10),
            1000,
            fixed_sizer(5, 10),
            Arc::new(CacheStats::default()),
        )
        .unwrap();

        while cache.check(IP, 7, 1) {}
        std::thread::sleep(Duration::from_millis(100));
        assert!(cache.check(IP, 7, 1));
        cache.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut cache = manual_cache(5, 10, 5);
        cache.check(IP, 7, 1);
        cache.stop();
        cache.stop();
        // Still answers checks after stop.
        assert!(cache.check(IP, 7, 1));
    }

    #[test]
    fn test_miss_and_request_counters() {
        let stats = Arc::new(CacheStats::default());
        let cache = Cache::new(
            "ports",
            Duration::from_secs(3600),
            5,
            fixed_sizer(5, 10),
            stats.clone(),
        )
        .unwrap();

        cache.check(IP, 1, 1);
        cache.check(IP, 1, 1);
        cache.check(IP, 2, 1);

        let snap = stats.snapshot();
        assert_eq!(snap.requests, 3);
        assert_eq!(snap.misses, 2);
        assert_eq!(snap.buckets, 2);
    }
}
