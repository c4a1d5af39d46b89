//! Lock-free metric primitives for the packet hot path.

use std::sync::atomic::{AtomicU64, Ordering};

/// Relaxed atomic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// A counter at zero.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increment by one.
    #[inline(always)]
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by `value`.
    #[inline(always)]
    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    /// Current value.
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Bucket upper bounds in nanoseconds: 100µs, 500µs, 1ms, 5ms, 20ms,
/// 100ms, 500ms, and everything above.
const BUCKET_LIMITS_NS: [u64; 8] = [
    100_000,
    500_000,
    1_000_000,
    5_000_000,
    20_000_000,
    100_000_000,
    500_000_000,
    u64::MAX,
];

/// Lock-free histogram of TCP round-trip samples, in nanoseconds.
#[derive(Debug)]
pub struct RttHistogram {
    buckets: [AtomicU64; 8],
    count: AtomicU64,
    sum_ns: AtomicU64,
    min_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl RttHistogram {
    /// An empty histogram.
    pub const fn new() -> Self {
        Self {
            buckets: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
            count: AtomicU64::new(0),
            sum_ns: AtomicU64::new(0),
            min_ns: AtomicU64::new(u64::MAX),
            max_ns: AtomicU64::new(0),
        }
    }

    /// Record one sample.
    #[inline]
    pub fn record(&self, ns: u64) {
        let bucket = BUCKET_LIMITS_NS
            .iter()
            .position(|&limit| ns <= limit)
            .unwrap_or(BUCKET_LIMITS_NS.len() - 1);

        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ns.fetch_add(ns, Ordering::Relaxed);

        loop {
            let current = self.min_ns.load(Ordering::Relaxed);
            if ns >= current {
                break;
            }
            if self
                .min_ns
                .compare_exchange_weak(current, ns, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }

        loop {
            let current = self.max_ns.load(Ordering::Relaxed);
            if ns <= current {
                break;
            }
            if self
                .max_ns
                .compare_exchange_weak(current, ns, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Number of samples recorded.
    #[inline]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Approximate percentile (bucket upper bound, capped at the observed
    /// maximum).
    fn percentile(&self, p: f64) -> u64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        let target = ((count as f64) * p).ceil() as u64;
        let max = self.max_ns.load(Ordering::Relaxed);

        let mut cumulative = 0;
        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= target {
                return BUCKET_LIMITS_NS[i].min(max);
            }
        }
        max
    }

    /// Point-in-time view.
    pub fn snapshot(&self) -> RttSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        RttSnapshot {
            count,
            sum_ns: self.sum_ns.load(Ordering::Relaxed),
            min_ns: if count == 0 {
                0
            } else {
                self.min_ns.load(Ordering::Relaxed)
            },
            max_ns: self.max_ns.load(Ordering::Relaxed),
            p50_ns: self.percentile(0.50),
            p90_ns: self.percentile(0.90),
            p99_ns: self.percentile(0.99),
        }
    }
}

impl Default for RttHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Histogram snapshot.
#[derive(Debug, Clone)]
pub struct RttSnapshot {
    /// Samples recorded.
    pub count: u64,
    /// Sum of all samples.
    pub sum_ns: u64,
    /// Smallest sample, zero when empty.
    pub min_ns: u64,
    /// Largest sample.
    pub max_ns: u64,
    /// Approximate median.
    pub p50_ns: u64,
    /// Approximate 90th percentile.
    pub p90_ns: u64,
    /// Approximate 99th percentile.
    pub p99_ns: u64,
}
