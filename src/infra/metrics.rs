//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; `report()` swaps the periodic counters
//! to zero, `snapshot()` reads without resetting (used by the /metrics scrape).
//!
//! NOTE: All atomics use Relaxed ordering; these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Exponential bucket boundaries for saga latency (milliseconds)
/// Buckets: ≤1, ≤2, ≤4, ≤8, ≤16, ≤32, ≤64, ≤128, ≤256, ≤512, >512
const BUCKET_BOUNDS: [u64; 10] = [1, 2, 4, 8, 16, 32, 64, 128, 256, 512];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile).ceil() as u64;
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] = [1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    drivers_registered: AtomicU64,
    status_updates: AtomicU64,
    trips_created: AtomicU64,
    trips_completed: AtomicU64,
    /// CreateTrip rejected with no candidate
    no_driver_total: AtomicU64,
    reservation_failures: AtomicU64,
    pricing_failures: AtomicU64,
    /// CompleteTrip could not free its driver
    release_failures: AtomicU64,
    /// Compensating releases that succeeded (within the retry budget)
    compensations_total: AtomicU64,
    /// Compensating releases that exhausted retries and were dead-lettered
    releases_dead_lettered: AtomicU64,
    dead_letters_recovered: AtomicU64,
    events_published: AtomicU64,
    publish_failures: AtomicU64,
    events_consumed: AtomicU64,
    events_malformed: AtomicU64,
    broadcasts_total: AtomicU64,
    observers_connected: AtomicU64,
    observers_evicted: AtomicU64,
    rpc_requests: AtomicU64,
    /// Saga latency histogram, cumulative
    saga_latency_buckets: [AtomicU64; NUM_BUCKETS],
    saga_latency_sum_ms: AtomicU64,
    /// Periodic (reset on report)
    trips_since_report: AtomicU64,
    saga_latency_max_ms: AtomicU64,
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            drivers_registered: AtomicU64::new(0),
            status_updates: AtomicU64::new(0),
            trips_created: AtomicU64::new(0),
            trips_completed: AtomicU64::new(0),
            no_driver_total: AtomicU64::new(0),
            reservation_failures: AtomicU64::new(0),
            pricing_failures: AtomicU64::new(0),
            release_failures: AtomicU64::new(0),
            compensations_total: AtomicU64::new(0),
            releases_dead_lettered: AtomicU64::new(0),
            dead_letters_recovered: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            events_consumed: AtomicU64::new(0),
            events_malformed: AtomicU64::new(0),
            broadcasts_total: AtomicU64::new(0),
            observers_connected: AtomicU64::new(0),
            observers_evicted: AtomicU64::new(0),
            rpc_requests: AtomicU64::new(0),
            saga_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            saga_latency_sum_ms: AtomicU64::new(0),
            trips_since_report: AtomicU64::new(0),
            saga_latency_max_ms: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_driver_registered(&self) {
        self.drivers_registered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_status_update(&self) {
        self.status_updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful booking saga and its end-to-end latency
    #[inline]
    pub fn record_trip_created(&self, latency: Duration) {
        let latency_ms = latency.as_millis() as u64;
        self.trips_created.fetch_add(1, Ordering::Relaxed);
        self.trips_since_report.fetch_add(1, Ordering::Relaxed);
        self.saga_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.saga_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.saga_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_trip_completed(&self) {
        self.trips_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_no_driver(&self) {
        self.no_driver_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reservation_failure(&self) {
        self.reservation_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_pricing_failure(&self) {
        self.pricing_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_release_failure(&self) {
        self.release_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_compensation(&self) {
        self.compensations_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_release_dead_lettered(&self) {
        self.releases_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dead_letter_recovered(&self) {
        self.dead_letters_recovered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_consumed(&self) {
        self.events_consumed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_malformed(&self) {
        self.events_malformed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_broadcast(&self) {
        self.broadcasts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Set the current observer count (gauge)
    #[inline]
    pub fn set_observers(&self, count: u64) {
        self.observers_connected.store(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_observer_evicted(&self) {
        self.observers_evicted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rpc_request(&self) {
        self.rpc_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Calculate and return metrics summary, then reset periodic counters
    pub fn report(&self) -> MetricsSummary {
        self.summarize(true)
    }

    /// Same summary as `report()` without resetting anything
    pub fn snapshot(&self) -> MetricsSummary {
        self.summarize(false)
    }

    fn summarize(&self, reset: bool) -> MetricsSummary {
        let (trips_in_period, saga_max) = if reset {
            (
                self.trips_since_report.swap(0, Ordering::Relaxed),
                self.saga_latency_max_ms.swap(0, Ordering::Relaxed),
            )
        } else {
            (
                self.trips_since_report.load(Ordering::Relaxed),
                self.saga_latency_max_ms.load(Ordering::Relaxed),
            )
        };

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            if reset {
                *last = Instant::now();
            }
            elapsed
        };
        let trips_per_min = if elapsed.as_secs_f64() > 0.0 {
            trips_in_period as f64 * 60.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let saga_buckets = load_buckets(&self.saga_latency_buckets);
        let saga_count: u64 = saga_buckets.iter().sum();
        let saga_sum = self.saga_latency_sum_ms.load(Ordering::Relaxed);
        let saga_avg = if saga_count > 0 { saga_sum / saga_count } else { 0 };

        MetricsSummary {
            drivers_registered: self.drivers_registered.load(Ordering::Relaxed),
            status_updates: self.status_updates.load(Ordering::Relaxed),
            trips_created: self.trips_created.load(Ordering::Relaxed),
            trips_completed: self.trips_completed.load(Ordering::Relaxed),
            trips_per_min,
            no_driver_total: self.no_driver_total.load(Ordering::Relaxed),
            reservation_failures: self.reservation_failures.load(Ordering::Relaxed),
            pricing_failures: self.pricing_failures.load(Ordering::Relaxed),
            release_failures: self.release_failures.load(Ordering::Relaxed),
            compensations_total: self.compensations_total.load(Ordering::Relaxed),
            releases_dead_lettered: self.releases_dead_lettered.load(Ordering::Relaxed),
            dead_letters_recovered: self.dead_letters_recovered.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            events_consumed: self.events_consumed.load(Ordering::Relaxed),
            events_malformed: self.events_malformed.load(Ordering::Relaxed),
            broadcasts_total: self.broadcasts_total.load(Ordering::Relaxed),
            observers_connected: self.observers_connected.load(Ordering::Relaxed),
            observers_evicted: self.observers_evicted.load(Ordering::Relaxed),
            rpc_requests: self.rpc_requests.load(Ordering::Relaxed),
            saga_buckets,
            saga_sum_ms: saga_sum,
            saga_avg_ms: saga_avg,
            saga_max_ms: saga_max,
            saga_p50_ms: percentile_from_buckets(&saga_buckets, 0.50),
            saga_p99_ms: percentile_from_buckets(&saga_buckets, 0.99),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub drivers_registered: u64,
    pub status_updates: u64,
    pub trips_created: u64,
    pub trips_completed: u64,
    /// Trip creation rate over the last report period
    pub trips_per_min: f64,
    pub no_driver_total: u64,
    pub reservation_failures: u64,
    pub pricing_failures: u64,
    pub release_failures: u64,
    pub compensations_total: u64,
    pub releases_dead_lettered: u64,
    pub dead_letters_recovered: u64,
    pub events_published: u64,
    pub publish_failures: u64,
    pub events_consumed: u64,
    pub events_malformed: u64,
    pub broadcasts_total: u64,
    pub observers_connected: u64,
    pub observers_evicted: u64,
    pub rpc_requests: u64,
    /// Saga latency histogram buckets
    /// Bounds: ≤1, ≤2, ≤4, ≤8, ≤16, ≤32, ≤64, ≤128, ≤256, ≤512, >512 ms
    pub saga_buckets: [u64; NUM_BUCKETS],
    pub saga_sum_ms: u64,
    pub saga_avg_ms: u64,
    /// Max over the last report period
    pub saga_max_ms: u64,
    pub saga_p50_ms: u64,
    pub saga_p99_ms: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            drivers = %self.drivers_registered,
            trips_created = %self.trips_created,
            trips_completed = %self.trips_completed,
            trips_per_min = format!("{:.1}", self.trips_per_min),
            no_driver = %self.no_driver_total,
            pricing_failures = %self.pricing_failures,
            compensations = %self.compensations_total,
            dead_lettered = %self.releases_dead_lettered,
            events_published = %self.events_published,
            events_consumed = %self.events_consumed,
            events_malformed = %self.events_malformed,
            observers = %self.observers_connected,
            saga_p99_ms = %self.saga_p99_ms,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let summary = Metrics::new().report();
        assert_eq!(summary.trips_created, 0);
        assert_eq!(summary.saga_avg_ms, 0);
        assert_eq!(summary.saga_p99_ms, 0);
    }

    #[test]
    fn test_record_trip_created() {
        let metrics = Metrics::new();
        metrics.record_trip_created(Duration::from_millis(3));
        metrics.record_trip_created(Duration::from_millis(9));

        let summary = metrics.report();
        assert_eq!(summary.trips_created, 2);
        assert_eq!(summary.saga_avg_ms, 6);
        assert_eq!(summary.saga_max_ms, 9);
        assert_eq!(summary.saga_buckets[2], 1);
        assert_eq!(summary.saga_buckets[4], 1);
    }

    #[test]
    fn test_report_resets_periodic_only() {
        let metrics = Metrics::new();
        metrics.record_trip_created(Duration::from_millis(40));

        let first = metrics.report();
        assert_eq!(first.saga_max_ms, 40);

        let second = metrics.report();
        assert_eq!(second.saga_max_ms, 0);
        // Monotonic counters and the histogram survive
        assert_eq!(second.trips_created, 1);
        assert_eq!(second.saga_buckets.iter().sum::<u64>(), 1);
    }

    #[test]
    fn test_snapshot_does_not_reset() {
        let metrics = Metrics::new();
        metrics.record_trip_created(Duration::from_millis(40));
        assert_eq!(metrics.snapshot().saga_max_ms, 40);
        assert_eq!(metrics.snapshot().saga_max_ms, 40);
    }

    #[test]
    fn test_observer_gauge() {
        let metrics = Metrics::new();
        metrics.set_observers(3);
        metrics.record_observer_evicted();
        metrics.set_observers(2);

        let summary = metrics.report();
        assert_eq!(summary.observers_connected, 2);
        assert_eq!(summary.observers_evicted, 1);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    m.record_event_consumed();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.report().events_consumed, 10_000);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(1), 0);
        assert_eq!(bucket_index(2), 1);
        assert_eq!(bucket_index(3), 2);
        assert_eq!(bucket_index(512), 9);
        assert_eq!(bucket_index(513), 10);
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();
        for _ in 0..100 {
            metrics.record_trip_created(Duration::from_millis(10));
        }

        let summary = metrics.report();
        // All in bucket ≤16
        assert_eq!(summary.saga_p50_ms, 16);
        assert_eq!(summary.saga_p99_ms, 16);
    }
}
