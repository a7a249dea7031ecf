use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use parking_lot::Mutex;

use crate::threshold::{Aggregation, MetricName};

#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    started: Instant,
    http_reqs: AtomicU64,
    http_req_failed: AtomicU64,
    check_passes: AtomicU64,
    check_fails: AtomicU64,
    iterations: AtomicU64,
    interrupted_iterations: AtomicU64,
    vus: AtomicUsize,
    vus_max: AtomicUsize,
    checks: Mutex<BTreeMap<String, CheckCounts>>,
    status_codes: Mutex<BTreeMap<u16, u64>>,
    // Microseconds
    req_duration: Mutex<Histogram<u64>>,
    iteration_duration: Mutex<Histogram<u64>>,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CheckCounts {
    pub passes: u64,
    pub fails: u64,
}

/// Whether a response counts towards `http_req_failed`.
///
/// Status 0 stands for a request that never got a response.
#[inline]
#[must_use]
pub fn is_failed_status(status: u16) -> bool {
    !(200..=399).contains(&status)
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        // Auto-resizing, 3 significant digits
        let req_hist = Histogram::new(3).expect("Failed to create request duration histogram");
        let iter_hist = Histogram::new(3).expect("Failed to create iteration duration histogram");
        Self {
            inner: Arc::new(MetricsInner {
                started: Instant::now(),
                http_reqs: AtomicU64::new(0),
                http_req_failed: AtomicU64::new(0),
                check_passes: AtomicU64::new(0),
                check_fails: AtomicU64::new(0),
                iterations: AtomicU64::new(0),
                interrupted_iterations: AtomicU64::new(0),
                vus: AtomicUsize::new(0),
                vus_max: AtomicUsize::new(0),
                checks: Mutex::new(BTreeMap::new()),
                status_codes: Mutex::new(BTreeMap::new()),
                req_duration: Mutex::new(req_hist),
                iteration_duration: Mutex::new(iter_hist),
            }),
        }
    }

    pub fn record_response(&self, status: u16, duration: Duration) {
        self.inner.http_reqs.fetch_add(1, Ordering::AcqRel);
        if is_failed_status(status) {
            self.inner.http_req_failed.fetch_add(1, Ordering::AcqRel);
        }
        *self.inner.status_codes.lock().entry(status).or_default() += 1;
        self.inner
            .req_duration
            .lock()
            .saturating_record(as_micros(duration));
    }

    pub fn record_check(&self, name: &str, passed: bool) {
        if passed {
            self.inner.check_passes.fetch_add(1, Ordering::AcqRel);
        } else {
            self.inner.check_fails.fetch_add(1, Ordering::AcqRel);
        }
        let bump = |counts: &mut CheckCounts| {
            if passed {
                counts.passes += 1;
            } else {
                counts.fails += 1;
            }
        };
        let mut checks = self.inner.checks.lock();
        if let Some(counts) = checks.get_mut(name) {
            bump(counts);
        } else {
            bump(checks.entry(name.to_string()).or_default());
        }
    }

    pub fn iteration_completed(&self, duration: Duration) {
        self.inner.iterations.fetch_add(1, Ordering::AcqRel);
        self.inner
            .iteration_duration
            .lock()
            .saturating_record(as_micros(duration));
    }

    pub fn iteration_interrupted(&self) {
        self.inner
            .interrupted_iterations
            .fetch_add(1, Ordering::AcqRel);
    }

    pub fn vu_started(&self) {
        let now = self.inner.vus.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.vus_max.fetch_max(now, Ordering::AcqRel);
    }

    pub fn vu_stopped(&self) {
        self.inner.vus.fetch_sub(1, Ordering::AcqRel);
    }

    #[inline]
    #[must_use]
    pub fn vus(&self) -> usize {
        self.inner.vus.load(Ordering::Acquire)
    }

    #[inline]
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// Current value of `aggregation` over `metric`, `None` while there is no data.
    ///
    /// Trend values are in milliseconds, counter rates per second.
    #[must_use]
    pub fn aggregate(&self, metric: MetricName, aggregation: Aggregation) -> Option<f64> {
        let load = |counter: &AtomicU64| counter.load(Ordering::Acquire);
        match (metric, aggregation) {
            (MetricName::HttpReqFailed, Aggregation::Rate) => ratio(
                load(&self.inner.http_req_failed),
                load(&self.inner.http_reqs),
            ),
            (MetricName::Checks, Aggregation::Rate) => {
                let passes = load(&self.inner.check_passes);
                ratio(passes, passes + load(&self.inner.check_fails))
            }
            (MetricName::HttpReqs, Aggregation::Count) => Some(load(&self.inner.http_reqs) as f64),
            (MetricName::HttpReqs, Aggregation::Rate) => {
                self.per_second(load(&self.inner.http_reqs))
            }
            (MetricName::Iterations, Aggregation::Count) => {
                Some(load(&self.inner.iterations) as f64)
            }
            (MetricName::Iterations, Aggregation::Rate) => {
                self.per_second(load(&self.inner.iterations))
            }
            (MetricName::HttpReqDuration, aggregation) => {
                trend_value(&self.inner.req_duration.lock(), aggregation)
            }
            (MetricName::IterationDuration, aggregation) => {
                trend_value(&self.inner.iteration_duration.lock(), aggregation)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Acquire);
        let http_reqs = load(&self.inner.http_reqs);
        let failed = load(&self.inner.http_req_failed);
        let check_passes = load(&self.inner.check_passes);
        let check_total = check_passes + load(&self.inner.check_fails);
        let iterations = load(&self.inner.iterations);
        MetricsSnapshot {
            elapsed_secs: self.elapsed().as_secs_f64(),
            http_reqs,
            http_reqs_per_sec: self.per_second(http_reqs).unwrap_or_default(),
            http_req_failed: RateStats::new(failed, http_reqs),
            http_req_duration: TrendStats::from_histogram(&self.inner.req_duration.lock()),
            checks: RateStats::new(check_passes, check_total),
            check_counts: self.inner.checks.lock().clone(),
            iterations,
            iterations_per_sec: self.per_second(iterations).unwrap_or_default(),
            interrupted_iterations: load(&self.inner.interrupted_iterations),
            iteration_duration: TrendStats::from_histogram(&self.inner.iteration_duration.lock()),
            vus: self.inner.vus.load(Ordering::Acquire),
            vus_max: self.inner.vus_max.load(Ordering::Acquire),
            status_codes: self.inner.status_codes.lock().clone(),
        }
    }

    fn per_second(&self, count: u64) -> Option<f64> {
        let secs = self.elapsed().as_secs_f64();
        (secs > 0.0).then(|| count as f64 / secs)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn as_micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

fn ratio(hits: u64, total: u64) -> Option<f64> {
    (total > 0).then(|| hits as f64 / total as f64)
}

fn trend_value(hist: &Histogram<u64>, aggregation: Aggregation) -> Option<f64> {
    if hist.len() == 0 {
        return None;
    }
    let micros = match aggregation {
        Aggregation::Avg => hist.mean(),
        Aggregation::Min => hist.min() as f64,
        Aggregation::Max => hist.max() as f64,
        Aggregation::Med => hist.value_at_quantile(0.5) as f64,
        Aggregation::Percentile(p) => hist.value_at_quantile(p / 100.0) as f64,
        Aggregation::Rate | Aggregation::Count => return None,
    };
    Some(micros / 1000.0)
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub elapsed_secs: f64,
    pub http_reqs: u64,
    pub http_reqs_per_sec: f64,
    pub http_req_failed: RateStats,
    pub http_req_duration: Option<TrendStats>,
    pub checks: RateStats,
    pub check_counts: BTreeMap<String, CheckCounts>,
    pub iterations: u64,
    pub iterations_per_sec: f64,
    pub interrupted_iterations: u64,
    pub iteration_duration: Option<TrendStats>,
    pub vus: usize,
    pub vus_max: usize,
    pub status_codes: BTreeMap<u16, u64>,
}

#[derive(Debug, Copy, Clone, PartialEq, serde::Serialize)]
pub struct RateStats {
    pub hits: u64,
    pub total: u64,
    pub rate: f64,
}

impl RateStats {
    fn new(hits: u64, total: u64) -> Self {
        Self {
            hits,
            total,
            rate: ratio(hits, total).unwrap_or_default(),
        }
    }
}

/// Latency summary in milliseconds.
#[derive(Debug, Copy, Clone, PartialEq, serde::Serialize)]
pub struct TrendStats {
    pub avg: f64,
    pub min: f64,
    pub med: f64,
    pub max: f64,
    pub p90: f64,
    pub p95: f64,
    pub count: u64,
}

impl TrendStats {
    fn from_histogram(hist: &Histogram<u64>) -> Option<Self> {
        if hist.len() == 0 {
            return None;
        }
        let ms = |micros: u64| micros as f64 / 1000.0;
        Some(Self {
            avg: hist.mean() / 1000.0,
            min: ms(hist.min()),
            med: ms(hist.value_at_quantile(0.5)),
            max: ms(hist.max()),
            p90: ms(hist.value_at_quantile(0.9)),
            p95: ms(hist.value_at_quantile(0.95)),
            count: hist.len(),
        })
    }
}
