use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::OptionsError;
use crate::statistics::Metrics;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricName {
    HttpReqs,
    HttpReqFailed,
    HttpReqDuration,
    Checks,
    Iterations,
    IterationDuration,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
}

impl MetricName {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::HttpReqs => "http_reqs",
            MetricName::HttpReqFailed => "http_req_failed",
            MetricName::HttpReqDuration => "http_req_duration",
            MetricName::Checks => "checks",
            MetricName::Iterations => "iterations",
            MetricName::IterationDuration => "iteration_duration",
        }
    }

    #[must_use]
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricName::HttpReqs | MetricName::Iterations => MetricKind::Counter,
            MetricName::HttpReqFailed | MetricName::Checks => MetricKind::Rate,
            MetricName::HttpReqDuration | MetricName::IterationDuration => MetricKind::Trend,
        }
    }

    #[must_use]
    pub fn supports(&self, aggregation: Aggregation) -> bool {
        match self.kind() {
            MetricKind::Counter => matches!(aggregation, Aggregation::Count | Aggregation::Rate),
            MetricKind::Rate => aggregation == Aggregation::Rate,
            MetricKind::Trend => matches!(
                aggregation,
                Aggregation::Avg
                    | Aggregation::Min
                    | Aggregation::Max
                    | Aggregation::Med
                    | Aggregation::Percentile(_)
            ),
        }
    }
}

impl FromStr for MetricName {
    type Err = OptionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "http_reqs" => Ok(MetricName::HttpReqs),
            "http_req_failed" => Ok(MetricName::HttpReqFailed),
            "http_req_duration" => Ok(MetricName::HttpReqDuration),
            "checks" => Ok(MetricName::Checks),
            "iterations" => Ok(MetricName::Iterations),
            "iteration_duration" => Ok(MetricName::IterationDuration),
            other => Err(OptionsError::UnknownMetric(other.to_string())),
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Aggregation {
    Rate,
    Count,
    Avg,
    Min,
    Max,
    Med,
    /// Percentile in `0..=100`.
    Percentile(f64),
}

impl Aggregation {
    fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        match s {
            "rate" => Some(Aggregation::Rate),
            "count" => Some(Aggregation::Count),
            "avg" => Some(Aggregation::Avg),
            "min" => Some(Aggregation::Min),
            "max" => Some(Aggregation::Max),
            "med" => Some(Aggregation::Med),
            _ => {
                let inner = s.strip_prefix("p(")?.strip_suffix(')')?;
                let p: f64 = inner.trim().parse().ok()?;
                (0.0..=100.0).contains(&p).then_some(Aggregation::Percentile(p))
            }
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Rate => f.write_str("rate"),
            Aggregation::Count => f.write_str("count"),
            Aggregation::Avg => f.write_str("avg"),
            Aggregation::Min => f.write_str("min"),
            Aggregation::Max => f.write_str("max"),
            Aggregation::Med => f.write_str("med"),
            Aggregation::Percentile(p) => write!(f, "p({p})"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    // Two-character operators first so `<=` is not read as `<`.
    const OPERATORS: [(&'static str, Comparison); 6] = [
        ("<=", Comparison::Le),
        (">=", Comparison::Ge),
        ("==", Comparison::Eq),
        ("!=", Comparison::Ne),
        ("<", Comparison::Lt),
        (">", Comparison::Gt),
    ];

    #[must_use]
    pub fn holds(&self, observed: f64, limit: f64) -> bool {
        match self {
            Comparison::Lt => observed < limit,
            Comparison::Le => observed <= limit,
            Comparison::Gt => observed > limit,
            Comparison::Ge => observed >= limit,
            Comparison::Eq => (observed - limit).abs() < f64::EPSILON,
            Comparison::Ne => (observed - limit).abs() >= f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub metric: MetricName,
    /// The expression as written in the options.
    pub source: String,
    pub aggregation: Aggregation,
    pub comparison: Comparison,
    pub limit: f64,
    pub abort_on_fail: bool,
    pub delay_abort_eval: Option<Duration>,
}

impl Threshold {
    /// Parses `<aggregation> <op> <value>`, e.g. `rate<0.1` or `p(95) < 500`.
    pub fn parse(metric: &str, expression: &str) -> Result<Self, OptionsError> {
        let metric_name: MetricName = metric.parse()?;
        let invalid = |reason: &str| OptionsError::InvalidThreshold {
            metric: metric.to_string(),
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let op_start = expression
            .find(['<', '>', '=', '!'])
            .ok_or_else(|| invalid("missing comparison operator"))?;
        let (lhs, rest) = expression.split_at(op_start);
        let (op, comparison) = Comparison::OPERATORS
            .iter()
            .find(|(op, _)| rest.starts_with(op))
            .ok_or_else(|| invalid("unknown comparison operator"))?;
        let rhs = &rest[op.len()..];

        let aggregation = Aggregation::parse(lhs).ok_or_else(|| invalid("unknown aggregation"))?;
        if !metric_name.supports(aggregation) {
            return Err(OptionsError::UnsupportedAggregation {
                metric: metric_name.to_string(),
                aggregation: aggregation.to_string(),
            });
        }
        let limit: f64 = rhs
            .trim()
            .parse()
            .map_err(|_| invalid("threshold value is not a number"))?;

        Ok(Self {
            metric: metric_name,
            source: expression.trim().to_string(),
            aggregation,
            comparison: *comparison,
            limit,
            abort_on_fail: false,
            delay_abort_eval: None,
        })
    }

    #[must_use]
    pub fn with_abort(mut self, abort_on_fail: bool, delay_abort_eval: Option<Duration>) -> Self {
        self.abort_on_fail = abort_on_fail;
        self.delay_abort_eval = delay_abort_eval;
        self
    }

    /// A metric without samples yet has nothing to fail on.
    #[must_use]
    pub fn passes(&self, observed: Option<f64>) -> bool {
        observed.map_or(true, |value| self.comparison.holds(value, self.limit))
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub observed: Option<f64>,
    pub passed: bool,
    pub abort_on_fail: bool,
}

/// Watches abort-on-fail thresholds and cancels the run when one breaks.
pub struct ThresholdMonitor {
    thresholds: Vec<Threshold>,
    abort: CancellationToken,
    started: Instant,
    breach: Mutex<Option<String>>,
}

impl ThresholdMonitor {
    #[must_use]
    pub fn new(thresholds: Vec<Threshold>, abort: CancellationToken) -> Self {
        Self {
            thresholds,
            abort,
            started: Instant::now(),
            breach: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn thresholds(&self) -> &[Threshold] {
        &self.thresholds
    }

    /// Checks the abort-on-fail rules against the current totals.
    pub fn observe(&self, metrics: &Metrics) {
        if self.abort.is_cancelled() {
            return;
        }
        let elapsed = self.started.elapsed();
        for threshold in self.thresholds.iter().filter(|t| t.abort_on_fail) {
            if threshold
                .delay_abort_eval
                .is_some_and(|delay| elapsed < delay)
            {
                continue;
            }
            let observed = metrics.aggregate(threshold.metric, threshold.aggregation);
            if threshold.passes(observed) {
                continue;
            }
            let reason = format!(
                "threshold '{}' on {} crossed (observed {:.4})",
                threshold.source,
                threshold.metric,
                observed.unwrap_or_default()
            );
            let mut breach = self.breach.lock();
            if breach.is_none() {
                tracing::warn!(%reason, "aborting run");
                *breach = Some(reason);
            }
            drop(breach);
            self.abort.cancel();
            return;
        }
    }

    #[must_use]
    pub fn breach(&self) -> Option<String> {
        self.breach.lock().clone()
    }

    #[must_use]
    pub fn evaluate(&self, metrics: &Metrics) -> Vec<ThresholdResult> {
        self.thresholds
            .iter()
            .map(|threshold| {
                let observed = metrics.aggregate(threshold.metric, threshold.aggregation);
                ThresholdResult {
                    metric: threshold.metric.to_string(),
                    expression: threshold.source.clone(),
                    observed,
                    passed: threshold.passes(observed),
                    abort_on_fail: threshold.abort_on_fail,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_failure_rate_rule() {
        let t = Threshold::parse("http_req_failed", "rate<0.1").unwrap();
        assert_eq!(t.metric, MetricName::HttpReqFailed);
        assert_eq!(t.aggregation, Aggregation::Rate);
        assert_eq!(t.comparison, Comparison::Lt);
        assert_eq!(t.limit, 0.1);
        assert!(!t.abort_on_fail);
    }

    #[test]
    fn parses_percentile_with_spaces() {
        let t = Threshold::parse("http_req_duration", "p(99.9) <= 750").unwrap();
        assert_eq!(t.aggregation, Aggregation::Percentile(99.9));
        assert_eq!(t.comparison, Comparison::Le);
        assert_eq!(t.limit, 750.0);
        assert_eq!(t.source, "p(99.9) <= 750");
    }

    #[test]
    fn every_operator_parses() {
        for (expr, cmp) in [
            ("count<1", Comparison::Lt),
            ("count<=1", Comparison::Le),
            ("count>1", Comparison::Gt),
            ("count>=1", Comparison::Ge),
            ("count==1", Comparison::Eq),
            ("count!=1", Comparison::Ne),
        ] {
            assert_eq!(Threshold::parse("iterations", expr).unwrap().comparison, cmp, "{expr}");
        }
    }

    #[test]
    fn comparisons_hold() {
        assert!(Comparison::Lt.holds(0.05, 0.1));
        assert!(!Comparison::Lt.holds(0.1, 0.1));
        assert!(Comparison::Le.holds(0.1, 0.1));
        assert!(Comparison::Gt.holds(2.0, 1.0));
        assert!(Comparison::Ge.holds(1.0, 1.0));
        assert!(Comparison::Eq.holds(3.0, 3.0));
        assert!(Comparison::Ne.holds(3.0, 4.0));
    }

    #[test]
    fn rejects_unknown_metric() {
        let err = Threshold::parse("http_req_blocked", "avg<10").unwrap_err();
        assert!(matches!(err, OptionsError::UnknownMetric(_)));
    }

    #[test]
    fn rejects_aggregation_the_metric_does_not_have() {
        let err = Threshold::parse("http_req_failed", "p(95)<0.1").unwrap_err();
        assert!(matches!(err, OptionsError::UnsupportedAggregation { .. }));
        let err = Threshold::parse("http_req_duration", "rate<0.1").unwrap_err();
        assert!(matches!(err, OptionsError::UnsupportedAggregation { .. }));
    }

    #[test]
    fn rejects_malformed_expressions() {
        for expr in ["rate", "rate<", "rate<abc", "rate=>0.1", "p(101)<5", "mean<4"] {
            let metric = if expr.starts_with("rate") { "checks" } else { "http_req_duration" };
            assert!(Threshold::parse(metric, expr).is_err(), "{expr}");
        }
    }

    #[test]
    fn missing_samples_pass() {
        let t = Threshold::parse("http_req_failed", "rate<0.1").unwrap();
        assert!(t.passes(None));
        assert!(t.passes(Some(0.0)));
        assert!(!t.passes(Some(0.1)));
    }

    #[test]
    fn monitor_aborts_on_breached_rule() {
        let metrics = Metrics::new();
        let abort = CancellationToken::new();
        let rule = Threshold::parse("http_req_failed", "rate<0.1")
            .unwrap()
            .with_abort(true, None);
        let monitor = ThresholdMonitor::new(vec![rule], abort.clone());

        for _ in 0..9 {
            metrics.record_response(200, Duration::from_millis(3));
        }
        monitor.observe(&metrics);
        assert!(!abort.is_cancelled());

        metrics.record_response(500, Duration::from_millis(3));
        monitor.observe(&metrics);
        assert!(abort.is_cancelled());
        assert!(monitor.breach().unwrap().contains("rate<0.1"));
    }

    #[test]
    fn monitor_ignores_rules_without_abort() {
        let metrics = Metrics::new();
        let abort = CancellationToken::new();
        let rule = Threshold::parse("http_req_failed", "rate<0.1").unwrap();
        let monitor = ThresholdMonitor::new(vec![rule], abort.clone());

        metrics.record_response(0, Duration::from_millis(1));
        monitor.observe(&metrics);
        assert!(!abort.is_cancelled());

        let results = monitor.evaluate(&metrics);
        assert_eq!(results.len(), 1);
        assert!(!results[0].passed);
        assert_eq!(results[0].observed, Some(1.0));
    }

    #[test]
    fn monitor_honours_abort_delay() {
        let metrics = Metrics::new();
        let abort = CancellationToken::new();
        let rule = Threshold::parse("http_req_failed", "rate<0.1")
            .unwrap()
            .with_abort(true, Some(Duration::from_secs(3600)));
        let monitor = ThresholdMonitor::new(vec![rule], abort.clone());

        metrics.record_response(503, Duration::from_millis(1));
        monitor.observe(&metrics);
        assert!(!abort.is_cancelled());
        assert!(monitor.breach().is_none());
    }
}
