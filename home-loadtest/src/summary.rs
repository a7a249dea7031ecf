use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::statistics::{Metrics, MetricsSnapshot, TrendStats};
use crate::threshold::ThresholdResult;

/// Logs a progress line every `every` until `stop` is cancelled.
pub async fn report_progress(
    metrics: Metrics,
    every: Duration,
    total: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    // First tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.cancelled() => return,
        }
        let snap = metrics.snapshot();
        tracing::info!(
            elapsed = %format_secs(snap.elapsed_secs),
            total = %format_secs(total.as_secs_f64()),
            vus = snap.vus,
            iterations = snap.iterations,
            http_reqs = snap.http_reqs,
            failed_rate = %format!("{:.2}%", snap.http_req_failed.rate * 100.0),
            "progress"
        );
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Summary {
    pub metrics: MetricsSnapshot,
    pub thresholds: Vec<ThresholdResult>,
    pub aborted: Option<String>,
}

impl Summary {
    /// True when the run was not aborted and every threshold held.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.aborted.is_none() && self.thresholds.iter().all(|t| t.passed)
    }

    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(self).context("Failed to serialize summary")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write summary to {}", path.display()))
    }

    #[must_use]
    pub fn render(&self) -> String {
        let m = &self.metrics;
        let mut out = String::new();
        let _ = writeln!(out);

        for (name, counts) in &m.check_counts {
            let total = counts.passes + counts.fails;
            let mark = if counts.fails == 0 { '✓' } else { '✗' };
            let pct = if total > 0 {
                counts.passes as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            let _ = writeln!(
                out,
                "     {mark} {name}\n      ↳  {pct:.0}% ✓ {} / ✗ {}",
                counts.passes, counts.fails
            );
        }
        if !m.check_counts.is_empty() {
            let _ = writeln!(out);
        }

        let threshold_mark = |metric: &str| -> &'static str {
            let mut relevant = self.thresholds.iter().filter(|t| t.metric == metric).peekable();
            if relevant.peek().is_none() {
                "  "
            } else if relevant.all(|t| t.passed) {
                "✓ "
            } else {
                "✗ "
            }
        };

        let mut line = |mark: &str, name: &str, value: String| {
            let _ = writeln!(out, "   {mark}{name:.<28}: {value}");
        };
        line(
            threshold_mark("checks"),
            "checks",
            format!(
                "{:.2}% ✓ {} ✗ {}",
                m.checks.rate * 100.0,
                m.checks.hits,
                m.checks.total - m.checks.hits
            ),
        );
        line(
            threshold_mark("http_req_duration"),
            "http_req_duration",
            format_trend(m.http_req_duration.as_ref()),
        );
        line(
            threshold_mark("http_req_failed"),
            "http_req_failed",
            format!(
                "{:.2}% ✓ {} ✗ {}",
                m.http_req_failed.rate * 100.0,
                m.http_req_failed.hits,
                m.http_req_failed.total - m.http_req_failed.hits
            ),
        );
        line(
            threshold_mark("http_reqs"),
            "http_reqs",
            format!("{} {:.2}/s", m.http_reqs, m.http_reqs_per_sec),
        );
        line(
            threshold_mark("iteration_duration"),
            "iteration_duration",
            format_trend(m.iteration_duration.as_ref()),
        );
        line(
            threshold_mark("iterations"),
            "iterations",
            format!("{} {:.2}/s", m.iterations, m.iterations_per_sec),
        );
        if m.interrupted_iterations > 0 {
            line("  ", "interrupted_iterations", m.interrupted_iterations.to_string());
        }
        line("  ", "vus_max", m.vus_max.to_string());
        let codes = m
            .status_codes
            .iter()
            .map(|(code, n)| format!("{code}={n}"))
            .collect::<Vec<_>>()
            .join(" ");
        line("  ", "status_codes", codes);

        if !self.thresholds.is_empty() {
            let _ = writeln!(out, "\n   thresholds:");
            for t in &self.thresholds {
                let mark = if t.passed { '✓' } else { '✗' };
                let observed = t
                    .observed
                    .map_or_else(|| "no data".to_string(), |v| format!("{v:.4}"));
                let _ = writeln!(
                    out,
                    "     {mark} {} '{}' (observed {observed}{})",
                    t.metric,
                    t.expression,
                    if t.abort_on_fail { ", abortOnFail" } else { "" }
                );
            }
        }

        let _ = writeln!(out, "\n   duration: {}", format_secs(m.elapsed_secs));
        match &self.aborted {
            Some(reason) => {
                let _ = writeln!(out, "   run aborted: {reason}");
            }
            None if !self.passed() => {
                let _ = writeln!(out, "   some thresholds have failed");
            }
            None => {}
        }
        out
    }
}

fn format_trend(trend: Option<&TrendStats>) -> String {
    match trend {
        Some(t) => format!(
            "avg={:.2}ms min={:.2}ms med={:.2}ms max={:.2}ms p(90)={:.2}ms p(95)={:.2}ms",
            t.avg, t.min, t.med, t.max, t.p90, t.p95
        ),
        None => "no data".to_string(),
    }
}

fn format_secs(secs: f64) -> String {
    let whole = secs as u64;
    format!("{:02}:{:02}:{:02}", whole / 3600, (whole % 3600) / 60, whole % 60)
}
