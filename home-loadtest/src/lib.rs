//! Staged load test of the home page APIs.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::HttpClient;
use crate::executor::RampingExecutor;
use crate::options::Options;
use crate::scenario::{Scenario, Targets, DEFAULT_SLEEP};
use crate::statistics::Metrics;
use crate::summary::{report_progress, Summary};
use crate::threshold::ThresholdMonitor;

pub mod cli;
pub mod client;
pub mod error;
pub mod executor;
pub mod options;
pub mod params;
pub mod scenario;
pub mod statistics;
pub mod summary;
pub mod threshold;
pub mod vu;

#[derive(Debug, Clone)]
pub struct TestPlan {
    pub options: Options,
    pub targets: Targets,
    pub sleep: Duration,
    pub report_interval: Option<Duration>,
}

impl Default for TestPlan {
    fn default() -> Self {
        Self {
            options: Options::default(),
            targets: Targets::default(),
            sleep: DEFAULT_SLEEP,
            report_interval: Some(Duration::from_secs(10)),
        }
    }
}

/// Runs the whole test. Cancelling `abort` interrupts every VU at once.
pub async fn run(plan: TestPlan, abort: CancellationToken) -> Summary {
    let TestPlan {
        options,
        targets,
        sleep,
        report_interval,
    } = plan;
    let total = options.total_duration();
    tracing::info!(
        app1 = %targets.app1,
        app2 = %targets.app2,
        stages = options.stages.len(),
        max_vus = options.max_vus(),
        duration = ?total,
        "starting load test"
    );

    let metrics = Metrics::new();
    let monitor = Arc::new(ThresholdMonitor::new(options.thresholds, abort.clone()));
    let scenario = Arc::new(Scenario::new(
        HttpClient::new(),
        targets,
        Arc::new(options.params),
        sleep,
        metrics.clone(),
        monitor.clone(),
    ));

    let reporter_stop = CancellationToken::new();
    let reporter = report_interval.filter(|every| !every.is_zero()).map(|every| {
        tokio::spawn(report_progress(
            metrics.clone(),
            every,
            total,
            reporter_stop.clone(),
        ))
    });

    let executor = RampingExecutor::new(
        options.stages,
        options.start_vus,
        options.graceful_ramp_down,
        options.graceful_stop,
    );
    let outcome = executor.run(scenario, abort).await;

    reporter_stop.cancel();
    if let Some(reporter) = reporter {
        if let Err(e) = reporter.await {
            tracing::warn!("progress reporter failed: {e}");
        }
    }

    let aborted = monitor
        .breach()
        .or_else(|| outcome.aborted.then(|| "run interrupted".to_string()));
    let thresholds = monitor.evaluate(&metrics);
    tracing::info!(
        aborted = aborted.is_some(),
        forced_stop = outcome.forced_stop,
        "load test finished"
    );
    Summary {
        metrics: metrics.snapshot(),
        thresholds,
        aborted,
    }
}
