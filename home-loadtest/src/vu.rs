use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::scenario::Scenario;
use crate::statistics::Metrics;

#[derive(Clone)]
pub struct VuSignals {
    pub retire: CancellationToken,
    pub finish: CancellationToken,
    pub kill: CancellationToken,
    pub ramp_down_grace: Duration,
}

impl VuSignals {
    fn should_stop(&self) -> bool {
        self.retire.is_cancelled() || self.finish.is_cancelled() || self.kill.is_cancelled()
    }
}

/// Holds one slot of the `vus` gauge, released even if the VU task panics.
struct ActiveVu(Metrics);

impl ActiveVu {
    fn start(metrics: Metrics) -> Self {
        metrics.vu_started();
        Self(metrics)
    }
}

impl Drop for ActiveVu {
    fn drop(&mut self) {
        self.0.vu_stopped();
    }
}

/// Repeats the scenario until `retire`, `finish` or `kill` fires.
///
/// `retire` and `finish` let the running iteration complete, `retire` only
/// for up to `ramp_down_grace`. `kill` interrupts it immediately.
pub async fn vu_loop(id: usize, scenario: Arc<Scenario>, signals: VuSignals) {
    let active = ActiveVu::start(scenario.metrics().clone());
    let metrics = &active.0;
    tracing::debug!(vu = id, "started");

    let retire_deadline = async {
        signals.retire.cancelled().await;
        tokio::time::sleep(signals.ramp_down_grace).await;
    };
    tokio::pin!(retire_deadline);

    while !signals.should_stop() {
        let start = Instant::now();
        tokio::select! {
            biased;
            _ = signals.kill.cancelled() => {
                metrics.iteration_interrupted();
                break;
            }
            _ = &mut retire_deadline => {
                tracing::debug!(vu = id, "iteration interrupted by ramp-down");
                metrics.iteration_interrupted();
                break;
            }
            report = scenario.run_iteration() => {
                metrics.iteration_completed(start.elapsed());
                tracing::trace!(vu = id, passed = report.passed, failed = report.failed, "iteration done");
            }
        }
    }

    tracing::debug!(vu = id, "stopped");
}
