use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::options::Stage;
use crate::scenario::Scenario;
use crate::vu::{vu_loop, VuSignals};

const TICK: Duration = Duration::from_millis(100);

/// Target VU count `elapsed` into the run, `None` once every stage is over.
#[must_use]
pub fn target_vus(stages: &[Stage], start_vus: usize, elapsed: Duration) -> Option<usize> {
    let mut from = start_vus;
    let mut stage_start = Duration::ZERO;
    for stage in stages {
        let stage_end = stage_start + stage.duration;
        if elapsed < stage_end {
            let into = (elapsed - stage_start).as_secs_f64();
            let progress = into / stage.duration.as_secs_f64();
            let value = from as f64 + (stage.target as f64 - from as f64) * progress;
            return Some(value.round() as usize);
        }
        from = stage.target;
        stage_start = stage_end;
    }
    None
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub aborted: bool,
    pub forced_stop: bool,
}

pub struct RampingExecutor {
    stages: Vec<Stage>,
    start_vus: usize,
    graceful_ramp_down: Duration,
    graceful_stop: Duration,
}

impl RampingExecutor {
    #[must_use]
    pub fn new(
        stages: Vec<Stage>,
        start_vus: usize,
        graceful_ramp_down: Duration,
        graceful_stop: Duration,
    ) -> Self {
        Self {
            stages,
            start_vus,
            graceful_ramp_down,
            graceful_stop,
        }
    }

    /// Drives the ramp until the last stage ends or `abort` is cancelled.
    pub async fn run(&self, scenario: Arc<Scenario>, abort: CancellationToken) -> ExecutionOutcome {
        let tracker = TaskTracker::new();
        let finish = CancellationToken::new();
        let kill = abort.child_token();
        let mut retire_tokens: Vec<CancellationToken> = Vec::new();
        let mut next_vu_id = 0usize;

        let started = Instant::now();
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = abort.cancelled() => break,
            }
            let Some(target) = target_vus(&self.stages, self.start_vus, started.elapsed()) else {
                break;
            };
            if target != retire_tokens.len() {
                tracing::debug!(from = retire_tokens.len(), to = target, "adjusting VUs");
            }
            while retire_tokens.len() < target {
                let retire = CancellationToken::new();
                let signals = VuSignals {
                    retire: retire.clone(),
                    finish: finish.clone(),
                    kill: kill.clone(),
                    ramp_down_grace: self.graceful_ramp_down,
                };
                tracker.spawn(vu_loop(next_vu_id, scenario.clone(), signals));
                retire_tokens.push(retire);
                next_vu_id += 1;
            }
            while retire_tokens.len() > target {
                if let Some(retire) = retire_tokens.pop() {
                    retire.cancel();
                }
            }
        }

        finish.cancel();
        tracker.close();

        let mut forced_stop = false;
        if !abort.is_cancelled() {
            tracing::info!(
                grace = ?self.graceful_stop,
                "stages complete, waiting for running iterations"
            );
            if tokio::time::timeout(self.graceful_stop, tracker.wait()).await.is_err() {
                tracing::warn!("graceful stop expired, interrupting remaining iterations");
                forced_stop = true;
                kill.cancel();
            }
        }
        tracker.wait().await;

        // An abort may also land while waiting on the graceful stop
        let aborted = abort.is_cancelled();
        ExecutionOutcome {
            aborted,
            forced_stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::HttpClient;
    use crate::params::RequestParams;
    use crate::scenario::Targets;
    use crate::statistics::Metrics;
    use crate::threshold::ThresholdMonitor;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn home_stages() -> Vec<Stage> {
        vec![
            Stage::new(secs(10), 1),
            Stage::new(secs(60), 5),
            Stage::new(secs(3600), 5),
        ]
    }

    #[test]
    fn stage_boundaries_hit_their_targets() {
        let stages = home_stages();
        assert_eq!(target_vus(&stages, 1, Duration::ZERO), Some(1));
        assert_eq!(target_vus(&stages, 1, secs(10)), Some(1));
        assert_eq!(target_vus(&stages, 1, secs(70)), Some(5));
        assert_eq!(target_vus(&stages, 1, secs(3669)), Some(5));
        assert_eq!(target_vus(&stages, 1, secs(3670)), None);
    }

    #[test]
    fn ramp_is_linear_within_a_stage() {
        let stages = home_stages();
        assert_eq!(target_vus(&stages, 1, secs(25)), Some(2));
        assert_eq!(target_vus(&stages, 1, secs(40)), Some(3));
        assert_eq!(target_vus(&stages, 1, secs(55)), Some(4));
    }

    #[test]
    fn ramp_down_and_start_from_zero() {
        let stages = vec![Stage::new(secs(10), 10), Stage::new(secs(10), 0)];
        assert_eq!(target_vus(&stages, 0, Duration::ZERO), Some(0));
        assert_eq!(target_vus(&stages, 0, secs(5)), Some(5));
        assert_eq!(target_vus(&stages, 0, secs(15)), Some(5));
        assert_eq!(target_vus(&stages, 0, Duration::from_millis(19_999)), Some(0));
    }

    #[test]
    fn zero_length_stage_is_skipped() {
        let stages = vec![Stage::new(Duration::ZERO, 7), Stage::new(secs(10), 7)];
        assert_eq!(target_vus(&stages, 1, Duration::ZERO), Some(7));
    }

    fn scenario(abort: &CancellationToken) -> Arc<Scenario> {
        pausing_scenario(abort, Duration::from_millis(50))
    }

    fn pausing_scenario(abort: &CancellationToken, sleep: Duration) -> Arc<Scenario> {
        let monitor = Arc::new(ThresholdMonitor::new(Vec::new(), abort.clone()));
        Arc::new(Scenario::new(
            HttpClient::new(),
            Targets::new("http://127.0.0.1:1", "http://127.0.0.1:1"),
            Arc::new(RequestParams::default()),
            sleep,
            Metrics::new(),
            monitor,
        ))
    }

    #[tokio::test]
    async fn abort_stops_every_vu() {
        let abort = CancellationToken::new();
        let scenario = scenario(&abort);
        let executor = RampingExecutor::new(vec![Stage::new(secs(3600), 3)], 3, secs(30), secs(30));

        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });
        let outcome = tokio::time::timeout(secs(10), executor.run(scenario.clone(), abort))
            .await
            .expect("executor ignored abort");
        assert!(outcome.aborted);
        let snap = scenario.metrics().snapshot();
        assert_eq!(snap.vus, 0);
        assert_eq!(snap.vus_max, 3);
    }

    #[tokio::test]
    async fn short_run_ends_after_its_stages() {
        let abort = CancellationToken::new();
        let scenario = scenario(&abort);
        let executor = RampingExecutor::new(
            vec![Stage::new(Duration::from_millis(400), 2)],
            2,
            secs(30),
            secs(30),
        );
        let outcome = tokio::time::timeout(secs(10), executor.run(scenario.clone(), abort))
            .await
            .expect("executor did not finish");
        assert!(!outcome.aborted);
        assert!(!outcome.forced_stop);
        let snap = scenario.metrics().snapshot();
        assert_eq!(snap.vus, 0);
        assert!(snap.iterations >= 2);
        assert_eq!(snap.interrupted_iterations, 0);
        assert_eq!(snap.http_reqs, snap.iterations * 6);
    }

    #[tokio::test]
    async fn expired_graceful_stop_interrupts_iterations() {
        let abort = CancellationToken::new();
        let scenario = pausing_scenario(&abort, secs(3600));
        let executor = RampingExecutor::new(
            vec![Stage::new(Duration::from_millis(200), 2)],
            2,
            secs(30),
            Duration::from_millis(200),
        );
        let outcome = tokio::time::timeout(secs(10), executor.run(scenario.clone(), abort))
            .await
            .expect("graceful stop was not enforced");
        assert!(outcome.forced_stop);
        assert!(!outcome.aborted);
        let snap = scenario.metrics().snapshot();
        assert_eq!(snap.vus, 0);
        assert_eq!(snap.iterations, 0);
        assert_eq!(snap.interrupted_iterations, 2);
    }

    #[tokio::test]
    async fn abort_during_graceful_stop_is_reported() {
        let abort = CancellationToken::new();
        let scenario = pausing_scenario(&abort, secs(3600));
        let executor =
            RampingExecutor::new(vec![Stage::new(Duration::from_millis(200), 1)], 1, secs(30), secs(30));
        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(600)).await;
            trigger.cancel();
        });
        let outcome = tokio::time::timeout(secs(10), executor.run(scenario.clone(), abort))
            .await
            .expect("executor ignored abort");
        assert!(outcome.aborted);
        assert!(!outcome.forced_stop);
        assert_eq!(scenario.metrics().snapshot().interrupted_iterations, 1);
    }

    #[tokio::test]
    async fn ramp_down_retires_vus_before_the_run_ends() {
        let abort = CancellationToken::new();
        let scenario = pausing_scenario(&abort, secs(3600));
        let executor = RampingExecutor::new(
            vec![Stage::new(secs(1), 0), Stage::new(secs(2), 0)],
            2,
            Duration::from_millis(100),
            secs(30),
        );
        let run = tokio::spawn({
            let scenario = scenario.clone();
            async move { executor.run(scenario, abort).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scenario.metrics().snapshot().vus, 2);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(scenario.metrics().snapshot().vus, 0);
        assert!(!run.is_finished());

        let outcome = tokio::time::timeout(secs(10), run)
            .await
            .expect("executor did not finish")
            .unwrap();
        assert!(!outcome.forced_stop);
        let snap = scenario.metrics().snapshot();
        assert_eq!(snap.vus_max, 2);
        assert_eq!(snap.interrupted_iterations, 2);
    }
}
