use std::sync::Arc;
use std::time::Duration;

use hyper::Method;

use crate::client::{HttpClient, HttpResponse};
use crate::params::RequestParams;
use crate::statistics::Metrics;
use crate::threshold::ThresholdMonitor;

pub const STATUS_CHECK: &str = "status was 200";
pub const ITEM_CODES: [&str; 2] = ["I-015503", "I-060546"];
pub const DEFAULT_SLEEP: Duration = Duration::from_secs(1);

const TILES_PATH: &str = "/api/v1/home/products/tiles";
const WISHLIST_PATH: &str = "/api/v1/home/wishlist/items";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: String,
}

impl RequestDescriptor {
    #[must_use]
    pub fn get(url: String) -> Self {
        Self {
            method: Method::GET,
            url,
        }
    }
}

/// Base URLs of the two apps under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Targets {
    pub app1: String,
    pub app2: String,
}

impl Targets {
    #[must_use]
    pub fn new(app1: impl Into<String>, app2: impl Into<String>) -> Self {
        let trim = |base: String| base.trim_end_matches('/').to_string();
        Self {
            app1: trim(app1.into()),
            app2: trim(app2.into()),
        }
    }
}

impl Default for Targets {
    fn default() -> Self {
        Self::new("http://app1.localhost", "http://app2.localhost")
    }
}

/// The six requests of one iteration, app1 first, tiles before wishlist.
#[must_use]
pub fn home_requests(targets: &Targets) -> Vec<RequestDescriptor> {
    let mut requests = Vec::with_capacity(6);
    for base in [&targets.app1, &targets.app2] {
        for code in ITEM_CODES {
            requests.push(RequestDescriptor::get(format!(
                "{base}{TILES_PATH}?itemCodes={code}"
            )));
        }
        requests.push(RequestDescriptor::get(format!("{base}{WISHLIST_PATH}")));
    }
    requests
}

#[inline]
#[must_use]
pub fn status_ok(response: &HttpResponse) -> bool {
    response.status == 200
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct IterationReport {
    pub passed: usize,
    pub failed: usize,
}

pub struct Scenario {
    client: HttpClient,
    targets: Targets,
    params: Arc<RequestParams>,
    sleep: Duration,
    metrics: Metrics,
    monitor: Arc<ThresholdMonitor>,
}

impl Scenario {
    #[must_use]
    pub fn new(
        client: HttpClient,
        targets: Targets,
        params: Arc<RequestParams>,
        sleep: Duration,
        metrics: Metrics,
        monitor: Arc<ThresholdMonitor>,
    ) -> Self {
        Self {
            client,
            targets,
            params,
            sleep,
            metrics,
            monitor,
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// One VU iteration: batch, check every status, feed the abort rules, pause.
    ///
    /// Failed checks are only recorded, they never end the iteration early.
    pub async fn run_iteration(&self) -> IterationReport {
        let requests = home_requests(&self.targets);
        let responses = self.client.batch(&requests, &self.params).await;

        let mut report = IterationReport::default();
        for response in &responses {
            self.metrics.record_response(response.status, response.duration);
            let passed = status_ok(response);
            self.metrics.record_check(STATUS_CHECK, passed);
            if passed {
                report.passed += 1;
            } else {
                report.failed += 1;
                tracing::debug!(
                    url = %response.url,
                    status = response.status,
                    error = response.error.as_deref().unwrap_or(""),
                    "check '{STATUS_CHECK}' failed"
                );
            }
        }
        self.monitor.observe(&self.metrics);

        tokio::time::sleep(self.sleep).await;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_targets_produce_the_six_home_requests() {
        let urls: Vec<String> = home_requests(&Targets::default())
            .into_iter()
            .map(|r| {
                assert_eq!(r.method, Method::GET);
                r.url
            })
            .collect();
        assert_eq!(
            urls,
            vec![
                "http://app1.localhost/api/v1/home/products/tiles?itemCodes=I-015503",
                "http://app1.localhost/api/v1/home/products/tiles?itemCodes=I-060546",
                "http://app1.localhost/api/v1/home/wishlist/items",
                "http://app2.localhost/api/v1/home/products/tiles?itemCodes=I-015503",
                "http://app2.localhost/api/v1/home/products/tiles?itemCodes=I-060546",
                "http://app2.localhost/api/v1/home/wishlist/items",
            ]
        );
    }

    #[test]
    fn requests_are_identical_across_iterations() {
        let targets = Targets::default();
        assert_eq!(home_requests(&targets), home_requests(&targets));
    }

    #[test]
    fn trailing_slash_on_targets_is_dropped() {
        let targets = Targets::new("http://127.0.0.1:8081/", "http://127.0.0.1:8082");
        let requests = home_requests(&targets);
        assert_eq!(
            requests[2].url,
            "http://127.0.0.1:8081/api/v1/home/wishlist/items"
        );
        assert_eq!(
            requests[3].url,
            "http://127.0.0.1:8082/api/v1/home/products/tiles?itemCodes=I-015503"
        );
    }

    #[test]
    fn only_200_passes_the_check() {
        let response = |status| HttpResponse {
            url: String::new(),
            status,
            headers: Default::default(),
            body: Vec::new(),
            duration: Duration::ZERO,
            error: None,
        };
        assert!(status_ok(&response(200)));
        for status in [0, 201, 204, 304, 404, 500, 503] {
            assert!(!status_ok(&response(status)), "{status}");
        }
    }
}
