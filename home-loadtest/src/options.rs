use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::OptionsError;
use crate::params::RequestParams;
use crate::threshold::Threshold;

pub const DEFAULT_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: usize,
}

impl Stage {
    #[must_use]
    pub const fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

#[derive(Debug, Clone)]
pub struct Options {
    pub thresholds: Vec<Threshold>,
    pub stages: Vec<Stage>,
    pub start_vus: usize,
    pub graceful_ramp_down: Duration,
    pub graceful_stop: Duration,
    pub params: RequestParams,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            thresholds: default_thresholds(),
            stages: default_stages(),
            start_vus: 1,
            graceful_ramp_down: DEFAULT_GRACE,
            graceful_stop: DEFAULT_GRACE,
            params: RequestParams::default(),
        }
    }
}

fn default_stages() -> Vec<Stage> {
    vec![
        Stage::new(Duration::from_secs(10), 1),
        Stage::new(Duration::from_secs(60), 5),
        Stage::new(Duration::from_secs(60 * 60), 5),
    ]
}

fn default_thresholds() -> Vec<Threshold> {
    // Both parts are literals, this cannot fail.
    Threshold::parse("http_req_failed", "rate<0.1")
        .map(|t| vec![t.with_abort(true, None)])
        .unwrap_or_default()
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOptions {
    thresholds: Option<BTreeMap<String, Vec<RawThreshold>>>,
    stages: Option<Vec<RawStage>>,
    #[serde(rename = "startVUs")]
    start_vus: Option<usize>,
    #[serde(rename = "gracefulRampDown")]
    graceful_ramp_down: Option<String>,
    #[serde(rename = "gracefulStop")]
    graceful_stop: Option<String>,
    params: Option<RawParams>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawThreshold {
    Expression(String),
    Rule {
        threshold: String,
        #[serde(default, rename = "abortOnFail")]
        abort_on_fail: bool,
        #[serde(default, rename = "delayAbortEval")]
        delay_abort_eval: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStage {
    duration: String,
    target: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawParams {
    #[serde(default)]
    headers: BTreeMap<String, String>,
    timeout: Option<String>,
}

impl Options {
    pub fn load(path: &Path) -> Result<Self, OptionsError> {
        let raw = std::fs::read_to_string(path).map_err(|source| OptionsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(json: &str) -> Result<Self, OptionsError> {
        let raw: RawOptions = serde_json::from_str(json)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawOptions) -> Result<Self, OptionsError> {
        let defaults = Options::default();

        let thresholds = match raw.thresholds {
            Some(map) => {
                let mut thresholds = Vec::new();
                for (metric, rules) in map {
                    for rule in rules {
                        thresholds.push(parse_threshold(&metric, rule)?);
                    }
                }
                thresholds
            }
            None => defaults.thresholds,
        };

        let stages = match raw.stages {
            Some(raw_stages) => raw_stages
                .into_iter()
                .map(|s| -> Result<Stage, OptionsError> {
                    Ok(Stage {
                        duration: parse_duration(&s.duration)?,
                        target: s.target,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => defaults.stages,
        };
        if stages.is_empty() {
            return Err(OptionsError::NoStages);
        }

        let mut params = RequestParams::default();
        if let Some(raw_params) = raw.params {
            for (name, value) in &raw_params.headers {
                params.insert_header(name, value)?;
            }
            if let Some(timeout) = raw_params.timeout {
                params.timeout = parse_duration(&timeout)?;
            }
        }

        Ok(Self {
            thresholds,
            stages,
            start_vus: raw.start_vus.unwrap_or(defaults.start_vus),
            graceful_ramp_down: parse_optional(raw.graceful_ramp_down, defaults.graceful_ramp_down)?,
            graceful_stop: parse_optional(raw.graceful_stop, defaults.graceful_stop)?,
            params,
        })
    }

    /// Sum of all stage durations, i.e. the run length before graceful stop.
    #[must_use]
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    #[must_use]
    pub fn max_vus(&self) -> usize {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.start_vus, usize::max)
    }
}

fn parse_threshold(metric: &str, raw: RawThreshold) -> Result<Threshold, OptionsError> {
    match raw {
        RawThreshold::Expression(expression) => Threshold::parse(metric, &expression),
        RawThreshold::Rule {
            threshold,
            abort_on_fail,
            delay_abort_eval,
        } => {
            let delay = delay_abort_eval.as_deref().map(parse_duration).transpose()?;
            Ok(Threshold::parse(metric, &threshold)?.with_abort(abort_on_fail, delay))
        }
    }
}

fn parse_optional(raw: Option<String>, default: Duration) -> Result<Duration, OptionsError> {
    raw.as_deref().map_or(Ok(default), parse_duration)
}

/// Parses `500ms`, `10s`, `1m`, `1h` and compounds such as `1m30s`.
///
/// A bare number is taken as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, OptionsError> {
    let invalid = || OptionsError::InvalidDuration(input.to_string());
    let s = input.trim();
    if s.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = s.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).map_err(|_| invalid());
    }

    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest.find(|c: char| !is_number(c)).ok_or_else(invalid)?;
        if number_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest.find(is_number).unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid()),
        };
        total += value * seconds_per_unit;
        rest = &rest[unit_len..];
    }
    Duration::try_from_secs_f64(total).map_err(|_| invalid())
}
