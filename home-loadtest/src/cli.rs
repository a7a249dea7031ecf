use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::OptionsError;
use crate::options::{parse_duration, Options};
use crate::scenario::Targets;
use crate::TestPlan;

/// Staged load test for the home page APIs of app1 and app2
#[derive(Parser, Debug)]
#[command(name = "home-loadtest")]
#[command(version)]
pub struct Cli {
    /// JSON options file with thresholds, stages and request params
    #[arg(long, env = "LOADTEST_OPTIONS")]
    pub options: Option<PathBuf>,

    /// Base URL of the first app
    #[arg(long, default_value = "http://app1.localhost", env = "LOADTEST_APP1")]
    pub app1: String,

    /// Base URL of the second app
    #[arg(long, default_value = "http://app2.localhost", env = "LOADTEST_APP2")]
    pub app2: String,

    /// Extra request header as `Name: value` (repeatable)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Pause at the end of every iteration
    #[arg(long, default_value = "1s", value_parser = parse_duration)]
    pub sleep: Duration,

    /// Seconds between progress log lines, 0 disables them
    #[arg(long, default_value = "10")]
    pub report_interval: u64,

    /// Write the end-of-test summary as JSON to this file
    #[arg(long)]
    pub summary_export: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn test_plan(&self) -> Result<TestPlan, OptionsError> {
        let mut options = match &self.options {
            Some(path) => Options::load(path)?,
            None => Options::default(),
        };
        for line in &self.headers {
            options.params.insert_header_line(line)?;
        }
        Ok(TestPlan {
            options,
            targets: Targets::new(self.app1.as_str(), self.app2.as_str()),
            sleep: self.sleep,
            report_interval: (self.report_interval > 0)
                .then(|| Duration::from_secs(self.report_interval)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_reproduce_the_home_profile() {
        let cli = Cli::try_parse_from(["home-loadtest"]).unwrap();
        let plan = cli.test_plan().unwrap();
        assert_eq!(plan.targets, Targets::default());
        assert_eq!(plan.sleep, Duration::from_secs(1));
        assert_eq!(plan.options.stages.len(), 3);
        assert_eq!(plan.report_interval, Some(Duration::from_secs(10)));
    }

    #[test]
    fn flags_override_targets_sleep_and_headers() {
        let cli = Cli::try_parse_from([
            "home-loadtest",
            "--app1",
            "http://127.0.0.1:9001/",
            "--app2",
            "http://127.0.0.1:9002",
            "-H",
            "Authorization: Bearer abc",
            "--sleep",
            "250ms",
            "--report-interval",
            "0",
        ])
        .unwrap();
        let plan = cli.test_plan().unwrap();
        assert_eq!(plan.targets.app1, "http://127.0.0.1:9001");
        assert_eq!(plan.sleep, Duration::from_millis(250));
        assert_eq!(plan.report_interval, None);
        assert_eq!(
            plan.options.params.headers.get("authorization").unwrap(),
            "Bearer abc"
        );
    }

    #[test]
    fn bad_sleep_is_rejected_by_the_parser() {
        assert!(Cli::try_parse_from(["home-loadtest", "--sleep", "soon"]).is_err());
    }

    #[test]
    fn missing_options_file_is_an_io_error() {
        let cli = Cli::try_parse_from([
            "home-loadtest",
            "--options",
            "/nonexistent/home-loadtest/options.json",
        ])
        .unwrap();
        assert!(matches!(cli.test_plan().unwrap_err(), OptionsError::Io { .. }));
    }
}
