use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use home_loadtest::cli::Cli;
use home_loadtest::summary::Summary;
use home_loadtest::TestPlan;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Exit code when a threshold failed or aborted the run.
const THRESHOLDS_FAILED: u8 = 99;

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;
    let plan = cli.test_plan().context("Invalid load test options")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let _guard = rt.enter();
    let summary = rt.block_on(run_tester(plan));

    println!("{}", summary.render());
    if let Some(path) = &cli.summary_export {
        summary.write_json(path)?;
        tracing::info!(path = %path.display(), "summary exported");
    }
    Ok(if summary.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(THRESHOLDS_FAILED)
    })
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "info,home_loadtest=debug"
        } else {
            "info"
        })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {e}"))
}

async fn run_tester(plan: TestPlan) -> Summary {
    let abort = CancellationToken::new();
    let on_ctrl_c = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("received Ctrl+C, stopping virtual users");
            on_ctrl_c.cancel();
        }
    });
    home_loadtest::run(plan, abort).await
}
