use std::net::SocketAddr;

use anyhow::Context;
use axum::http::StatusCode;
use clap::Parser;
use http_test_util::origin::{serve, OriginState};
use mimalloc::MiMalloc;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Serves a stub of the home API for local load test runs
#[derive(Parser, Debug)]
#[command(name = "stub-origin")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080", env = "STUB_ORIGIN_BIND")]
    bind: SocketAddr,

    /// Path answered with --fail-status instead of the canned payload (repeatable)
    #[arg(long)]
    fail_path: Vec<String>,

    /// Status code used for --fail-path
    #[arg(long, default_value = "500", value_parser = clap::value_parser!(u16).range(100..=599))]
    fail_status: u16,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {e}"))?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let _g = rt.enter();
    rt.block_on(run_server(args))
}

async fn run_server(args: Args) -> anyhow::Result<()> {
    let state = OriginState::new();
    let status = StatusCode::from_u16(args.fail_status).context("Invalid --fail-status")?;
    for path in args.fail_path {
        tracing::info!(%path, %status, "forcing status");
        state.fail_path(path, status);
    }

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;
    tracing::info!(addr = %args.bind, "stub origin listening");
    serve(listener, state).await.context("Stub origin failed")
}
