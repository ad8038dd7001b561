//! `capcompose` command-line binary.
//!
//! # Environment Variables
//!
//! - `CAPCOMPOSE_REGISTRY`: registry directory (default: `capabilities`)
//! - `CAPCOMPOSE_LOAD_CONCURRENCY`: files read in parallel during a load
//! - `CAPCOMPOSE_CONTRACT_TIMEOUT_MS`: per-contract timeout (default: 5000)
//! - `CAPCOMPOSE_MANIFEST_FORMAT`: `yaml` (default) or `json`
//! - `RUST_LOG`: tracing filter (default: "info,capcompose=debug")
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin capcompose -- compose request.yaml --registry capabilities/
//! ```

use anyhow::Result;
use clap::Parser;

use capcompose::cli::{run, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays a clean manifest stream.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,capcompose=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    tracing::debug!(command = ?cli.command, "capcompose {}", capcompose::VERSION);

    let mut stdout = std::io::stdout().lock();
    let status = run(cli, &mut stdout).await;
    drop(stdout);

    if !status.is_success() {
        tracing::info!("exit {} ({})", status.code(), status);
        std::process::exit(status.code());
    }
    Ok(())
}
