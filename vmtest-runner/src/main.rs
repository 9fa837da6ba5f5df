//! Entry point for the `vmtest-driver` binary.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter.
const LOG_ENV: &str = "VMTEST_LOG";

#[derive(Debug, Parser)]
#[command(name = "vmtest-driver", version, about = "Boot VMs and run a test plan against them")]
struct Cli {
    /// JSON test plan. Without one, every machine is booted and shut down.
    #[arg(long, env = "VMTEST_PLAN")]
    plan: Option<PathBuf>,

    /// VM start scripts, one per machine. `run-<name>-vm` names the machine.
    #[arg(required = true)]
    start_scripts: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // VMs run in their own process groups and miss the terminal's SIGINT.
    // Dropping the session kills them.
    let result = tokio::select! {
        result = vmtest_runner::run(&cli.start_scripts, cli.plan.as_deref()) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted, killing VMs");
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "test run failed");
            ExitCode::FAILURE
        }
    }
}
