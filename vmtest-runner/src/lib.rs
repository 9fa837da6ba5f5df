//! Command-line test driver: boots the machines described by start scripts
//! and runs a JSON test plan against them.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod plan;
pub mod registry;

use std::path::{Path, PathBuf};

use vmtest_driver::{MachineConfig, RunId};

pub use error::RunnerError;
pub use plan::{execute_plan, Action, Step, TestPlan};
pub use registry::MachineRegistry;

/// Run a whole test session.
///
/// With a plan, its steps are executed in order. Without one, every machine
/// is booted and connected. Either way every booted machine is shut down
/// before returning.
///
/// # Errors
/// Returns the first error of the session; a shutdown error is reported only
/// if everything before it succeeded.
pub async fn run(start_scripts: &[PathBuf], plan: Option<&Path>) -> Result<(), RunnerError> {
    let plan = match plan {
        Some(path) => Some(TestPlan::load(path).await?),
        None => None,
    };

    let run_id = RunId::new();
    let run_dir = MachineConfig::default_run_dir(run_id);
    let registry = MachineRegistry::from_start_scripts(start_scripts, &run_dir)?;
    tracing::info!(
        %run_id,
        run_dir = %run_dir.display(),
        machines = ?registry.names().collect::<Vec<_>>(),
        "starting test run"
    );

    let outcome = match &plan {
        Some(plan) => execute_plan(&registry, plan).await,
        None => registry.connect_all().await,
    };
    let cleanup = registry.shutdown_all().await;

    outcome.and(cleanup)
}
