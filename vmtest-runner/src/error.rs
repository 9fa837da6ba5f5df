//! Error types for the runner crate.

use vmtest_driver::DriverError;

/// Errors that can end a test run.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// A machine operation or guest command failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// The test plan is well-formed JSON but cannot be run.
    #[error("invalid test plan: {reason}")]
    Plan { reason: String },

    /// A plan step names a machine that no start script defined.
    #[error("unknown machine: {0}")]
    UnknownMachine(String),

    /// Two start scripts map to the same machine name.
    #[error("duplicate machine name: {0}")]
    DuplicateMachine(String),

    /// The plan file cannot be read.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The plan file is not valid JSON for a test plan.
    #[error("malformed test plan: {0}")]
    Json(#[from] serde_json::Error),
}
