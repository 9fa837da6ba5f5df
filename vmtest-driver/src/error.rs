//! Error types for the driver crate.

use std::path::PathBuf;

use vmtest_core::CoreError;

/// Errors that can occur while driving a machine under test.
///
/// None of these are retried by the driver itself. Transient conditions such
/// as "guest not booted yet" never surface as errors; only an exhausted retry
/// budget does, as [`DriverError::Timeout`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DriverError {
    /// The VM process could not be created.
    #[error("failed to launch VM {machine}: {reason}")]
    LaunchFailure { machine: String, reason: String },

    /// A bounded wait ran out of attempts.
    #[error("timed out waiting for {what} after {attempts} attempts")]
    Timeout { what: String, attempts: u32 },

    /// The command channel closed (or broke) before the response trailer.
    #[error("connection to VM {machine} lost: {reason}")]
    ConnectionLost { machine: String, reason: String },

    /// A command expected to succeed exited non-zero.
    #[error("command `{command}` failed with status {status}, output: {output}")]
    CommandFailed {
        command: String,
        status: i32,
        output: String,
    },

    /// A command expected to fail exited zero.
    #[error("command `{command}` unexpectedly succeeded, output: {output}")]
    UnexpectedSuccess { command: String, output: String },

    /// A unit being waited on entered the `failed` state.
    #[error("unit {unit} reached state 'failed'")]
    UnitFailed { unit: String },

    /// A file copied into the guest does not match the host copy.
    #[error("checksum mismatch after copying to {path}: host {expected}, guest {actual}")]
    TransferMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// A helper was called with an unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid core value, e.g. a bad machine name.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Host-side I/O error outside the command protocol.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
