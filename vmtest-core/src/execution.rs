use serde::{Deserialize, Serialize};

/// Result of running one command in the guest.
///
/// `output` holds everything the command wrote to stdout and stderr, in the
/// order the guest produced it, without the protocol trailer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ExecOutput {
    /// Exit status of the command as reported by the guest shell.
    pub status: i32,
    /// Combined stdout and stderr.
    pub output: String,
}

impl ExecOutput {
    /// Create a new execution result.
    #[must_use]
    pub fn new(status: i32, output: impl Into<String>) -> Self {
        Self {
            status,
            output: output.into(),
        }
    }

    /// Returns `true` if the command exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }
}
