/// Errors produced by the `vmtest-core` crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A machine name failed validation.
    #[error("invalid machine name '{name}': {reason}")]
    InvalidMachineName { name: String, reason: String },
}
