//! VM supervision and guest command execution for the vmtest driver.
//!
//! Launches a VM process, watches its console for the boot sentinel, opens
//! the guest command socket and runs shell commands in the guest with exit
//! status capture. Test helpers (`wait_for_unit`, `wait_for_open_port`, ...)
//! are layered on top through [`GuestExt`].

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod channel;
pub mod config;
pub mod error;
pub mod guest;
pub mod machine;
pub mod monitor;
pub mod process;
pub mod retry;
pub mod transfer;

pub use channel::GuestChannel;
pub use config::MachineConfig;
pub use error::DriverError;
pub use guest::{Execute, GuestExt};
pub use machine::Machine;
pub use monitor::BootSignal;
pub use process::VmProcess;
pub use retry::{retry, RetryPolicy};
pub use vmtest_core::{ExecOutput, MachineName, RunId};
