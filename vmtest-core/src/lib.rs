//! Core types for the vmtest VM test driver.
//!
//! Everything in here is free of I/O: the wire framing of the guest command
//! channel, command results, machine identifiers and shell quoting.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod execution;
pub mod framing;
pub mod id;
pub mod quote;

pub use error::CoreError;
pub use execution::ExecOutput;
pub use framing::{
    frame_request, is_boot_sentinel, parse_trailer, strip_line_terminator, Trailer,
    BOOT_SENTINEL, COMMAND_SOCKET, HANDSHAKE_REPLY, HANDSHAKE_REQUEST, TRAILER_MARKER,
};
pub use id::{validate_machine_name, ContentHash, MachineName, RunId, MAX_MACHINE_NAME_LEN};
pub use quote::shell_quote;
