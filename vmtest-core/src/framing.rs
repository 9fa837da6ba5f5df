//! Wire format of the guest command channel.
//!
//! The guest runs a plain shell on the other end of the socket. Every request
//! is a single line wrapping the user command in a subshell followed by an
//! `echo` of a marker and `$?`, so that the last line of every response is a
//! trailer carrying the exit status:
//!
//! ```text
//! -> ( ls /etc/hosts ); echo '|!=EOF' $?
//! <- /etc/hosts
//! <- |!=EOF 0
//! ```
//!
//! When the command leaves an unterminated line behind, the trailer is glued
//! to it (`partial|!=EOF 0`). The text before the marker is still output.

use std::sync::OnceLock;

use regex::Regex;

/// Console line printed by the guest once its command listener accepts
/// connections.
pub const BOOT_SENTINEL: &str = "===UP===";

/// Marker echoed after every command, followed by whitespace and the status.
pub const TRAILER_MARKER: &str = "|!=EOF";

/// File name of the guest command socket inside the scratch directory.
pub const COMMAND_SOCKET: &str = "65535.socket";

/// Request written to a fresh channel to check that the guest shell answers.
pub const HANDSHAKE_REQUEST: &str = "echo hello\n";

/// The only reply accepted for [`HANDSHAKE_REQUEST`].
pub const HANDSHAKE_REPLY: &str = "hello";

/// Builds the request line for `command`, newline included.
#[must_use]
pub fn frame_request(command: &str) -> String {
    format!("( {command} ); echo '{TRAILER_MARKER}' $?\n")
}

/// A parsed trailer line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer<'a> {
    /// Output the command left on the trailer line before the marker.
    pub spillover: &'a str,
    /// Exit status of the wrapped command.
    pub status: i32,
}

#[expect(clippy::expect_used, reason = "pattern is a compile-time constant")]
fn trailer_re() -> &'static Regex {
    static TRAILER_RE: OnceLock<Regex> = OnceLock::new();
    TRAILER_RE.get_or_init(|| Regex::new(r"^(.*)\|!=EOF\s+(\d+)$").expect("invalid trailer regex"))
}

/// Parses `line` as a trailer. The line terminator is ignored.
///
/// Returns `None` for ordinary output lines, including lines whose status
/// digits do not fit an `i32`.
#[must_use]
pub fn parse_trailer(line: &str) -> Option<Trailer<'_>> {
    let caps = trailer_re().captures(strip_line_terminator(line))?;
    let spillover = caps.get(1).map_or("", |m| m.as_str());
    let status = caps.get(2)?.as_str().parse().ok()?;
    Some(Trailer { spillover, status })
}

/// Removes a trailing `\n` or `\r\n`.
#[must_use]
pub fn strip_line_terminator(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

/// Returns `true` if the console `line` is the boot-ready sentinel.
#[must_use]
pub fn is_boot_sentinel(line: &str) -> bool {
    strip_line_terminator(line) == BOOT_SENTINEL
}
