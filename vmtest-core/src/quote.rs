//! Shell quoting for arguments interpolated into guest commands.

/// Quotes `arg` for a POSIX shell.
///
/// The result is a single-quoted word. Embedded single quotes are closed,
/// escaped and reopened (`'\''`), so nothing inside is expanded.
#[must_use]
pub fn shell_quote(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('\'');
    for c in arg.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}
