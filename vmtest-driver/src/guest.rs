//! Command execution seam and the test helpers built on top of it.
//!
//! [`Execute`] is the one primitive a guest has to offer. [`GuestExt`] adds
//! the assertions and waits tests are written with; it is implemented for
//! every [`Execute`], so helpers work the same on a real [`Machine`] and on
//! test doubles.

use std::path::Path;

use async_trait::async_trait;
use regex::Regex;
use vmtest_core::{shell_quote, ExecOutput};

use crate::retry::retry;
use crate::transfer::{checksum_command, compute_hash, parse_checksum, write_commands};
use crate::{DriverError, Machine, RetryPolicy};

/// Something that can run shell commands in a guest.
///
/// Implementations must be `Send + Sync` so helpers can be awaited from any
/// task.
#[async_trait]
pub trait Execute: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Budget for the `wait_*` helpers.
    fn retry_policy(&self) -> RetryPolicy;

    /// Run `command` and return its status and combined output.
    ///
    /// # Errors
    /// Returns [`DriverError::ConnectionLost`] if the guest goes away
    /// mid-command, plus whatever connecting to the guest may fail with.
    async fn execute(&self, command: &str) -> Result<ExecOutput, DriverError>;
}

#[async_trait]
impl Execute for Machine {
    fn name(&self) -> &str {
        self.name().as_str()
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.config().retry
    }

    async fn execute(&self, command: &str) -> Result<ExecOutput, DriverError> {
        Machine::execute(self, command).await
    }
}

/// Assertions and waits composed from [`Execute::execute`].
#[async_trait]
pub trait GuestExt: Execute {
    /// Run `commands` in order, requiring each to exit zero.
    ///
    /// Returns the concatenated output.
    ///
    /// # Errors
    /// Returns [`DriverError::CommandFailed`] for the first non-zero status.
    async fn succeed(&self, commands: &[&str]) -> Result<String, DriverError> {
        let mut output = String::new();
        for command in commands {
            tracing::info!(machine = self.name(), command, "must succeed");
            let out = self.execute(command).await?;
            if !out.success() {
                return Err(DriverError::CommandFailed {
                    command: (*command).to_owned(),
                    status: out.status,
                    output: out.output,
                });
            }
            output.push_str(&out.output);
        }
        Ok(output)
    }

    /// Run `command`, requiring a non-zero status.
    ///
    /// # Errors
    /// Returns [`DriverError::UnexpectedSuccess`] if it exits zero.
    async fn fail(&self, command: &str) -> Result<(), DriverError> {
        tracing::info!(machine = self.name(), command, "must fail");
        let out = self.execute(command).await?;
        if out.success() {
            return Err(DriverError::UnexpectedSuccess {
                command: command.to_owned(),
                output: out.output,
            });
        }
        Ok(())
    }

    /// Repeat `command` until it exits zero and return that run's output.
    ///
    /// # Errors
    /// Returns [`DriverError::Timeout`] when the retry budget runs out.
    async fn wait_until_succeeds(&self, command: &str) -> Result<String, DriverError> {
        let what = format!("`{command}` to succeed");
        retry(&what, self.retry_policy(), || async move {
            let out = self.execute(command).await?;
            Ok(out.success().then_some(out.output))
        })
        .await
    }

    /// Repeat `command` until it exits non-zero and return that run's output.
    ///
    /// # Errors
    /// Returns [`DriverError::Timeout`] when the retry budget runs out.
    async fn wait_until_fails(&self, command: &str) -> Result<String, DriverError> {
        let what = format!("`{command}` to fail");
        retry(&what, self.retry_policy(), || async move {
            let out = self.execute(command).await?;
            Ok((!out.success()).then_some(out.output))
        })
        .await
    }

    /// Wait until the systemd unit `unit` is active.
    ///
    /// # Errors
    /// Returns [`DriverError::UnitFailed`] as soon as the unit is `failed`,
    /// and [`DriverError::Timeout`] when the retry budget runs out.
    async fn wait_for_unit(&self, unit: &str) -> Result<(), DriverError> {
        tracing::info!(machine = self.name(), unit, "waiting for unit");
        let command = format!("systemctl show {} --property=ActiveState", shell_quote(unit));
        let command = command.as_str();
        let what = format!("unit {unit}");

        retry(&what, self.retry_policy(), || async move {
            let out = self.execute(command).await?;
            match active_state(&out.output) {
                Some("active") => Ok(Some(())),
                Some("failed") => Err(DriverError::UnitFailed { unit: unit.to_owned() }),
                _ => Ok(None),
            }
        })
        .await
    }

    /// Start the systemd unit `unit`.
    ///
    /// # Errors
    /// Returns [`DriverError::CommandFailed`] if `systemctl` fails.
    async fn start_unit(&self, unit: &str) -> Result<(), DriverError> {
        let command = format!("systemctl start {}", shell_quote(unit));
        self.succeed(&[command.as_str()]).await?;
        Ok(())
    }

    /// Stop the systemd unit `unit`.
    ///
    /// # Errors
    /// Returns [`DriverError::CommandFailed`] if `systemctl` fails.
    async fn stop_unit(&self, unit: &str) -> Result<(), DriverError> {
        let command = format!("systemctl stop {}", shell_quote(unit));
        self.succeed(&[command.as_str()]).await?;
        Ok(())
    }

    /// Wait until `path` exists in the guest.
    ///
    /// # Errors
    /// Returns [`DriverError::Timeout`] when the retry budget runs out.
    async fn wait_for_file(&self, path: &str) -> Result<(), DriverError> {
        tracing::info!(machine = self.name(), path, "waiting for file");
        self.wait_until_succeeds(&format!("test -e {}", shell_quote(path))).await?;
        Ok(())
    }

    /// Wait until something listens on TCP `port` in the guest.
    ///
    /// # Errors
    /// Returns [`DriverError::Timeout`] when the retry budget runs out.
    async fn wait_for_open_port(&self, port: u16) -> Result<(), DriverError> {
        tracing::info!(machine = self.name(), port, "waiting for open port");
        self.wait_until_succeeds(&port_probe(port)).await?;
        Ok(())
    }

    /// Wait until nothing listens on TCP `port` in the guest.
    ///
    /// # Errors
    /// Returns [`DriverError::Timeout`] when the retry budget runs out.
    async fn wait_for_closed_port(&self, port: u16) -> Result<(), DriverError> {
        tracing::info!(machine = self.name(), port, "waiting for closed port");
        self.wait_until_fails(&port_probe(port)).await?;
        Ok(())
    }

    /// Wait until the X server accepts clients.
    ///
    /// # Errors
    /// Returns [`DriverError::Timeout`] when the retry budget runs out.
    async fn wait_for_x(&self) -> Result<(), DriverError> {
        tracing::info!(machine = self.name(), "waiting for the X server");
        self.wait_until_succeeds("xwininfo -root > /dev/null 2>&1").await?;
        Ok(())
    }

    /// Wait until a window whose name matches `pattern` exists.
    ///
    /// # Errors
    /// Returns [`DriverError::InvalidArgument`] if `pattern` is not a valid
    /// regex and [`DriverError::Timeout`] when the retry budget runs out.
    async fn wait_for_window(&self, pattern: &str) -> Result<(), DriverError> {
        let re = Regex::new(pattern)
            .map_err(|e| DriverError::InvalidArgument(format!("window pattern {pattern:?}: {e}")))?;
        let re = &re;
        tracing::info!(machine = self.name(), pattern, "waiting for window");

        let what = format!("window matching {pattern:?}");
        retry(&what, self.retry_policy(), || async move {
            let out = self.execute(LIST_WINDOW_NAMES).await?;
            Ok(out.output.lines().any(|name| re.is_match(name)).then_some(()))
        })
        .await
    }

    /// Take the guest network interface `iface` down.
    ///
    /// # Errors
    /// Returns [`DriverError::CommandFailed`] if `ip` fails.
    async fn block(&self, iface: &str) -> Result<(), DriverError> {
        let command = format!("ip link set {} down", shell_quote(iface));
        self.succeed(&[command.as_str()]).await?;
        Ok(())
    }

    /// Bring the guest network interface `iface` back up.
    ///
    /// # Errors
    /// Returns [`DriverError::CommandFailed`] if `ip` fails.
    async fn unblock(&self, iface: &str) -> Result<(), DriverError> {
        let command = format!("ip link set {} up", shell_quote(iface));
        self.succeed(&[command.as_str()]).await?;
        Ok(())
    }

    /// Copy the host file `source` to `dest` in the guest and verify it.
    ///
    /// # Errors
    /// Returns [`DriverError::Io`] if `source` cannot be read,
    /// [`DriverError::CommandFailed`] if a guest command fails and
    /// [`DriverError::TransferMismatch`] if the checksums differ.
    async fn copy_file_from_host(&self, source: &Path, dest: &str) -> Result<(), DriverError> {
        let data = tokio::fs::read(source).await?;
        tracing::info!(
            machine = self.name(),
            source = %source.display(),
            dest,
            bytes = data.len(),
            "copying file from host"
        );

        for command in write_commands(&data, dest) {
            self.succeed(&[command.as_str()]).await?;
        }

        let expected = compute_hash(&data).to_string();
        let checksum = checksum_command(dest);
        let out = self.succeed(&[checksum.as_str()]).await?;
        let actual = parse_checksum(&out).unwrap_or_default();
        if actual != expected {
            return Err(DriverError::TransferMismatch {
                path: dest.into(),
                expected,
                actual: actual.to_owned(),
            });
        }
        Ok(())
    }
}

impl<T: Execute> GuestExt for T {}

/// Prints one window name per line (windows without a name are skipped).
const LIST_WINDOW_NAMES: &str =
    r#"xwininfo -root -tree | sed 's/.*0x[0-9a-f]* "\([^"]*\)".*/\1/; t; d'"#;

fn port_probe(port: u16) -> String {
    format!("nc -z localhost {port}")
}

/// Value of `ActiveState=` in `systemctl show` output.
fn active_state(output: &str) -> Option<&str> {
    output.lines().find_map(|line| line.strip_prefix("ActiveState="))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    /// Replays canned results and records every command it was given.
    struct ScriptedGuest {
        replies: Mutex<VecDeque<ExecOutput>>,
        commands: Mutex<Vec<String>>,
    }

    impl ScriptedGuest {
        fn new(replies: Vec<(i32, &str)>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().map(|(s, o)| ExecOutput::new(s, o)).collect()),
                commands: Mutex::new(Vec::new()),
            }
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().map(|c| c.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl Execute for ScriptedGuest {
        fn name(&self) -> &str {
            "scripted"
        }

        fn retry_policy(&self) -> RetryPolicy {
            RetryPolicy::new(5, Duration::from_millis(1))
        }

        async fn execute(&self, command: &str) -> Result<ExecOutput, DriverError> {
            if let Ok(mut commands) = self.commands.lock() {
                commands.push(command.to_owned());
            }
            let reply = self.replies.lock().ok().and_then(|mut r| r.pop_front());
            reply.ok_or_else(|| DriverError::ConnectionLost {
                machine: "scripted".to_owned(),
                reason: "script exhausted".to_owned(),
            })
        }
    }

    #[tokio::test]
    async fn succeed_true_returns_empty_output() {
        let guest = ScriptedGuest::new(vec![(0, "")]);
        assert_eq!(guest.succeed(&["true"]).await.expect("succeed"), "");
    }

    #[tokio::test]
    async fn succeed_false_is_command_failed() {
        let guest = ScriptedGuest::new(vec![(1, "nope\n")]);
        match guest.succeed(&["false"]).await {
            Err(DriverError::CommandFailed { command, status, output }) => {
                assert_eq!(command, "false");
                assert_eq!(status, 1);
                assert_eq!(output, "nope\n");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn succeed_concatenates_and_stops_at_first_failure() {
        let guest = ScriptedGuest::new(vec![(0, "a\n"), (0, "b\n"), (2, ""), (0, "never\n")]);
        assert_eq!(guest.succeed(&["one", "two"]).await.expect("succeed"), "a\nb\n");
        assert!(guest.succeed(&["three", "four"]).await.is_err());
        assert_eq!(guest.commands(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn fail_accepts_non_zero_and_rejects_zero() {
        let guest = ScriptedGuest::new(vec![(1, ""), (0, "oops\n")]);
        assert!(guest.fail("false").await.is_ok());
        assert!(matches!(
            guest.fail("true").await,
            Err(DriverError::UnexpectedSuccess { .. })
        ));
    }

    #[tokio::test]
    async fn connection_lost_is_not_retried() {
        let guest = ScriptedGuest::new(vec![]);
        let result = guest.wait_until_succeeds("true").await;
        assert!(matches!(result, Err(DriverError::ConnectionLost { .. })));
        assert_eq!(guest.commands().len(), 1);
    }

    #[tokio::test]
    async fn wait_until_succeeds_returns_successful_output() {
        let guest = ScriptedGuest::new(vec![(1, ""), (1, ""), (0, "up\n")]);
        assert_eq!(guest.wait_until_succeeds("probe").await.expect("wait"), "up\n");
    }

    #[tokio::test]
    async fn wait_until_fails_times_out() {
        let guest = ScriptedGuest::new(vec![(0, ""); 5]);
        match guest.wait_until_fails("true").await {
            Err(DriverError::Timeout { attempts, .. }) => assert_eq!(attempts, 5),
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_for_unit_polls_active_state() {
        let guest = ScriptedGuest::new(vec![
            (0, "ActiveState=inactive\n"),
            (0, "ActiveState=activating\n"),
            (0, "ActiveState=active\n"),
        ]);
        assert!(guest.wait_for_unit("sshd.service").await.is_ok());
        assert_eq!(
            guest.commands()[0],
            "systemctl show 'sshd.service' --property=ActiveState"
        );
    }

    #[tokio::test]
    async fn wait_for_unit_fails_fast_on_failed_unit() {
        let guest = ScriptedGuest::new(vec![(0, "ActiveState=failed\n")]);
        match guest.wait_for_unit("nginx").await {
            Err(DriverError::UnitFailed { unit }) => assert_eq!(unit, "nginx"),
            other => panic!("expected UnitFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn port_waits_use_nc() {
        let guest = ScriptedGuest::new(vec![(1, ""), (0, ""), (0, ""), (1, "")]);
        assert!(guest.wait_for_open_port(80).await.is_ok());
        assert!(guest.wait_for_closed_port(80).await.is_ok());
        assert!(guest.commands().iter().all(|c| c == "nc -z localhost 80"));
    }

    #[tokio::test]
    async fn wait_for_window_matches_names() {
        let guest = ScriptedGuest::new(vec![(0, "xterm\n"), (0, "xterm\nFirefox - Start Page\n")]);
        assert!(guest.wait_for_window("^Firefox").await.is_ok());
        assert_eq!(guest.commands().len(), 2);
    }

    #[tokio::test]
    async fn wait_for_window_rejects_bad_pattern() {
        let guest = ScriptedGuest::new(vec![]);
        assert!(matches!(
            guest.wait_for_window("(unclosed").await,
            Err(DriverError::InvalidArgument(_))
        ));
        assert!(guest.commands().is_empty(), "nothing may run for a bad pattern");
    }

    #[tokio::test]
    async fn block_and_unblock_toggle_link() {
        let guest = ScriptedGuest::new(vec![(0, ""), (0, "")]);
        assert!(guest.block("eth1").await.is_ok());
        assert!(guest.unblock("eth1").await.is_ok());
        assert_eq!(guest.commands(), vec!["ip link set 'eth1' down", "ip link set 'eth1' up"]);
    }

    #[tokio::test]
    async fn copy_file_from_host_verifies_checksum() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("motd");
        std::fs::write(&source, b"welcome\n").expect("write");
        let digest = format!("{}  /etc/motd\n", compute_hash(b"welcome\n"));

        let guest = ScriptedGuest::new(vec![(0, ""), (0, digest.as_str())]);
        assert!(guest.copy_file_from_host(&source, "/etc/motd").await.is_ok());
        assert_eq!(guest.commands()[1], "sha256sum '/etc/motd'");
    }

    #[tokio::test]
    async fn copy_file_from_host_detects_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("motd");
        std::fs::write(&source, b"welcome\n").expect("write");
        let wrong = format!("{}  /etc/motd\n", compute_hash(b"something else"));

        let guest = ScriptedGuest::new(vec![(0, ""), (0, wrong.as_str())]);
        assert!(matches!(
            guest.copy_file_from_host(&source, "/etc/motd").await,
            Err(DriverError::TransferMismatch { .. })
        ));
    }

    #[test]
    fn active_state_reads_property_line() {
        assert_eq!(active_state("ActiveState=active\n"), Some("active"));
        assert_eq!(active_state("Id=x\nActiveState=failed\n"), Some("failed"));
        assert_eq!(active_state("Unit x not found.\n"), None);
    }
}
