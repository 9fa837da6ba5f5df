//! VM process handle and spawning.

use std::process::{ExitStatus, Stdio};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::monitor::{boot_signal, spawn_monitor, BootSignal};
use crate::{DriverError, MachineConfig};

/// Environment variable pointing the VM at its scratch directory.
pub const ENV_TMPDIR: &str = "TMPDIR";

/// Environment variable carrying hypervisor networking/display options.
pub const ENV_QEMU_OPTS: &str = "QEMU_OPTS";

/// Environment variable carrying extra kernel parameters.
pub const ENV_QEMU_KERNEL_PARAMS: &str = "QEMU_KERNEL_PARAMS";

/// A running VM process.
///
/// The process leads its own process group. Dropping this handle before the
/// process was reaped kills the whole group. Use [`VmProcess::wait`] to reap
/// it after a guest poweroff.
#[derive(Debug)]
#[non_exhaustive]
pub struct VmProcess {
    /// OS process id, if the process had not already exited when spawned.
    pub pid: Option<u32>,

    /// Timestamp when the process was spawned.
    pub started_at: DateTime<Utc>,

    child: Child,
}

impl VmProcess {
    /// Wait for the process to exit.
    ///
    /// # Errors
    /// Returns [`DriverError::Io`] if waiting on the child fails.
    pub async fn wait(&mut self) -> Result<ExitStatus, DriverError> {
        Ok(self.child.wait().await?)
    }

    /// Kill the process together with everything it spawned, then wait
    /// for it.
    ///
    /// # Errors
    /// Returns [`DriverError::Io`] if the signal cannot be delivered.
    pub async fn kill(&mut self) -> Result<(), DriverError> {
        if let Some(pid) = self.child.id() {
            if let Err(e) = kill_group(pid) {
                tracing::warn!(pid, error = %e, "failed to signal VM process group");
            }
        }
        Ok(self.child.kill().await?)
    }

    /// Time since spawn.
    #[must_use]
    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}

impl Drop for VmProcess {
    fn drop(&mut self) {
        // `kill_on_drop` only reaches the group leader.
        if let Some(pid) = self.child.id() {
            let _ = kill_group(pid);
        }
    }
}

/// Send `SIGKILL` to the process group led by `pid`. A group that is already
/// gone is not an error.
fn kill_group(pid: u32) -> nix::Result<()> {
    let pgid = i32::try_from(pid).map(Pid::from_raw).map_err(|_| Errno::EINVAL)?;
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Build the command that launches the VM described by `config`.
///
/// The start command runs under `sh -c` and first redirects its own stderr
/// into stdout, so the VM's two output streams arrive on one pipe in the
/// order they were written. Stdin is `/dev/null`. The shell leads a new
/// process group so the VM and any helpers it forks can be killed together.
#[must_use]
pub fn vm_command(config: &MachineConfig) -> Command {
    let state_dir = &config.state_dir;
    let script = format!("exec 2>&1\n{}", config.start_command());

    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(script)
        .current_dir(state_dir)
        .env(ENV_TMPDIR, state_dir)
        .env(ENV_QEMU_OPTS, &config.qemu_opts)
        .env(ENV_QEMU_KERNEL_PARAMS, format!("hostTmpDir={}", state_dir.display()))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .process_group(0)
        .kill_on_drop(true);
    command
}

/// Spawn the VM and its console monitor.
///
/// Returns as soon as the process exists; booting continues in the
/// background. The receiver gets the boot notifications of this attempt.
///
/// # Errors
/// Returns [`DriverError::LaunchFailure`] if the scratch directory cannot be
/// created or the process cannot be spawned.
pub async fn spawn_vm(config: &MachineConfig) -> Result<(VmProcess, mpsc::Receiver<BootSignal>), DriverError> {
    let machine = config.name.to_string();
    let launch_failure = |reason: String| DriverError::LaunchFailure {
        machine: machine.clone(),
        reason,
    };

    tokio::fs::create_dir_all(&config.state_dir)
        .await
        .map_err(|e| launch_failure(format!("create {}: {e}", config.state_dir.display())))?;

    tracing::info!(
        machine = %machine,
        state_dir = %config.state_dir.display(),
        command = %config.start_command(),
        "spawning VM"
    );

    let mut child = vm_command(config)
        .spawn()
        .map_err(|e| launch_failure(format!("exec start command: {e}")))?;

    let output = child
        .stdout
        .take()
        .ok_or_else(|| launch_failure("stdout not piped".to_owned()))?;

    let (tx, rx) = boot_signal();
    // Detached: the task ends by itself when the console pipe closes.
    drop(spawn_monitor(machine.clone(), output, tx));

    let process = VmProcess {
        pid: child.id(),
        started_at: Utc::now(),
        child,
    };
    tracing::info!(machine = %machine, pid = ?process.pid, "VM process started");

    Ok((process, rx))
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;
    use std::path::PathBuf;

    use vmtest_core::MachineName;

    use super::*;

    fn config(state_dir: PathBuf, start: &str) -> MachineConfig {
        let name = match MachineName::new("probe") {
            Ok(n) => n,
            Err(e) => panic!("bad name: {e}"),
        };
        MachineConfig::new(name, state_dir).with_start_command(start)
    }

    #[tokio::test]
    async fn vm_sees_scratch_dir_environment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state_dir = dir.path().join("probe");
        // Relative write lands in the working directory; the sentinel goes to
        // stderr, which must reach the monitor through the merged pipe.
        let start = "printf '%s|%s|%s' \"$TMPDIR\" \"$QEMU_KERNEL_PARAMS\" \"$QEMU_OPTS\" > env.txt\necho ===UP=== >&2";
        let cfg = config(state_dir.clone(), start);

        let (mut process, mut rx) = match spawn_vm(&cfg).await {
            Ok(p) => p,
            Err(e) => panic!("spawn failed: {e}"),
        };
        let status = process.wait().await.expect("wait");
        assert!(status.success());
        assert_eq!(rx.recv().await, Some(BootSignal::Ready));
        assert_eq!(rx.recv().await, Some(BootSignal::OutputClosed));

        let env = std::fs::read_to_string(state_dir.join("env.txt")).expect("env.txt in state dir");
        let dir = state_dir.display();
        assert_eq!(env, format!("{dir}|hostTmpDir={dir}|-nographic -no-reboot"));
    }

    #[tokio::test]
    async fn stdin_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = config(dir.path().join("probe"), "read line; test -z \"$line\" && echo ===UP===");

        let (mut process, mut rx) = match spawn_vm(&cfg).await {
            Ok(p) => p,
            Err(e) => panic!("spawn failed: {e}"),
        };
        assert!(process.wait().await.expect("wait").success());
        assert_eq!(rx.recv().await, Some(BootSignal::Ready), "read from /dev/null must see EOF");
    }

    #[tokio::test]
    async fn unusable_scratch_dir_is_a_launch_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"").expect("write");
        let cfg = config(file.join("probe"), "true");

        match spawn_vm(&cfg).await {
            Err(DriverError::LaunchFailure { machine, .. }) => assert_eq!(machine, "probe"),
            other => panic!("expected LaunchFailure, got {other:?}"),
        }
    }

    #[test]
    fn vm_command_runs_in_state_dir() {
        let cfg = config(PathBuf::from("/tmp/vm-state"), "true");
        let command = vm_command(&cfg);
        let std_cmd = command.as_std();
        assert_eq!(std_cmd.get_program(), "sh");
        assert_eq!(std_cmd.get_current_dir(), Some(std::path::Path::new("/tmp/vm-state")));
        let env = |key: &str| {
            std_cmd
                .get_envs()
                .find(|(k, _)| *k == OsStr::new(key))
                .and_then(|(_, v)| v)
        };
        assert_eq!(env(ENV_TMPDIR), Some(OsStr::new("/tmp/vm-state")));
        assert_eq!(env(ENV_QEMU_KERNEL_PARAMS), Some(OsStr::new("hostTmpDir=/tmp/vm-state")));
    }
}
