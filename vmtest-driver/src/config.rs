//! Machine configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vmtest_core::{shell_quote, MachineName, RunId, COMMAND_SOCKET};

use crate::{DriverError, RetryPolicy};

/// Display and reboot options passed to QEMU through `QEMU_OPTS`.
pub const DEFAULT_QEMU_OPTS: &str = "-nographic -no-reboot";

/// Name used for start scripts that do not follow the `run-<name>-vm` pattern.
pub const FALLBACK_MACHINE_NAME: &str = "machine";

/// Configuration for one machine under test.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct MachineConfig {
    /// Identifying name, used in logs and for the scratch directory.
    pub name: MachineName,

    /// Shell command that starts the VM. When `None`, a plain `qemu-kvm`
    /// invocation is built from [`hda`](Self::hda) and [`cdrom`](Self::cdrom).
    pub start_command: Option<String>,

    /// Disk image attached as a virtio drive by the default start command.
    pub hda: Option<PathBuf>,

    /// CD-ROM image attached by the default start command.
    pub cdrom: Option<PathBuf>,

    /// Per-machine scratch directory. Holds the command socket and is the
    /// working directory of the VM process.
    pub state_dir: PathBuf,

    /// Extra hypervisor options exported as `QEMU_OPTS`.
    pub qemu_opts: String,

    /// Budget for the boot wait, the handshake and every `wait_for_*` helper.
    pub retry: RetryPolicy,
}

impl MachineConfig {
    /// Create a config with default options.
    ///
    /// # Arguments
    /// - `name`: machine name
    /// - `state_dir`: scratch directory (created on start if missing)
    #[must_use]
    pub fn new(name: MachineName, state_dir: PathBuf) -> Self {
        Self {
            name,
            start_command: None,
            hda: None,
            cdrom: None,
            state_dir,
            qemu_opts: DEFAULT_QEMU_OPTS.to_owned(),
            retry: RetryPolicy::default(),
        }
    }

    /// Create a config whose scratch directory is `<run_dir>/<name>`.
    #[must_use]
    pub fn in_run_dir(name: MachineName, run_dir: &Path) -> Self {
        let state_dir = run_dir.join(name.as_str());
        Self::new(name, state_dir)
    }

    /// Create a config from a VM start script.
    ///
    /// Scripts named `run-<name>-vm` give the machine its name; anything else
    /// is called [`FALLBACK_MACHINE_NAME`]. The script path is made absolute
    /// because the VM runs inside its scratch directory.
    ///
    /// # Errors
    /// Returns [`DriverError::Io`] if the path cannot be made absolute and
    /// [`DriverError::Core`] if the derived name is invalid.
    pub fn from_start_script(script: &Path, run_dir: &Path) -> Result<Self, DriverError> {
        let name = script
            .file_name()
            .and_then(|f| f.to_str())
            .and_then(|f| f.strip_prefix("run-"))
            .and_then(|f| f.strip_suffix("-vm"))
            .filter(|n| !n.is_empty())
            .unwrap_or(FALLBACK_MACHINE_NAME);
        let name = MachineName::new(name)?;

        let script = std::path::absolute(script)?;
        let command = shell_quote(&script.to_string_lossy());

        Ok(Self::in_run_dir(name, run_dir).with_start_command(command))
    }

    /// Default parent of all scratch directories for one driver run.
    #[must_use]
    pub fn default_run_dir(run_id: RunId) -> PathBuf {
        std::env::temp_dir().join(format!("vmtest-{run_id}"))
    }

    /// Use `command` to start the VM.
    #[must_use]
    pub fn with_start_command(mut self, command: impl Into<String>) -> Self {
        self.start_command = Some(command.into());
        self
    }

    /// Attach a disk image (default start command only).
    #[must_use]
    pub fn with_hda(mut self, hda: PathBuf) -> Self {
        self.hda = Some(hda);
        self
    }

    /// Attach a CD-ROM image (default start command only).
    #[must_use]
    pub fn with_cdrom(mut self, cdrom: PathBuf) -> Self {
        self.cdrom = Some(cdrom);
        self
    }

    /// Override the retry budget.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The shell command that launches the VM.
    #[must_use]
    pub fn start_command(&self) -> String {
        if let Some(command) = &self.start_command {
            return command.clone();
        }

        let mut command = "qemu-kvm -m 384 $QEMU_OPTS".to_owned();
        if let Some(hda) = &self.hda {
            let drive = format!("file={},if=virtio,werror=report", hda.display());
            command.push_str(" -drive ");
            command.push_str(&shell_quote(&drive));
        }
        if let Some(cdrom) = &self.cdrom {
            command.push_str(" -cdrom ");
            command.push_str(&shell_quote(&cdrom.to_string_lossy()));
        }
        command
    }

    /// Path of the guest command socket.
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.state_dir.join(COMMAND_SOCKET)
    }
}
