//! The machine under test: lifecycle, connection and command execution.
//!
//! ```text
//! start()     spawn VM ──► monitor task ──► BootSignal
//! connect()   start() ─► retry(boot signal) ─► retry(handshake) ─► GuestChannel
//! execute()   connect() ─► GuestChannel::run
//! shutdown()  execute("poweroff") ─► wait_for_shutdown()
//! ```
//!
//! `booted` and `connected` are not stored as flags: a machine is booted
//! while it owns a [`VmProcess`] and connected while it owns a
//! [`GuestChannel`]. Dropping the process also drops the channel.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use vmtest_core::{ExecOutput, MachineName};

use crate::channel::GuestChannel;
use crate::monitor::BootSignal;
use crate::process::{spawn_vm, VmProcess};
use crate::retry::retry;
use crate::{DriverError, MachineConfig, RetryPolicy};

/// Lower bound for one handshake attempt, for policies with tiny intervals.
const MIN_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct MachineState {
    process: Option<VmProcess>,
    /// Boot notifications of the current boot attempt, until one is consumed.
    boot_signal: Option<mpsc::Receiver<BootSignal>>,
    channel: Option<GuestChannel>,
}

/// A virtual machine under test.
///
/// All operations take `&self`; internal state sits behind an async mutex so
/// an `Arc<Machine>` can be shared between tasks. Commands are serialized:
/// only one request is ever in flight on the guest channel.
#[derive(Debug)]
pub struct Machine {
    config: MachineConfig,
    state: Mutex<MachineState>,
}

impl Machine {
    /// Create a machine. Nothing is started until [`start`](Self::start) or
    /// the first command.
    #[must_use]
    pub fn new(config: MachineConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MachineState::default()),
        }
    }

    /// The machine's name.
    #[must_use]
    pub fn name(&self) -> &MachineName {
        &self.config.name
    }

    /// The machine's configuration.
    #[must_use]
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Scratch directory of this machine.
    #[must_use]
    pub fn state_dir(&self) -> &Path {
        &self.config.state_dir
    }

    /// Path of the guest command socket.
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.config.socket_path()
    }

    /// Returns `true` while the VM process is owned by this machine.
    pub async fn is_booted(&self) -> bool {
        self.state.lock().await.process.is_some()
    }

    /// Returns `true` while a verified guest channel is cached.
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.channel.is_some()
    }

    /// Returns `true` if the machine is booted and connected.
    pub async fn is_up(&self) -> bool {
        let state = self.state.lock().await;
        state.process.is_some() && state.channel.is_some()
    }

    /// Launch the VM. No-op if it is already running.
    ///
    /// Returns once the process is spawned; the guest boots in the background.
    ///
    /// # Errors
    /// Returns [`DriverError::LaunchFailure`] if the process cannot be created.
    pub async fn start(&self) -> Result<(), DriverError> {
        let mut state = self.state.lock().await;
        self.start_locked(&mut state).await
    }

    /// Wait for the guest to boot and open the command channel. No-op if
    /// already connected; starts the VM if needed.
    ///
    /// The boot wait and the handshake each get the full retry budget. A
    /// single handshake attempt gives up after one retry interval (at least
    /// 100 ms), so a socket that accepts but never answers cannot stall it.
    ///
    /// # Errors
    /// Returns [`DriverError::Timeout`] if the guest never signals boot or
    /// never answers the handshake, and launch errors from
    /// [`start`](Self::start).
    pub async fn connect(&self) -> Result<(), DriverError> {
        let mut state = self.state.lock().await;
        self.connect_locked(&mut state).await
    }

    /// Run `command` in the guest and return its exit status and output.
    ///
    /// Connects first if necessary. There is no timeout: a command that never
    /// returns blocks the caller.
    ///
    /// # Errors
    /// Returns [`DriverError::ConnectionLost`] if the channel closes before
    /// the response is complete. The cached channel is dropped in that case.
    /// Errors from [`connect`](Self::connect) are propagated.
    pub async fn execute(&self, command: &str) -> Result<ExecOutput, DriverError> {
        let mut state = self.state.lock().await;
        self.connect_locked(&mut state).await?;

        let Some(channel) = state.channel.as_mut() else {
            return Err(DriverError::ConnectionLost {
                machine: self.name().to_string(),
                reason: "no channel after connect".to_owned(),
            });
        };

        tracing::debug!(machine = %self.name(), command, "executing command");
        let result = channel.run(command).await;
        match &result {
            Ok(out) => tracing::debug!(machine = %self.name(), status = out.status, "command finished"),
            Err(DriverError::ConnectionLost { .. }) => {
                tracing::warn!(machine = %self.name(), command, "guest channel lost");
                state.channel = None;
            }
            Err(_) => {}
        }
        result
    }

    /// Wait for the VM process to exit, then forget process and channel.
    /// No-op if not booted.
    ///
    /// # Errors
    /// Returns [`DriverError::Io`] if waiting on the process fails.
    pub async fn wait_for_shutdown(&self) -> Result<(), DriverError> {
        let mut state = self.state.lock().await;
        self.reap_locked(&mut state).await
    }

    /// Power the guest off and wait for the VM process to exit. No-op if not
    /// booted.
    ///
    /// The guest may tear down the channel before answering `poweroff`; that
    /// [`DriverError::ConnectionLost`] is expected and swallowed.
    ///
    /// # Errors
    /// Propagates any other error from [`execute`](Self::execute) and from
    /// [`wait_for_shutdown`](Self::wait_for_shutdown).
    pub async fn shutdown(&self) -> Result<(), DriverError> {
        if !self.is_booted().await {
            return Ok(());
        }

        tracing::info!(machine = %self.name(), "shutting down");
        match self.execute("poweroff").await {
            Ok(out) => tracing::debug!(machine = %self.name(), status = out.status, "poweroff accepted"),
            Err(DriverError::ConnectionLost { .. }) => {
                tracing::debug!(machine = %self.name(), "guest closed the channel while powering off");
            }
            Err(e) => return Err(e),
        }

        self.wait_for_shutdown().await
    }

    /// Kill the VM process without involving the guest, like pulling the
    /// plug. No-op if not booted.
    ///
    /// # Errors
    /// Returns [`DriverError::Io`] if the process cannot be killed or reaped.
    pub async fn crash(&self) -> Result<(), DriverError> {
        let mut state = self.state.lock().await;
        let Some(process) = state.process.as_mut() else {
            return Ok(());
        };

        tracing::info!(machine = %self.name(), "simulating power cut");
        process.kill().await?;
        self.reap_locked(&mut state).await
    }

    async fn start_locked(&self, state: &mut MachineState) -> Result<(), DriverError> {
        if state.process.is_some() {
            return Ok(());
        }

        let (process, boot_signal) = spawn_vm(&self.config).await?;
        state.process = Some(process);
        state.boot_signal = Some(boot_signal);
        state.channel = None;
        Ok(())
    }

    async fn connect_locked(&self, state: &mut MachineState) -> Result<(), DriverError> {
        if state.channel.is_some() {
            return Ok(());
        }
        self.start_locked(state).await?;

        let name = self.name().as_str();
        let policy = self.config.retry;

        if let Some(rx) = state.boot_signal.as_mut() {
            let signal = retry("boot signal", policy, || {
                let polled = rx.try_recv().ok();
                async move { Ok(polled) }
            })
            .await?;

            match signal {
                BootSignal::Ready => tracing::info!(machine = name, "VM booted"),
                BootSignal::OutputClosed => {
                    tracing::warn!(machine = name, "VM output closed before boot sentinel");
                }
            }
            state.boot_signal = None;
        }

        let socket_path = self.socket_path();
        let socket_path = socket_path.as_path();
        // An endpoint may accept before the guest shell is there to answer.
        let attempt_timeout = policy.interval.max(MIN_HANDSHAKE_TIMEOUT);
        let channel = retry("guest handshake", policy, || async move {
            match tokio::time::timeout(attempt_timeout, GuestChannel::handshake(name, socket_path)).await {
                Ok(Ok(channel)) => Ok(channel),
                Ok(Err(e)) => {
                    tracing::debug!(machine = name, error = %e, "guest handshake failed");
                    Ok(None)
                }
                Err(_) => {
                    tracing::debug!(machine = name, "guest handshake unanswered");
                    Ok(None)
                }
            }
        })
        .await?;

        tracing::info!(machine = name, socket = %socket_path.display(), "connected to guest");
        state.channel = Some(channel);
        Ok(())
    }

    async fn reap_locked(&self, state: &mut MachineState) -> Result<(), DriverError> {
        let Some(mut process) = state.process.take() else {
            return Ok(());
        };
        state.channel = None;
        state.boot_signal = None;

        let status = process.wait().await?;
        tracing::info!(
            machine = %self.name(),
            %status,
            uptime_ms = process.uptime().num_milliseconds(),
            "VM exited"
        );
        Ok(())
    }
}
