//! Background reader for the VM console.
//!
//! The monitor is the only reader of the VM's merged stdout/stderr pipe. It
//! logs every console line and tells the connecting side when the guest is
//! ready. Closure of the pipe is an event of its own: a VM that dies before
//! printing the sentinel still wakes the waiter, which then fails in the
//! handshake instead of waiting on a signal that never comes.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use vmtest_core::{is_boot_sentinel, strip_line_terminator};

/// Room for one [`BootSignal::Ready`] plus the final
/// [`BootSignal::OutputClosed`]. Extra notifications are dropped.
pub const BOOT_SIGNAL_CAPACITY: usize = 2;

/// Boot-completion notification sent by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootSignal {
    /// The guest printed the boot-ready sentinel.
    Ready,
    /// The console stream ended, i.e. the VM exited or closed its output.
    OutputClosed,
}

/// Create the channel for one boot attempt.
#[must_use]
pub fn boot_signal() -> (mpsc::Sender<BootSignal>, mpsc::Receiver<BootSignal>) {
    mpsc::channel(BOOT_SIGNAL_CAPACITY)
}

/// Spawn the monitor task over `output`.
///
/// The task runs until `output` reaches end-of-stream and cannot be cancelled
/// from outside; dropping the returned handle detaches it.
pub fn spawn_monitor<R>(machine: String, output: R, signal: mpsc::Sender<BootSignal>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(monitor_output(machine, output, signal))
}

async fn monitor_output<R>(machine: String, output: R, signal: mpsc::Sender<BootSignal>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(output);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                tracing::info!(machine = %machine, "{}", strip_line_terminator(&line));
                if is_boot_sentinel(&line) {
                    notify(&signal, BootSignal::Ready);
                }
            }
            Err(e) => {
                tracing::warn!(machine = %machine, error = %e, "console read failed, treating as closed");
                break;
            }
        }
    }

    tracing::debug!(machine = %machine, "console stream closed");
    notify(&signal, BootSignal::OutputClosed);
}

fn notify(signal: &mpsc::Sender<BootSignal>, event: BootSignal) {
    // A full queue already holds a notification, and a closed one means
    // nobody is waiting any more.
    let _ = signal.try_send(event);
}
