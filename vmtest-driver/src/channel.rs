//! Line-oriented command channel over the guest's Unix domain socket.
//!
//! The guest exposes a shell on `<state_dir>/65535.socket`. See
//! [`vmtest_core::framing`] for the wire format. One request is in flight at
//! a time; callers serialize access through `&mut GuestChannel`.

use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use vmtest_core::{frame_request, parse_trailer, strip_line_terminator, ExecOutput, HANDSHAKE_REPLY, HANDSHAKE_REQUEST};

use crate::DriverError;

/// An open, verified connection to the guest shell.
#[derive(Debug)]
pub struct GuestChannel {
    machine: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl GuestChannel {
    /// Connect to `socket_path` and check that the guest shell answers.
    ///
    /// Sends `echo hello` and expects exactly `hello` back. A wrong or empty
    /// reply yields `Ok(None)`.
    ///
    /// # Errors
    /// Returns the underlying I/O error if the socket cannot be opened,
    /// written or read. Callers polling for guest readiness treat it as
    /// "not yet".
    pub async fn handshake(machine: &str, socket_path: &Path) -> std::io::Result<Option<Self>> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, write_half) = stream.into_split();
        let mut channel = Self {
            machine: machine.to_owned(),
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        channel.writer.write_all(HANDSHAKE_REQUEST.as_bytes()).await?;
        channel.writer.flush().await?;

        let mut reply = Vec::new();
        channel.reader.read_until(b'\n', &mut reply).await?;
        let reply = String::from_utf8_lossy(&reply);
        if strip_line_terminator(&reply) != HANDSHAKE_REPLY {
            tracing::debug!(machine, reply = %reply.trim_end(), "unexpected handshake reply");
            return Ok(None);
        }

        Ok(Some(channel))
    }

    /// Run `command` in the guest and collect its output and exit status.
    ///
    /// Output lines are accumulated verbatim until the trailer line arrives.
    /// Text preceding the marker on the trailer line is kept as output.
    ///
    /// # Errors
    /// Returns [`DriverError::ConnectionLost`] if the stream ends before the
    /// trailer or breaks while writing or reading. The channel is unusable
    /// afterwards.
    pub async fn run(&mut self, command: &str) -> Result<ExecOutput, DriverError> {
        let request = frame_request(command);
        if let Err(e) = self.send(request.as_bytes()).await {
            return Err(self.lost(&format!("write request: {e}")));
        }

        let mut output = String::new();
        let mut line = Vec::new();
        loop {
            line.clear();
            match self.reader.read_until(b'\n', &mut line).await {
                Ok(0) => return Err(self.lost("end of stream before exit status")),
                Ok(_) => {}
                Err(e) => return Err(self.lost(&format!("read response: {e}"))),
            }

            let text = String::from_utf8_lossy(&line);
            if let Some(trailer) = parse_trailer(&text) {
                output.push_str(trailer.spillover);
                return Ok(ExecOutput::new(trailer.status, output));
            }
            output.push_str(&text);
        }
    }

    async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    fn lost(&self, reason: &str) -> DriverError {
        DriverError::ConnectionLost {
            machine: self.machine.clone(),
            reason: reason.to_owned(),
        }
    }
}
