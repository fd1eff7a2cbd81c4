use std::{io, os::unix::net::UnixDatagram, path::Path, thread::sleep, time::Duration};

use tracing::debug;

use super::{Transport, TransportKind};

/// How long to wait between retries when the kernel send buffer is full.
const BUFFER_FULL_RETRY_INTERVAL: Duration = Duration::from_millis(10);

#[cfg(target_os = "linux")]
const ENOBUFS: i32 = 105;
#[cfg(not(target_os = "linux"))]
const ENOBUFS: i32 = 55;

/// Unix-domain datagram sender.
///
/// Unlike UDP, a `SOCK_DGRAM` Unix socket reports a full kernel send buffer to the writer, so the
/// sender retries that one condition for a bounded amount of time before dropping the frame.
pub(crate) struct UdsSender {
    socket: UnixDatagram,
    retries: u32,
}

impl UdsSender {
    /// Connects to the agent socket at `path`.
    ///
    /// `buffer_full_block_duration` bounds how long a single send may block on a full send
    /// buffer; `None` means drop on the first transient failure.
    pub fn connect(path: &Path, buffer_full_block_duration: Option<Duration>) -> io::Result<Self> {
        let socket = UnixDatagram::unbound()?;
        socket.connect(path)?;

        let retries = buffer_full_block_duration
            .map(|d| (d.as_millis() / BUFFER_FULL_RETRY_INTERVAL.as_millis()) as u32)
            .unwrap_or(0);

        Ok(Self { socket, retries })
    }

    #[cfg(test)]
    fn retry_count(&self) -> u32 {
        self.retries
    }

    #[cfg(test)]
    fn socket(&self) -> &UnixDatagram {
        &self.socket
    }
}

impl Transport for UdsSender {
    fn kind(&self) -> TransportKind {
        TransportKind::UnixSocket
    }

    fn send(&mut self, frame: &[u8]) -> bool {
        for attempt in 0..=self.retries {
            match self.socket.send(frame) {
                Ok(_) => return true,
                Err(e) if is_buffer_full(&e) => {
                    // Sleep only between attempts; a final failure reports immediately.
                    if attempt < self.retries {
                        sleep(BUFFER_FULL_RETRY_INTERVAL);
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Failed to send to Unix domain socket.");
                    return false;
                }
            }
        }

        debug!(retries = self.retries, "Unix socket send buffer still full, dropping frame.");
        false
    }
}

fn is_buffer_full(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(ENOBUFS)
}
