use std::{
    io::{self, Write as _},
    path::{Path, PathBuf},
    sync::Mutex,
    thread::sleep,
    time::{Duration, Instant},
};

use tracing::debug;

use super::{Transport, TransportKind};

#[cfg(unix)]
use std::os::unix::net::UnixStream;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

#[cfg(unix)]
type PipeStream = UnixStream;
#[cfg(windows)]
type PipeStream = std::fs::File;

/// Stream-oriented named-pipe sender.
///
/// The pipe is connection-oriented, so `send` first ensures a live connection, bounded by the
/// connect timeout. A write that fails or times out drops the frame and the connection; the next
/// `send` reconnects, never a background task. The underlying stream is not safe for concurrent
/// writers, so all sends go through one critical section.
///
/// On Windows the pipe is opened as `\\.\pipe\<name>`; elsewhere the name is a filesystem path
/// served by a local stream socket.
pub(crate) struct NamedPipeSender {
    path: PathBuf,
    connect_timeout: Duration,
    write_timeout: Duration,
    stream: Mutex<Option<PipeStream>>,
}

impl NamedPipeSender {
    /// Creates a sender for the given pipe name.
    ///
    /// No connection is attempted here; the first `send` connects lazily.
    pub fn new(name: &str, connect_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            path: pipe_path(name),
            connect_timeout,
            write_timeout,
            stream: Mutex::new(None),
        }
    }

    fn connect(&self) -> io::Result<PipeStream> {
        let deadline = Instant::now() + self.connect_timeout;
        loop {
            match open_pipe(&self.path, self.write_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) if is_transient_connect_error(&e) && Instant::now() < deadline => {
                    sleep(CONNECT_RETRY_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Transport for NamedPipeSender {
    fn kind(&self) -> TransportKind {
        TransportKind::NamedPipe
    }

    fn send(&mut self, frame: &[u8]) -> bool {
        let mut guard = match self.stream.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if guard.is_none() {
            match self.connect() {
                Ok(stream) => *guard = Some(stream),
                Err(e) => {
                    debug!(error = %e, path = %self.path.display(), "Failed to connect to named pipe.");
                    return false;
                }
            }
        }

        let Some(stream) = guard.as_mut() else { return false };

        match stream.write_all(frame) {
            Ok(()) => true,
            Err(e) => {
                // A timed-out or failed write leaves the stream in an unknown state; drop the
                // connection and let the next send re-establish it.
                debug!(error = %e, "Named pipe write failed, dropping frame.");
                *guard = None;
                false
            }
        }
    }
}

#[cfg(unix)]
fn pipe_path(name: &str) -> PathBuf {
    PathBuf::from(name)
}

#[cfg(windows)]
fn pipe_path(name: &str) -> PathBuf {
    PathBuf::from(format!(r"\\.\pipe\{name}"))
}

#[cfg(unix)]
fn open_pipe(path: &Path, write_timeout: Duration) -> io::Result<PipeStream> {
    let stream = UnixStream::connect(path)?;
    stream.set_write_timeout(Some(write_timeout))?;
    Ok(stream)
}

#[cfg(windows)]
fn open_pipe(path: &Path, _write_timeout: Duration) -> io::Result<PipeStream> {
    // Writes to a local pipe complete or fail promptly; Windows exposes no per-write deadline on
    // a `File` handle, so the write timeout is best-effort there.
    std::fs::OpenOptions::new().write(true).open(path)
}

#[cfg(unix)]
fn is_transient_connect_error(e: &io::Error) -> bool {
    // The pipe server exists but has no free connection slot right now.
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionRefused)
}

#[cfg(windows)]
fn is_transient_connect_error(e: &io::Error) -> bool {
    const ERROR_PIPE_BUSY: i32 = 231;
    e.raw_os_error() == Some(ERROR_PIPE_BUSY)
}

#[cfg(all(test, unix))]
mod tests {
    use std::{
        io::Read as _,
        os::unix::net::UnixListener,
        time::{Duration, Instant},
    };

    use super::NamedPipeSender;
    use crate::transport::Transport;

    struct TempPipe {
        path: std::path::PathBuf,
    }

    impl TempPipe {
        fn new(tag: &str) -> Self {
            let path = std::env::temp_dir()
                .join(format!("dogstatsd-client-{tag}-{}.pipe", std::process::id()));
            let _ = std::fs::remove_file(&path);
            Self { path }
        }
    }

    impl Drop for TempPipe {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn sender(path: &std::path::Path) -> NamedPipeSender {
        NamedPipeSender::new(
            path.to_str().unwrap(),
            Duration::from_millis(100),
            Duration::from_millis(300),
        )
    }

    #[test]
    fn connects_lazily_and_writes_frames() {
        let temp = TempPipe::new("pipe-write");
        let listener = UnixListener::bind(&temp.path).unwrap();

        let mut sender = sender(&temp.path);
        assert!(sender.send(b"a:1|c"));
        assert!(sender.send(b"b:2|g"));

        let (mut server, _) = listener.accept().unwrap();
        let mut buf = [0u8; 64];
        let len = server.read(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"a:1|cb:2|g");
    }

    #[test]
    fn every_send_fails_while_pipe_is_absent() {
        let temp = TempPipe::new("pipe-absent");
        let mut sender = sender(&temp.path);

        assert!(!sender.send(b"a:1|c"));
        assert!(!sender.send(b"b:2|g"));
    }

    #[test]
    fn reconnects_on_send_after_server_restart() {
        let temp = TempPipe::new("pipe-reconnect");
        let listener = UnixListener::bind(&temp.path).unwrap();

        let mut sender = sender(&temp.path);
        assert!(sender.send(b"a:1|c"));

        // Kill the server side; the established connection goes stale.
        let (server, _) = listener.accept().unwrap();
        drop(server);
        drop(listener);

        // The stale connection is detected on write (possibly needing one more send for the
        // kernel to surface the broken pipe), after which the sender reconnects.
        // Dropping the listener does not unlink the socket file; remove it so rebinding works.
        std::fs::remove_file(&temp.path).unwrap();
        let listener = UnixListener::bind(&temp.path).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut delivered = false;
        while Instant::now() < deadline {
            if sender.send(b"b:2|g") {
                listener.set_nonblocking(true).unwrap();
                if let Ok((mut server, _)) = listener.accept() {
                    let mut buf = [0u8; 64];
                    let len = server.read(&mut buf).unwrap();
                    assert_eq!(&buf[..len], b"b:2|g");
                    delivered = true;
                    break;
                }
            }
        }
        assert!(delivered);
    }
}
