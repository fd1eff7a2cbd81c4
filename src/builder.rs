use std::{
    env, io,
    net::{SocketAddr, ToSocketAddrs as _},
    sync::Arc,
    time::Duration,
};

#[cfg(unix)]
use std::path::PathBuf;

use thiserror::Error;

use crate::{
    client::DogStatsdClient,
    encoder::Encoder,
    frame::FrameBuffer,
    pool::BufferPool,
    telemetry::{TelemetryCounters, TelemetryReporter},
    transport::{NamedPipeSender, Transport, UdpSender},
    worker::{self, TransportSink},
};

#[cfg(unix)]
use crate::transport::UdsSender;

/// The default DogStatsD UDP port.
pub const DEFAULT_PORT: u16 = 8125;

/// Environment variable naming the host of the targeted agent.
pub const AGENT_HOST_ENV_VAR: &str = "DD_AGENT_HOST";

/// Environment variable naming the port of the targeted agent.
pub const DOGSTATSD_PORT_ENV_VAR: &str = "DD_DOGSTATSD_PORT";

/// Environment variable carrying the entity id injected as a constant tag.
pub const ENTITY_ID_ENV_VAR: &str = "DD_ENTITY_ID";

const ENTITY_ID_TAG_KEY: &str = "dd.internal.entity_id";

const DEFAULT_UDP_MAX_PACKET_SIZE: usize = 512;
#[cfg(unix)]
const DEFAULT_UDS_MAX_PACKET_SIZE: usize = 2048;
const DEFAULT_PIPE_MAX_PACKET_SIZE: usize = 8192;

const DEFAULT_QUEUE_CAPACITY: usize = 100_000;
const DEFAULT_IDLE_FLUSH_TIMEOUT: Duration = Duration::from_millis(100);
const DEFAULT_TELEMETRY_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

const PIPE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const PIPE_WRITE_TIMEOUT: Duration = Duration::from_millis(300);

const BUFFER_POOL_CAPACITY: usize = 1024;

/// Records inside a frame are newline separated, per the DogStatsD datagram format.
const FRAME_SEPARATOR: &[u8] = b"\n";

/// The shortest record the encoder can produce; the packet size must at least hold this.
const SMALLEST_VALID_RECORD: &[u8] = b"a:0|c";

/// Errors that can occur while building a [`DogStatsdClient`].
///
/// Everything here fails fast at construction; once a client exists, network trouble only ever
/// shows up as telemetry counts.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The remote address could not be parsed or resolved.
    #[error("invalid remote address: {reason}")]
    InvalidRemoteAddress {
        /// Details about the parsing failure.
        reason: String,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Details about the offending value.
        reason: String,
    },

    /// The transport handle could not be created.
    #[error("failed to set up transport")]
    Transport(#[from] io::Error),

    /// A background thread could not be spawned.
    #[error("failed to spawn background thread")]
    Backend,
}

/// Where the client ships its payloads.
#[derive(Clone, Debug)]
pub(crate) enum RemoteAddr {
    Udp(Vec<SocketAddr>),

    #[cfg(unix)]
    Uds(PathBuf),

    NamedPipe(String),
}

impl RemoteAddr {
    fn default_max_packet_size(&self) -> usize {
        match self {
            RemoteAddr::Udp(_) => DEFAULT_UDP_MAX_PACKET_SIZE,
            #[cfg(unix)]
            RemoteAddr::Uds(_) => DEFAULT_UDS_MAX_PACKET_SIZE,
            RemoteAddr::NamedPipe(_) => DEFAULT_PIPE_MAX_PACKET_SIZE,
        }
    }
}

impl TryFrom<&str> for RemoteAddr {
    type Error = String;

    fn try_from(addr: &str) -> Result<Self, Self::Error> {
        if let Some((scheme, rest)) = addr.split_once("://") {
            return match scheme {
                #[cfg(unix)]
                "unix" => Ok(RemoteAddr::Uds(PathBuf::from(rest))),
                "pipe" => Ok(RemoteAddr::NamedPipe(rest.to_string())),
                _ => Err(format!("invalid scheme '{scheme}' (expected 'unix' or 'pipe')")),
            };
        }

        match addr.to_socket_addrs() {
            Ok(addrs) => {
                let addrs: Vec<_> = addrs.collect();
                if addrs.is_empty() {
                    Err(format!("'{addr}' did not resolve to any address"))
                } else {
                    Ok(RemoteAddr::Udp(addrs))
                }
            }
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Builder for a [`DogStatsdClient`].
pub struct DogStatsdBuilder {
    remote_addr: Option<RemoteAddr>,
    max_packet_size: Option<usize>,
    queue_capacity: usize,
    idle_flush_timeout: Duration,
    blocking_enqueue_timeout: Option<Duration>,
    uds_buffer_full_block_duration: Option<Duration>,
    prefix: Option<String>,
    constant_tags: Vec<String>,
    telemetry: bool,
    telemetry_flush_interval: Duration,
    truncate_if_too_long: bool,
}

impl DogStatsdBuilder {
    /// Sets the remote address to ship payloads to.
    ///
    /// For UDP the address is `<host>:<port>`. A Unix domain socket is addressed as
    /// `unix://<path>`, a named pipe as `pipe://<name>`.
    ///
    /// When no address is set, the target is taken from the `DD_AGENT_HOST` and
    /// `DD_DOGSTATSD_PORT` environment variables, falling back to UDP to `127.0.0.1:8125`.
    ///
    /// # Errors
    ///
    /// If the given address cannot be parsed, an error is returned indicating the reason.
    pub fn with_remote_address<A>(mut self, addr: A) -> Result<Self, BuildError>
    where
        A: AsRef<str>,
    {
        self.remote_addr = Some(
            RemoteAddr::try_from(addr.as_ref())
                .map_err(|reason| BuildError::InvalidRemoteAddress { reason })?,
        );
        Ok(self)
    }

    /// Sets the maximum size of one outbound frame.
    ///
    /// Multiple records are packed into a frame up to this size; a single record larger than it
    /// is dropped. This should not exceed the receive buffer configured on the agent side.
    ///
    /// Defaults to 512 bytes for UDP, 2048 for Unix domain sockets, and 8192 for named pipes.
    #[must_use]
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = Some(max_packet_size);
        self
    }

    /// Sets the capacity of the delivery queue between producer threads and the worker.
    ///
    /// Defaults to 100 000 messages.
    #[must_use]
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Sets how long the worker lets a partially filled frame sit idle before flushing it, which
    /// bounds worst-case delivery latency during quiet periods.
    ///
    /// Must be non-zero, as it also bounds the worker's queue polling. Defaults to 100 ms.
    #[must_use]
    pub fn with_idle_flush_timeout(mut self, timeout: Duration) -> Self {
        self.idle_flush_timeout = timeout;
        self
    }

    /// Makes submissions wait up to `timeout` for queue capacity instead of dropping
    /// immediately when the queue is full.
    ///
    /// Off by default: a full queue rejects the message without blocking the caller.
    #[must_use]
    pub fn with_blocking_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.blocking_enqueue_timeout = Some(timeout);
        self
    }

    /// Sets how long a Unix-domain-socket send may keep retrying while the kernel send buffer is
    /// full, in 10 ms steps. Without it, the first transient failure drops the frame.
    ///
    /// Only meaningful for `unix://` targets.
    #[must_use]
    pub fn with_uds_buffer_full_block_duration(mut self, duration: Duration) -> Self {
        self.uds_buffer_full_block_duration = Some(duration);
        self
    }

    /// Sets a prefix prepended (dot-separated) to every metric name.
    #[must_use]
    pub fn with_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Sets constant tags attached to every metric, event, and service check, ahead of any
    /// per-call tags.
    ///
    /// When the `DD_ENTITY_ID` environment variable is set, a `dd.internal.entity_id` tag is
    /// appended automatically.
    #[must_use]
    pub fn with_constant_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.constant_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Sets whether the client periodically reports its own telemetry counters through the same
    /// pipeline, under `datadog.dogstatsd.client.*`.
    ///
    /// Defaults to `true`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: bool) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Sets the interval between telemetry flushes.
    ///
    /// Defaults to 10 seconds.
    #[must_use]
    pub fn with_telemetry_flush_interval(mut self, interval: Duration) -> Self {
        self.telemetry_flush_interval = interval;
        self
    }

    /// Sets whether oversized events and service checks are truncated rather than rejected.
    /// Individual calls can still opt in per submission.
    ///
    /// Defaults to `true`.
    #[must_use]
    pub fn with_truncation(mut self, truncate_if_too_long: bool) -> Self {
        self.truncate_if_too_long = truncate_if_too_long;
        self
    }

    /// Builds the client, spawning its delivery worker (and telemetry reporter, when enabled).
    ///
    /// # Errors
    ///
    /// Configuration problems surface here rather than at first send: an unresolvable address,
    /// a frame too small to hold a record, a zero-capacity queue, or a transport that cannot be
    /// created.
    pub fn build(self) -> Result<DogStatsdClient, BuildError> {
        let remote_addr = match &self.remote_addr {
            Some(addr) => addr.clone(),
            None => default_remote_addr()?,
        };

        if self.queue_capacity == 0 {
            return Err(BuildError::InvalidConfiguration {
                reason: "queue capacity must be at least 1".to_string(),
            });
        }

        // A zero timeout would turn the worker's timed queue poll into a busy loop.
        if self.idle_flush_timeout.is_zero() {
            return Err(BuildError::InvalidConfiguration {
                reason: "idle flush timeout must be non-zero".to_string(),
            });
        }

        let max_packet_size =
            self.max_packet_size.unwrap_or_else(|| remote_addr.default_max_packet_size());
        if max_packet_size < SMALLEST_VALID_RECORD.len() {
            return Err(BuildError::InvalidConfiguration {
                reason: format!(
                    "maximum packet size must be at least {} bytes",
                    SMALLEST_VALID_RECORD.len()
                ),
            });
        }
        if FRAME_SEPARATOR.len() >= max_packet_size {
            return Err(BuildError::InvalidConfiguration {
                reason: "record separator does not fit in the maximum packet size".to_string(),
            });
        }

        let transport: Box<dyn Transport> = match &remote_addr {
            RemoteAddr::Udp(addrs) => Box::new(UdpSender::connect(addrs)?),
            #[cfg(unix)]
            RemoteAddr::Uds(path) => {
                Box::new(UdsSender::connect(path, self.uds_buffer_full_block_duration)?)
            }
            RemoteAddr::NamedPipe(name) => {
                Box::new(NamedPipeSender::new(name, PIPE_CONNECT_TIMEOUT, PIPE_WRITE_TIMEOUT))
            }
        };
        let transport_kind = transport.kind();

        let mut constant_tags = self.constant_tags;
        if let Some(tag) = entity_id_tag(env::var(ENTITY_ID_ENV_VAR).ok().as_deref()) {
            constant_tags.push(tag);
        }

        let pool = Arc::new(BufferPool::new(BUFFER_POOL_CAPACITY));
        let telemetry = Arc::new(TelemetryCounters::new());

        let sink = TransportSink::new(transport, Arc::clone(&telemetry));
        let frame = FrameBuffer::new(sink, max_packet_size, FRAME_SEPARATOR);

        let (sender, worker_thread) = worker::spawn(
            self.queue_capacity,
            self.blocking_enqueue_timeout,
            self.idle_flush_timeout,
            frame,
            Arc::clone(&telemetry),
        )
        .map_err(|_| BuildError::Backend)?;

        let reporter = if self.telemetry {
            let mut tags = vec![
                "client:rust".to_string(),
                format!("client_version:{}", env!("CARGO_PKG_VERSION")),
                format!("client_transport:{}", transport_kind.as_tag()),
            ];
            tags.extend(constant_tags.iter().cloned());

            let telemetry_encoder = Encoder::new(Arc::clone(&pool), None, &tags);
            let reporter = TelemetryReporter::spawn(
                self.telemetry_flush_interval,
                Arc::clone(&telemetry),
                telemetry_encoder,
                sender.clone(),
            )
            .map_err(|_| BuildError::Backend)?;

            Some(reporter)
        } else {
            None
        };

        let encoder = Encoder::new(pool, self.prefix.as_deref(), &constant_tags);

        Ok(DogStatsdClient::new(
            encoder,
            sender,
            telemetry,
            reporter,
            worker_thread,
            self.truncate_if_too_long,
        ))
    }
}

impl Default for DogStatsdBuilder {
    fn default() -> Self {
        DogStatsdBuilder {
            remote_addr: None,
            max_packet_size: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            idle_flush_timeout: DEFAULT_IDLE_FLUSH_TIMEOUT,
            blocking_enqueue_timeout: None,
            uds_buffer_full_block_duration: None,
            prefix: None,
            constant_tags: Vec::new(),
            telemetry: true,
            telemetry_flush_interval: DEFAULT_TELEMETRY_FLUSH_INTERVAL,
            truncate_if_too_long: true,
        }
    }
}

/// Resolves the UDP target from the environment, falling back to `127.0.0.1:8125`.
fn default_remote_addr() -> Result<RemoteAddr, BuildError> {
    let host = env::var(AGENT_HOST_ENV_VAR).unwrap_or_else(|_| "127.0.0.1".to_string());

    let port = match env::var(DOGSTATSD_PORT_ENV_VAR) {
        Ok(port) => port.parse::<u16>().map_err(|_| BuildError::InvalidConfiguration {
            reason: format!("{DOGSTATSD_PORT_ENV_VAR} is not a valid port: '{port}'"),
        })?,
        Err(_) => DEFAULT_PORT,
    };

    RemoteAddr::try_from(format!("{host}:{port}").as_str())
        .map_err(|reason| BuildError::InvalidRemoteAddress { reason })
}

fn entity_id_tag(entity_id: Option<&str>) -> Option<String> {
    match entity_id {
        Some(id) if !id.is_empty() => Some(format!("{ENTITY_ID_TAG_KEY}:{id}")),
        _ => None,
    }
}
