//! A client for sending metrics, events, and service checks to a [DogStatsD][dsd]-compatible
//! server.
//!
//! [dsd]: https://docs.datadoghq.com/developers/dogstatsd/
//!
//! # Usage
//!
//! Using the client is straightforward:
//!
//! ```no_run
//! # use dogstatsd_client::DogStatsdClient;
//! // First, create a builder.
//! //
//! // The builder can configure many aspects of the client, such as changing the remote address,
//! // adjusting the maximum packet size, attaching constant tags, and more.
//! let client = DogStatsdClient::builder()
//!     .with_prefix("myapp")
//!     .with_constant_tags(["env:prod"])
//!     .build()
//!     .expect("failed to build client");
//!
//! // Submission methods never block on the network: records are encoded and handed to a
//! // background worker, which batches them into size-bounded packets.
//! client.incr("requests", 1.0, &["endpoint:search"]);
//! client.gauge("queue.depth", 12.0, 1.0, &[]);
//! client.timing("db.query", 35, 0.5, &[]);
//! ```
//!
//! # Features
//!
//! ## Batched, bounded delivery
//!
//! Records are packed into frames up to a per-transport maximum packet size, with a newline
//! between records, and flushed either when a frame fills or after a short idle period. A single
//! bounded queue separates producer threads from the one delivery worker; when the queue is full,
//! the client sheds load instead of blocking callers (an optional blocking timeout is available
//! for callers that prefer backpressure).
//!
//! ## Transport support
//!
//! Payloads can be shipped over UDP, Unix domain sockets (`unix://<path>`), or named pipes
//! (`pipe://<name>`). Transports are best effort: delivery failures drop the frame and are
//! accounted for in telemetry, never surfaced to the submitting caller.
//!
//! ## Telemetry
//!
//! The client tracks what it sent and what it dropped, and periodically reports those counters
//! through its own pipeline under the `datadog.dogstatsd.client` namespace, aligning with the
//! official DogStatsD clients. The same counters are available in-process via
//! [`DogStatsdClient::telemetry`].
//!
//! # Missing
//!
//! ## Client-side aggregation
//!
//! Every submission becomes one wire record; there is no client-side aggregation of counters or
//! gauges between flushes.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![deny(missing_docs)]

mod builder;
pub use self::builder::{
    BuildError, DogStatsdBuilder, AGENT_HOST_ENV_VAR, DOGSTATSD_PORT_ENV_VAR, ENTITY_ID_ENV_VAR,
    DEFAULT_PORT,
};

mod client;
pub use self::client::{DogStatsdClient, Timer};

mod encoder;
pub use self::encoder::{
    AlertType, EncodeError, Event, Priority, ServiceCheck, ServiceCheckStatus,
    MAX_EVENT_PAYLOAD_SIZE,
};

mod frame;
mod pool;
mod telemetry;
pub use self::telemetry::TelemetrySnapshot;

mod transport;
mod worker;
