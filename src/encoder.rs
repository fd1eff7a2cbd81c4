use std::sync::Arc;

use thiserror::Error;

use crate::pool::{BufferPool, PooledBuffer};

/// Maximum size, in bytes, of a single encoded event or service check.
///
/// Anything larger is either truncated (when the caller allows it) or rejected.
pub const MAX_EVENT_PAYLOAD_SIZE: usize = 8 * 1024;

/// Errors that can occur while encoding an event or service check.
///
/// These are caller errors: the payload handed to the client cannot be represented on the wire.
/// Ordinary network unreliability never surfaces through this type.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The encoded payload exceeds [`MAX_EVENT_PAYLOAD_SIZE`] and could not be truncated to fit.
    #[error("encoded payload is too big ({len} bytes, maximum is {max})")]
    PayloadTooLarge {
        /// Size of the encoded payload.
        len: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A service check name contained the field separator `|`.
    #[error("service check name must not contain '|'")]
    InvalidServiceCheckName,
}

/// The kind of a metric, determining its wire-format unit token.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Distribution,
    Timing,
    Set,
    Meter,
}

impl MetricKind {
    const fn unit(self) -> &'static str {
        match self {
            MetricKind::Counter => "c",
            MetricKind::Gauge => "g",
            MetricKind::Histogram => "h",
            MetricKind::Distribution => "d",
            MetricKind::Timing => "ms",
            MetricKind::Set => "s",
            MetricKind::Meter => "m",
        }
    }
}

/// A metric value, formatted without allocating.
#[derive(Clone, Copy, Debug)]
pub(crate) enum MetricValue<'a> {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Text(&'a str),
}

/// Alert type of an [`Event`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AlertType {
    /// Informational event (the DogStatsD server default).
    Info,
    /// Warning event.
    Warning,
    /// Error event.
    Error,
    /// Success event.
    Success,
}

impl AlertType {
    fn as_str(self) -> &'static str {
        match self {
            AlertType::Info => "info",
            AlertType::Warning => "warning",
            AlertType::Error => "error",
            AlertType::Success => "success",
        }
    }
}

/// Priority of an [`Event`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Priority {
    /// Normal priority (the DogStatsD server default).
    Normal,
    /// Low priority.
    Low,
}

impl Priority {
    fn as_str(self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

/// Status reported by a service check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceCheckStatus {
    /// The service is operating normally.
    Ok,
    /// The service is degraded.
    Warning,
    /// The service is unavailable.
    Critical,
    /// The service status could not be determined.
    Unknown,
}

impl ServiceCheckStatus {
    const fn as_wire(self) -> &'static str {
        match self {
            ServiceCheckStatus::Ok => "0",
            ServiceCheckStatus::Warning => "1",
            ServiceCheckStatus::Critical => "2",
            ServiceCheckStatus::Unknown => "3",
        }
    }
}

/// An event to send to the DogStatsD server.
#[derive(Clone, Copy, Debug)]
pub struct Event<'a> {
    pub(crate) title: &'a str,
    pub(crate) text: &'a str,
    pub(crate) timestamp: Option<i64>,
    pub(crate) hostname: Option<&'a str>,
    pub(crate) aggregation_key: Option<&'a str>,
    pub(crate) priority: Option<Priority>,
    pub(crate) source_type: Option<&'a str>,
    pub(crate) alert_type: Option<AlertType>,
    pub(crate) tags: &'a [&'a str],
}

impl<'a> Event<'a> {
    /// Creates an event with the given title and text body.
    pub fn new(title: &'a str, text: &'a str) -> Self {
        Self {
            title,
            text,
            timestamp: None,
            hostname: None,
            aggregation_key: None,
            priority: None,
            source_type: None,
            alert_type: None,
            tags: &[],
        }
    }

    /// Sets the epoch timestamp of the event.
    ///
    /// Defaults to the receive time on the DogStatsD server.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the host the event relates to.
    #[must_use]
    pub fn with_hostname(mut self, hostname: &'a str) -> Self {
        self.hostname = Some(hostname);
        self
    }

    /// Sets a key used to aggregate related events.
    #[must_use]
    pub fn with_aggregation_key(mut self, key: &'a str) -> Self {
        self.aggregation_key = Some(key);
        self
    }

    /// Sets the priority of the event.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the source type name of the event.
    #[must_use]
    pub fn with_source_type(mut self, source_type: &'a str) -> Self {
        self.source_type = Some(source_type);
        self
    }

    /// Sets the alert type of the event.
    #[must_use]
    pub fn with_alert_type(mut self, alert_type: AlertType) -> Self {
        self.alert_type = Some(alert_type);
        self
    }

    /// Sets the tags attached to the event.
    #[must_use]
    pub fn with_tags(mut self, tags: &'a [&'a str]) -> Self {
        self.tags = tags;
        self
    }
}

/// A service check to send to the DogStatsD server.
#[derive(Clone, Copy, Debug)]
pub struct ServiceCheck<'a> {
    pub(crate) name: &'a str,
    pub(crate) status: ServiceCheckStatus,
    pub(crate) timestamp: Option<i64>,
    pub(crate) hostname: Option<&'a str>,
    pub(crate) tags: &'a [&'a str],
    pub(crate) message: Option<&'a str>,
}

impl<'a> ServiceCheck<'a> {
    /// Creates a service check with the given name and status.
    ///
    /// The name must not contain `|`, which is the wire-format field separator.
    pub fn new(name: &'a str, status: ServiceCheckStatus) -> Self {
        Self { name, status, timestamp: None, hostname: None, tags: &[], message: None }
    }

    /// Sets the epoch timestamp of the check.
    ///
    /// Defaults to the receive time on the DogStatsD server.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the host the check relates to.
    #[must_use]
    pub fn with_hostname(mut self, hostname: &'a str) -> Self {
        self.hostname = Some(hostname);
        self
    }

    /// Sets the tags attached to the check.
    #[must_use]
    pub fn with_tags(mut self, tags: &'a [&'a str]) -> Self {
        self.tags = tags;
        self
    }

    /// Sets a message describing the current state of the check.
    #[must_use]
    pub fn with_message(mut self, message: &'a str) -> Self {
        self.message = Some(message);
        self
    }
}

/// A single encoded wire record.
///
/// Owns its pooled scratch buffer; the buffer flows back to the pool when the message is dropped,
/// which the delivery worker does as soon as the record has been copied into a frame.
pub(crate) struct Message {
    buf: PooledBuffer,
}

impl Message {
    fn new(buf: PooledBuffer) -> Self {
        Self { buf }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
}

/// Stateless formatter turning metric/event/service-check submissions into wire records.
///
/// All scratch buffers come from the shared [`BufferPool`]; the encoder itself holds only the
/// pre-rendered pieces that apply to every record (prefix, constant tags).
pub(crate) struct Encoder {
    pool: Arc<BufferPool>,
    // Stored with its trailing '.' so the hot path is a single push_str.
    prefix: Option<String>,
    // Constant tags pre-joined with ','.
    constant_tags: String,
}

impl Encoder {
    pub fn new(pool: Arc<BufferPool>, prefix: Option<&str>, constant_tags: &[String]) -> Self {
        let prefix = match prefix {
            Some(prefix) if !prefix.is_empty() => Some(format!("{prefix}.")),
            _ => None,
        };

        Self { pool, prefix, constant_tags: constant_tags.join(",") }
    }

    /// Encodes one metric as `[prefix.]name:value|unit[|@rate][|#tags]`.
    ///
    /// The sample-rate suffix is only emitted when the rate is not 1.0. Sampling itself is the
    /// caller's job; by the time a value reaches the encoder it is always emitted.
    pub fn encode_metric(
        &self,
        kind: MetricKind,
        name: &str,
        value: MetricValue<'_>,
        sample_rate: f64,
        tags: &[&str],
    ) -> Message {
        let mut buf = self.pool.acquire();

        if let Some(prefix) = &self.prefix {
            buf.push_str(prefix);
        }
        buf.push_str(name);
        buf.push(':');

        match value {
            MetricValue::Signed(v) => buf.push_str(itoa::Buffer::new().format(v)),
            MetricValue::Unsigned(v) => buf.push_str(itoa::Buffer::new().format(v)),
            MetricValue::Float(v) => buf.push_str(ryu::Buffer::new().format(v)),
            MetricValue::Text(v) => buf.push_str(v),
        }

        buf.push('|');
        buf.push_str(kind.unit());

        if sample_rate != 1.0 {
            buf.push_str("|@");
            buf.push_str(ryu::Buffer::new().format(sample_rate));
        }

        self.write_tags_suffix(&mut buf, tags);

        Message::new(buf)
    }

    /// Encodes an event, truncating the longer of title/text once when `truncate` is set and the
    /// payload exceeds [`MAX_EVENT_PAYLOAD_SIZE`].
    pub fn encode_event(&self, event: &Event<'_>, truncate: bool) -> Result<Message, EncodeError> {
        let title = escape_content(event.title);
        let text = escape_content(event.text);

        let msg = self.encode_event_fields(event, &title, &text);
        if msg.len() <= MAX_EVENT_PAYLOAD_SIZE {
            return Ok(msg);
        }

        let overage = msg.len() - MAX_EVENT_PAYLOAD_SIZE;
        drop(msg);

        if !truncate {
            return Err(EncodeError::PayloadTooLarge {
                len: MAX_EVENT_PAYLOAD_SIZE + overage,
                max: MAX_EVENT_PAYLOAD_SIZE,
            });
        }

        let (title, text) = if title.len() > text.len() {
            (truncate_overage(&title, overage), text.as_str())
        } else {
            (title.as_str(), truncate_overage(&text, overage))
        };

        let msg = self.encode_event_fields(event, title, text);
        if msg.len() <= MAX_EVENT_PAYLOAD_SIZE {
            Ok(msg)
        } else {
            Err(EncodeError::PayloadTooLarge { len: msg.len(), max: MAX_EVENT_PAYLOAD_SIZE })
        }
    }

    fn encode_event_fields(&self, event: &Event<'_>, title: &str, text: &str) -> Message {
        let mut buf = self.pool.acquire();
        let mut itoa_buf = itoa::Buffer::new();

        buf.push_str("_e{");
        buf.push_str(itoa_buf.format(title.len()));
        buf.push(',');
        buf.push_str(itoa_buf.format(text.len()));
        buf.push_str("}:");
        buf.push_str(title);
        buf.push('|');
        buf.push_str(text);

        if let Some(timestamp) = event.timestamp {
            buf.push_str("|d:");
            buf.push_str(itoa_buf.format(timestamp));
        }
        if let Some(hostname) = event.hostname {
            buf.push_str("|h:");
            buf.push_str(hostname);
        }
        if let Some(key) = event.aggregation_key {
            buf.push_str("|k:");
            buf.push_str(key);
        }
        if let Some(priority) = event.priority {
            buf.push_str("|p:");
            buf.push_str(priority.as_str());
        }
        if let Some(source_type) = event.source_type {
            buf.push_str("|s:");
            buf.push_str(source_type);
        }
        if let Some(alert_type) = event.alert_type {
            buf.push_str("|t:");
            buf.push_str(alert_type.as_str());
        }

        self.write_tags_suffix(&mut buf, event.tags);

        Message::new(buf)
    }

    /// Encodes a service check, truncating the message once when `truncate` is set and the payload
    /// exceeds [`MAX_EVENT_PAYLOAD_SIZE`].
    ///
    /// Only the message field can absorb a truncation; an oversized payload without one is an
    /// error regardless of the flag.
    pub fn encode_service_check(
        &self,
        check: &ServiceCheck<'_>,
        truncate: bool,
    ) -> Result<Message, EncodeError> {
        let name = escape_content(check.name);
        if name.contains('|') {
            return Err(EncodeError::InvalidServiceCheckName);
        }

        let message = check.message.map(escape_service_check_message);

        let msg = self.encode_service_check_fields(check, &name, message.as_deref());
        if msg.len() <= MAX_EVENT_PAYLOAD_SIZE {
            return Ok(msg);
        }

        let overage = msg.len() - MAX_EVENT_PAYLOAD_SIZE;
        drop(msg);

        let message = match &message {
            Some(message) if truncate && overage <= message.len() => {
                truncate_overage(message, overage)
            }
            _ => {
                return Err(EncodeError::PayloadTooLarge {
                    len: MAX_EVENT_PAYLOAD_SIZE + overage,
                    max: MAX_EVENT_PAYLOAD_SIZE,
                })
            }
        };

        let msg = self.encode_service_check_fields(check, &name, Some(message));
        if msg.len() <= MAX_EVENT_PAYLOAD_SIZE {
            Ok(msg)
        } else {
            Err(EncodeError::PayloadTooLarge { len: msg.len(), max: MAX_EVENT_PAYLOAD_SIZE })
        }
    }

    fn encode_service_check_fields(
        &self,
        check: &ServiceCheck<'_>,
        name: &str,
        message: Option<&str>,
    ) -> Message {
        let mut buf = self.pool.acquire();

        buf.push_str("_sc|");
        buf.push_str(name);
        buf.push('|');
        buf.push_str(check.status.as_wire());

        if let Some(timestamp) = check.timestamp {
            buf.push_str("|d:");
            buf.push_str(itoa::Buffer::new().format(timestamp));
        }
        if let Some(hostname) = check.hostname {
            buf.push_str("|h:");
            buf.push_str(hostname);
        }

        self.write_tags_suffix(&mut buf, check.tags);

        // The message field must always come last.
        if let Some(message) = message {
            buf.push_str("|m:");
            buf.push_str(message);
        }

        Message::new(buf)
    }

    fn write_tags_suffix(&self, buf: &mut String, tags: &[&str]) {
        if self.constant_tags.is_empty() && tags.is_empty() {
            return;
        }

        buf.push_str("|#");
        buf.push_str(&self.constant_tags);

        let mut wrote_tag = !self.constant_tags.is_empty();
        for tag in tags {
            if wrote_tag {
                buf.push(',');
            }
            wrote_tag = true;
            buf.push_str(tag);
        }
    }
}

/// Strips `\r` and renders `\n` as the literal two-character sequence `\n`.
fn escape_content(content: &str) -> String {
    content.replace('\r', "").replace('\n', "\\n")
}

fn escape_service_check_message(message: &str) -> String {
    escape_content(message).replace("m:", "m\\:")
}

/// Drops `overage` bytes from the end of `s`, rounding down to a char boundary.
fn truncate_overage(s: &str, overage: usize) -> &str {
    let mut len = s.len().saturating_sub(overage);
    while !s.is_char_boundary(len) {
        len -= 1;
    }
    &s[..len]
}
