use std::{
    sync::Arc,
    thread::JoinHandle,
    time::Instant,
};

use rand::Rng as _;

use crate::{
    builder::DogStatsdBuilder,
    encoder::{EncodeError, Encoder, Event, MetricKind, MetricValue, ServiceCheck},
    telemetry::{TelemetryCounters, TelemetryReporter, TelemetrySnapshot},
    worker::MessageSender,
};

/// A DogStatsD client.
///
/// The client is the producer-side facade over the delivery pipeline: submitting a metric encodes
/// it into a pooled buffer and hands it to a background worker, so no call here ever touches the
/// network. Submission methods take `&self` and the client can be shared across threads.
///
/// Delivery is best effort by design. Metric methods return nothing: once the agent is
/// unreachable or the queue is saturated, the client sheds load silently and accounts for it in
/// [`telemetry`](Self::telemetry). Events and service checks return a `Result` only because the
/// caller can hand over a payload that cannot be represented on the wire.
///
/// Dropping the client (or calling [`shutdown`](Self::shutdown)) drains the queue, flushes any
/// partially filled frame, and joins the background threads.
pub struct DogStatsdClient {
    encoder: Encoder,
    sender: Option<MessageSender>,
    telemetry: Arc<TelemetryCounters>,
    reporter: Option<TelemetryReporter>,
    worker: Option<JoinHandle<()>>,
    truncate_if_too_long: bool,
}

impl DogStatsdClient {
    /// Creates a builder for configuring a client.
    pub fn builder() -> DogStatsdBuilder {
        DogStatsdBuilder::default()
    }

    pub(crate) fn new(
        encoder: Encoder,
        sender: MessageSender,
        telemetry: Arc<TelemetryCounters>,
        reporter: Option<TelemetryReporter>,
        worker: JoinHandle<()>,
        truncate_if_too_long: bool,
    ) -> Self {
        Self {
            encoder,
            sender: Some(sender),
            telemetry,
            reporter,
            worker: Some(worker),
            truncate_if_too_long,
        }
    }

    /// Adjusts a counter by `value`.
    pub fn count(&self, name: &str, value: i64, sample_rate: f64, tags: &[&str]) {
        self.submit_metric(MetricKind::Counter, name, MetricValue::Signed(value), sample_rate, tags);
    }

    /// Increments a counter by one.
    pub fn incr(&self, name: &str, sample_rate: f64, tags: &[&str]) {
        self.count(name, 1, sample_rate, tags);
    }

    /// Decrements a counter by one.
    pub fn decr(&self, name: &str, sample_rate: f64, tags: &[&str]) {
        self.count(name, -1, sample_rate, tags);
    }

    /// Records the current value of a gauge.
    pub fn gauge(&self, name: &str, value: f64, sample_rate: f64, tags: &[&str]) {
        self.submit_metric(MetricKind::Gauge, name, MetricValue::Float(value), sample_rate, tags);
    }

    /// Records a value in a histogram, aggregated on the agent.
    pub fn histogram(&self, name: &str, value: f64, sample_rate: f64, tags: &[&str]) {
        self.submit_metric(MetricKind::Histogram, name, MetricValue::Float(value), sample_rate, tags);
    }

    /// Records a value in a distribution, aggregated server-side across hosts.
    pub fn distribution(&self, name: &str, value: f64, sample_rate: f64, tags: &[&str]) {
        self.submit_metric(
            MetricKind::Distribution,
            name,
            MetricValue::Float(value),
            sample_rate,
            tags,
        );
    }

    /// Records a timing, in milliseconds.
    pub fn timing(&self, name: &str, millis: u64, sample_rate: f64, tags: &[&str]) {
        self.submit_metric(MetricKind::Timing, name, MetricValue::Unsigned(millis), sample_rate, tags);
    }

    /// Records a member of a set, counted once per unique value.
    pub fn set(&self, name: &str, value: &str, sample_rate: f64, tags: &[&str]) {
        self.submit_metric(MetricKind::Set, name, MetricValue::Text(value), sample_rate, tags);
    }

    /// Marks an occurrence on a meter.
    pub fn meter(&self, name: &str, sample_rate: f64, tags: &[&str]) {
        self.submit_metric(MetricKind::Meter, name, MetricValue::Signed(1), sample_rate, tags);
    }

    /// Runs `f` and records its wall-clock duration as a timing.
    pub fn time<F, R>(&self, name: &str, sample_rate: f64, tags: &[&str], f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = Instant::now();
        let result = f();
        self.timing(name, start.elapsed().as_millis() as u64, sample_rate, tags);
        result
    }

    /// Starts a timer that records a timing when dropped.
    ///
    /// Useful when the timed region does not fit in a closure, such as timing until the end of
    /// the current scope.
    pub fn start_timer(&self, name: &str, sample_rate: f64, tags: &[&str]) -> Timer<'_> {
        Timer {
            client: self,
            name: name.to_string(),
            sample_rate,
            tags: tags.iter().map(ToString::to_string).collect(),
            start: Instant::now(),
        }
    }

    /// Sends an event.
    ///
    /// # Errors
    ///
    /// Fails when the encoded event exceeds the payload ceiling and truncation is disabled, or
    /// when even truncating the longer of title/text cannot bring it under the ceiling.
    pub fn event(&self, event: &Event<'_>) -> Result<(), EncodeError> {
        let Some(sender) = &self.sender else { return Ok(()) };

        let msg = self.encoder.encode_event(event, self.truncate_if_too_long)?;
        if sender.submit(msg) {
            self.telemetry.on_event_sent();
        }

        Ok(())
    }

    /// Sends a service check.
    ///
    /// # Errors
    ///
    /// Fails when the check name contains `|`, or when the encoded check exceeds the payload
    /// ceiling and its message cannot absorb the truncation.
    pub fn service_check(&self, check: &ServiceCheck<'_>) -> Result<(), EncodeError> {
        let Some(sender) = &self.sender else { return Ok(()) };

        let msg = self.encoder.encode_service_check(check, self.truncate_if_too_long)?;
        if sender.submit(msg) {
            self.telemetry.on_service_check_sent();
        }

        Ok(())
    }

    /// Returns a point-in-time view of the client's delivery counters.
    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Shuts the client down, draining queued messages and flushing buffered records.
    ///
    /// The telemetry reporter stops first so its final flush still rides the queue, then the
    /// queue is closed and the worker joined. Idempotent; submissions after shutdown are silent
    /// no-ops.
    pub fn shutdown(&mut self) {
        if let Some(mut reporter) = self.reporter.take() {
            reporter.shutdown();
        }

        // Closing our end of the queue is what tells the worker to drain and exit; producers
        // cloned from this sender have all stopped by the time shutdown is called.
        drop(self.sender.take());

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    fn submit_metric(
        &self,
        kind: MetricKind,
        name: &str,
        value: MetricValue<'_>,
        sample_rate: f64,
        tags: &[&str],
    ) {
        let Some(sender) = &self.sender else { return };

        if !should_sample(sample_rate) {
            return;
        }

        let msg = self.encoder.encode_metric(kind, name, value, sample_rate, tags);
        if sender.submit(msg) {
            self.telemetry.on_metric_sent();
        }
    }
}

impl Drop for DogStatsdClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Drop guard created by [`DogStatsdClient::start_timer`].
pub struct Timer<'a> {
    client: &'a DogStatsdClient,
    name: String,
    sample_rate: f64,
    tags: Vec<String>,
    start: Instant,
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        let tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
        let millis = self.start.elapsed().as_millis() as u64;
        self.client.timing(&self.name, millis, self.sample_rate, &tags);
    }
}

/// Decides whether a submission passes the client-side sampling gate.
///
/// The gate runs before encoding, so skipped values cost nothing. The emitted record still
/// carries the rate so the server can scale counts back up.
fn should_sample(sample_rate: f64) -> bool {
    sample_rate >= 1.0 || rand::rng().random::<f64>() < sample_rate
}
