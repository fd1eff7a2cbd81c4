use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::{bounded, select, tick, Sender};
use tracing::debug;

use crate::{
    encoder::{Encoder, MetricKind, MetricValue},
    worker::MessageSender,
};

const TELEMETRY_PREFIX: &str = "datadog.dogstatsd.client.";

/// Lock-free counters tracking what the client managed to deliver.
///
/// Incremented from producer threads, the worker thread, and the transport path alike; read and
/// reset by the telemetry reporter. Counters only ever grow between resets.
pub(crate) struct TelemetryCounters {
    metrics_sent: AtomicU64,
    events_sent: AtomicU64,
    service_checks_sent: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_dropped: AtomicU64,
    packets_sent: AtomicU64,
    packets_dropped: AtomicU64,
    packets_dropped_queue: AtomicU64,
}

impl TelemetryCounters {
    pub fn new() -> Self {
        Self {
            metrics_sent: AtomicU64::new(0),
            events_sent: AtomicU64::new(0),
            service_checks_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_dropped: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            packets_dropped_queue: AtomicU64::new(0),
        }
    }

    pub fn on_metric_sent(&self) {
        self.metrics_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_event_sent(&self) {
        self.events_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_service_check_sent(&self) {
        self.service_checks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_packet_sent(&self, len: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn on_packet_dropped(&self, len: usize) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
        self.bytes_dropped.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Counts a message the queue rejected before it ever reached the network.
    ///
    /// Kept separate from [`on_packet_dropped`](Self::on_packet_dropped) because a saturated
    /// queue and a failing network are very different diagnoses.
    pub fn on_packet_dropped_queue(&self) {
        self.packets_dropped_queue.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads all counters without resetting them.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            metrics_sent: self.metrics_sent.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            service_checks_sent: self.service_checks_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_dropped: self.bytes_dropped.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            packets_dropped_queue: self.packets_dropped_queue.load(Ordering::Relaxed),
        }
    }

    /// Atomically reads and zeroes every counter, paired with its telemetry metric name.
    fn drain(&self) -> [(&'static str, u64); 8] {
        [
            ("metrics", self.metrics_sent.swap(0, Ordering::Relaxed)),
            ("events", self.events_sent.swap(0, Ordering::Relaxed)),
            ("service_checks", self.service_checks_sent.swap(0, Ordering::Relaxed)),
            ("bytes_sent", self.bytes_sent.swap(0, Ordering::Relaxed)),
            ("bytes_dropped", self.bytes_dropped.swap(0, Ordering::Relaxed)),
            ("packets_sent", self.packets_sent.swap(0, Ordering::Relaxed)),
            ("packets_dropped", self.packets_dropped.swap(0, Ordering::Relaxed)),
            ("packets_dropped_queue", self.packets_dropped_queue.swap(0, Ordering::Relaxed)),
        ]
    }
}

/// A point-in-time view of the client's telemetry counters.
///
/// Counters reset each time the telemetry reporter flushes, so values are relative to the last
/// flush, not to process start.
#[derive(Clone, Copy, Debug, Default)]
pub struct TelemetrySnapshot {
    /// Metrics handed to the delivery queue.
    pub metrics_sent: u64,
    /// Events handed to the delivery queue.
    pub events_sent: u64,
    /// Service checks handed to the delivery queue.
    pub service_checks_sent: u64,
    /// Bytes successfully handed to the OS.
    pub bytes_sent: u64,
    /// Bytes dropped at the network layer.
    pub bytes_dropped: u64,
    /// Frames successfully handed to the OS.
    pub packets_sent: u64,
    /// Frames dropped at the network layer.
    pub packets_dropped: u64,
    /// Messages rejected because the delivery queue was full.
    pub packets_dropped_queue: u64,
}

/// Encodes the drained counters and feeds them through the regular delivery pipeline.
///
/// The reporter is just another producer of the queue it is measuring; failures here are
/// swallowed, since telemetry must never make the client noisier than the traffic it reports on.
pub(crate) fn flush_counters(
    counters: &TelemetryCounters,
    encoder: &Encoder,
    sender: &MessageSender,
) {
    for (name_suffix, value) in counters.drain() {
        let mut name = String::with_capacity(TELEMETRY_PREFIX.len() + name_suffix.len());
        name.push_str(TELEMETRY_PREFIX);
        name.push_str(name_suffix);

        let msg = encoder.encode_metric(
            MetricKind::Counter,
            &name,
            MetricValue::Unsigned(value),
            1.0,
            &[],
        );
        let _ = sender.submit(msg);
    }
}

/// Background timer emitting the telemetry counters at a fixed interval.
pub(crate) struct TelemetryReporter {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl TelemetryReporter {
    /// Spawns the reporter thread.
    ///
    /// `encoder` carries the telemetry identity tags (`client`, `client_version`,
    /// `client_transport`) as its constant tags.
    pub fn spawn(
        interval: Duration,
        counters: Arc<TelemetryCounters>,
        encoder: Encoder,
        sender: MessageSender,
    ) -> io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let thread = std::thread::Builder::new()
            .name("dogstatsd-client-telemetry".to_string())
            .spawn(move || {
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(ticker) -> _ => flush_counters(&counters, &encoder, &sender),
                        recv(stop_rx) -> _ => break,
                    }
                }

                // One last flush so counts accumulated since the previous tick still go out while
                // the queue is draining.
                flush_counters(&counters, &encoder, &sender);
                debug!("Telemetry reporter stopped.");
            })?;

        Ok(Self { stop: Some(stop_tx), thread: Some(thread) })
    }

    /// Stops the reporter, dropping its queue handle. Idempotent.
    pub fn shutdown(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TelemetryReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crossbeam_channel::bounded;

    use super::{flush_counters, TelemetryCounters};
    use crate::{encoder::Encoder, pool::BufferPool, worker::testing::message_sender};

    #[test]
    fn snapshot_reflects_increments() {
        let counters = TelemetryCounters::new();
        counters.on_metric_sent();
        counters.on_metric_sent();
        counters.on_event_sent();
        counters.on_service_check_sent();
        counters.on_packet_sent(512);
        counters.on_packet_dropped(64);
        counters.on_packet_dropped_queue();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.metrics_sent, 2);
        assert_eq!(snapshot.events_sent, 1);
        assert_eq!(snapshot.service_checks_sent, 1);
        assert_eq!(snapshot.packets_sent, 1);
        assert_eq!(snapshot.bytes_sent, 512);
        assert_eq!(snapshot.packets_dropped, 1);
        assert_eq!(snapshot.bytes_dropped, 64);
        assert_eq!(snapshot.packets_dropped_queue, 1);

        // Snapshots do not reset anything.
        assert_eq!(counters.snapshot().metrics_sent, 2);
    }

    #[test]
    fn flush_emits_eight_metrics_and_resets() {
        let counters = TelemetryCounters::new();
        counters.on_metric_sent();
        counters.on_packet_sent(100);

        let encoder = Encoder::new(
            Arc::new(BufferPool::new(16)),
            None,
            &["client:rust".to_string(), "client_transport:udp".to_string()],
        );

        let (tx, rx) = bounded(16);
        let sender = message_sender(tx, Arc::new(TelemetryCounters::new()));

        flush_counters(&counters, &encoder, &sender);

        let lines: Vec<String> = rx
            .try_iter()
            .map(|msg| String::from_utf8(msg.as_bytes().to_vec()).unwrap())
            .collect();

        assert_eq!(lines.len(), 8);
        assert_eq!(
            lines[0],
            "datadog.dogstatsd.client.metrics:1|c|#client:rust,client_transport:udp"
        );
        assert_eq!(
            lines[3],
            "datadog.dogstatsd.client.bytes_sent:100|c|#client:rust,client_transport:udp"
        );
        // Unchanged counters are still reported, as zeroes.
        assert_eq!(
            lines[1],
            "datadog.dogstatsd.client.events:0|c|#client:rust,client_transport:udp"
        );

        // Drained counters are back at zero.
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.metrics_sent, 0);
        assert_eq!(snapshot.packets_sent, 0);
        assert_eq!(snapshot.bytes_sent, 0);
    }

    #[test]
    fn flush_survives_a_full_queue() {
        let counters = TelemetryCounters::new();
        counters.on_metric_sent();

        let encoder = Encoder::new(Arc::new(BufferPool::new(16)), None, &[]);

        let queue_counters = Arc::new(TelemetryCounters::new());
        let (tx, _rx) = bounded(1);
        let sender = message_sender(tx, Arc::clone(&queue_counters));

        // Seven of the eight submissions find the queue full; nothing escalates.
        flush_counters(&counters, &encoder, &sender);
        assert_eq!(queue_counters.snapshot().packets_dropped_queue, 7);
    }
}
