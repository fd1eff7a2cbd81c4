use std::{
    io,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error};

use crate::{
    encoder::Message,
    frame::{FrameBuffer, FrameSink},
    telemetry::TelemetryCounters,
    transport::Transport,
};

/// Upper bound on one queue wait, so idle time keeps being re-evaluated.
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Flushes full frames to the transport and records the outcome.
pub(crate) struct TransportSink {
    transport: Box<dyn Transport>,
    telemetry: Arc<TelemetryCounters>,
}

impl TransportSink {
    pub fn new(transport: Box<dyn Transport>, telemetry: Arc<TelemetryCounters>) -> Self {
        Self { transport, telemetry }
    }
}

impl FrameSink for TransportSink {
    fn flush_frame(&mut self, frame: &[u8]) {
        if self.transport.send(frame) {
            self.telemetry.on_packet_sent(frame.len());
        } else {
            self.telemetry.on_packet_dropped(frame.len());
        }
    }
}

/// Producer-side handle submitting messages to the delivery worker's queue.
///
/// Cloneable and usable from any thread; the queue itself is the only coordination point between
/// producers and the worker.
#[derive(Clone)]
pub(crate) struct MessageSender {
    tx: Sender<Message>,
    blocking_timeout: Option<Duration>,
    telemetry: Arc<TelemetryCounters>,
}

impl MessageSender {
    /// Submits a message for delivery.
    ///
    /// With no blocking timeout configured this never waits: a full queue rejects the message
    /// immediately. With one, the call waits up to that long for free capacity. Either way a
    /// rejected message is counted as a queue drop and its buffer flows back to the pool.
    pub fn submit(&self, msg: Message) -> bool {
        let rejected = match self.blocking_timeout {
            None => self.tx.try_send(msg).is_err(),
            Some(timeout) => self.tx.send_timeout(msg, timeout).is_err(),
        };

        if rejected {
            self.telemetry.on_packet_dropped_queue();
        }

        !rejected
    }
}

/// Spawns the single consumer thread draining the queue into `frame`.
///
/// Returns the producer handle and the join handle used at disposal. The worker owns the frame
/// buffer (and through it the transport); nothing else touches either.
pub(crate) fn spawn(
    queue_capacity: usize,
    blocking_timeout: Option<Duration>,
    idle_flush_timeout: Duration,
    frame: FrameBuffer<TransportSink>,
    telemetry: Arc<TelemetryCounters>,
) -> io::Result<(MessageSender, JoinHandle<()>)> {
    let (tx, rx) = bounded(queue_capacity);

    let worker_telemetry = Arc::clone(&telemetry);
    let thread = std::thread::Builder::new()
        .name("dogstatsd-client-worker".to_string())
        .spawn(move || run(rx, frame, idle_flush_timeout, worker_telemetry))?;

    Ok((MessageSender { tx, blocking_timeout, telemetry }, thread))
}

fn run(
    rx: Receiver<Message>,
    mut frame: FrameBuffer<TransportSink>,
    idle_flush_timeout: Duration,
    telemetry: Arc<TelemetryCounters>,
) {
    let poll_interval = QUEUE_POLL_INTERVAL.min(idle_flush_timeout);
    let mut idle_since: Option<Instant> = None;

    loop {
        match rx.recv_timeout(poll_interval) {
            Ok(msg) => {
                if !frame.add(msg.as_bytes()) {
                    // A record bigger than the whole frame can never be sent; this is a
                    // configuration problem, not transient network weather.
                    error!(
                        record_len = msg.len(),
                        frame_capacity = frame.capacity(),
                        "Record exceeds frame capacity, dropping. Raise the maximum packet size."
                    );
                    telemetry.on_packet_dropped(msg.len());
                }
                // Dropping the message here returns its buffer to the pool.
                idle_since = None;
            }
            Err(RecvTimeoutError::Timeout) => {
                let started = *idle_since.get_or_insert_with(Instant::now);
                if started.elapsed() >= idle_flush_timeout {
                    frame.flush();
                    idle_since = None;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // All producers are gone and the queue has been drained through `add`; push out whatever is
    // still buffered before releasing the transport.
    frame.flush();
    debug!("Delivery worker stopped.");
}


#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::{Duration, Instant},
    };

    use crossbeam_channel::bounded;

    use super::{spawn, MessageSender, TransportSink};
    use crate::{
        encoder::{Encoder, Message, MetricKind, MetricValue},
        frame::FrameBuffer,
        pool::BufferPool,
        telemetry::TelemetryCounters,
        transport::{Transport, TransportKind},
    };

    #[derive(Clone)]
    struct MockTransport {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
        healthy: bool,
    }

    impl MockTransport {
        fn new(healthy: bool) -> Self {
            Self { frames: Arc::new(Mutex::new(Vec::new())), healthy }
        }

        fn frames(&self) -> Vec<Vec<u8>> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl Transport for MockTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Udp
        }

        fn send(&mut self, frame: &[u8]) -> bool {
            self.frames.lock().unwrap().push(frame.to_vec());
            self.healthy
        }
    }

    fn test_encoder() -> Encoder {
        Encoder::new(Arc::new(BufferPool::new(16)), None, &[])
    }

    fn metric(encoder: &Encoder, name: &str, value: i64) -> Message {
        encoder.encode_metric(MetricKind::Counter, name, MetricValue::Signed(value), 1.0, &[])
    }

    fn spawn_worker(
        capacity: usize,
        idle_flush: Duration,
        transport: MockTransport,
        telemetry: Arc<TelemetryCounters>,
    ) -> (MessageSender, std::thread::JoinHandle<()>) {
        let sink = TransportSink::new(Box::new(transport), Arc::clone(&telemetry));
        let frame = FrameBuffer::new(sink, 64, b"\n");
        spawn(capacity, None, idle_flush, frame, telemetry).unwrap()
    }

    #[test]
    fn drains_and_flushes_on_shutdown() {
        let transport = MockTransport::new(true);
        let telemetry = Arc::new(TelemetryCounters::new());
        let (sender, thread) =
            spawn_worker(16, Duration::from_secs(60), transport.clone(), Arc::clone(&telemetry));

        let encoder = test_encoder();
        assert!(sender.submit(metric(&encoder, "a", 1)));
        assert!(sender.submit(metric(&encoder, "b", 2)));

        drop(sender);
        thread.join().unwrap();

        assert_eq!(transport.frames(), vec![b"a:1|c\nb:2|c".to_vec()]);

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.packets_sent, 1);
        assert_eq!(snapshot.bytes_sent, 11);
        assert_eq!(snapshot.packets_dropped, 0);
    }

    #[test]
    fn idle_flush_fires_without_new_items() {
        let transport = MockTransport::new(true);
        let telemetry = Arc::new(TelemetryCounters::new());
        let (sender, thread) =
            spawn_worker(16, Duration::from_millis(50), transport.clone(), Arc::clone(&telemetry));

        let encoder = test_encoder();
        assert!(sender.submit(metric(&encoder, "a", 1)));

        // One record is far from filling a 64-byte frame, so only the idle policy can flush it.
        let deadline = Instant::now() + Duration::from_secs(2);
        while transport.frames().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(transport.frames(), vec![b"a:1|c".to_vec()]);

        drop(sender);
        thread.join().unwrap();
    }

    #[test]
    fn full_queue_rejects_immediately_and_counts() {
        // No consumer on the channel: the queue stays full after the first submit.
        let telemetry = Arc::new(TelemetryCounters::new());
        let (tx, _rx) = bounded(1);
        let sender =
            MessageSender { tx, blocking_timeout: None, telemetry: Arc::clone(&telemetry) };

        let encoder = test_encoder();
        assert!(sender.submit(metric(&encoder, "a", 1)));
        assert!(!sender.submit(metric(&encoder, "b", 2)));

        assert_eq!(telemetry.snapshot().packets_dropped_queue, 1);
    }

    #[test]
    fn blocking_mode_waits_up_to_timeout_before_dropping() {
        let telemetry = Arc::new(TelemetryCounters::new());
        let (tx, _rx) = bounded(1);
        let sender = MessageSender {
            tx,
            blocking_timeout: Some(Duration::from_millis(50)),
            telemetry: Arc::clone(&telemetry),
        };

        let encoder = test_encoder();
        assert!(sender.submit(metric(&encoder, "a", 1)));

        let start = Instant::now();
        assert!(!sender.submit(metric(&encoder, "b", 2)));
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(telemetry.snapshot().packets_dropped_queue, 1);
    }

    #[test]
    fn oversized_record_is_reported_not_fatal() {
        let transport = MockTransport::new(true);
        let telemetry = Arc::new(TelemetryCounters::new());
        let (sender, thread) =
            spawn_worker(16, Duration::from_secs(60), transport.clone(), Arc::clone(&telemetry));

        let encoder = test_encoder();
        let big_name = "n".repeat(100);
        assert!(sender.submit(metric(&encoder, &big_name, 1)));
        // The worker must survive the oversized record and keep delivering.
        assert!(sender.submit(metric(&encoder, "a", 1)));

        drop(sender);
        thread.join().unwrap();

        assert_eq!(transport.frames(), vec![b"a:1|c".to_vec()]);
        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.packets_dropped, 1);
        assert_eq!(snapshot.packets_sent, 1);
    }

    #[test]
    fn failed_sends_count_as_network_drops() {
        let transport = MockTransport::new(false);
        let telemetry = Arc::new(TelemetryCounters::new());
        let (sender, thread) =
            spawn_worker(16, Duration::from_secs(60), transport.clone(), Arc::clone(&telemetry));

        let encoder = test_encoder();
        assert!(sender.submit(metric(&encoder, "a", 1)));

        drop(sender);
        thread.join().unwrap();

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.packets_sent, 0);
        assert_eq!(snapshot.packets_dropped, 1);
        assert_eq!(snapshot.bytes_dropped, 5);
    }
}
