use std::{
    net::UdpSocket,
    time::{Duration, Instant},
};

use dogstatsd_client::DogStatsdClient;

fn udp_receiver() -> (UdpSocket, String) {
    // Surfaces the client's `tracing` output when a test fails; harmless if already set.
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    let addr = socket.local_addr().unwrap().to_string();
    (socket, addr)
}

/// Collects datagrams until `pred` is satisfied by the lines received so far, or panics after
/// two seconds.
fn recv_lines_until<F>(socket: &UdpSocket, pred: F) -> Vec<String>
where
    F: Fn(&[String]) -> bool,
{
    let mut lines = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);

    let mut buf = [0u8; 65_536];
    while Instant::now() < deadline {
        if let Ok(len) = socket.recv(&mut buf) {
            let datagram = std::str::from_utf8(&buf[..len]).unwrap();
            lines.extend(datagram.lines().map(str::to_string));
        }
        if pred(&lines) {
            return lines;
        }
    }

    panic!("timed out waiting for expected datagrams; got {lines:?}");
}

#[test]
fn idle_flush_delivers_a_lone_record() {
    let (receiver, addr) = udp_receiver();
    let client = DogStatsdClient::builder()
        .with_remote_address(&addr)
        .unwrap()
        .with_telemetry(false)
        .with_idle_flush_timeout(Duration::from_millis(20))
        .build()
        .unwrap();

    client.incr("lone", 1.0, &[]);

    let lines = recv_lines_until(&receiver, |lines| !lines.is_empty());
    assert_eq!(lines[0], "lone:1|c");
}

#[test]
fn shutdown_flushes_everything_in_order() {
    let (receiver, addr) = udp_receiver();
    let mut client = DogStatsdClient::builder()
        .with_remote_address(&addr)
        .unwrap()
        .with_telemetry(false)
        .with_prefix("app")
        .with_constant_tags(["env:test"])
        .build()
        .unwrap();

    client.count("requests", 3, 1.0, &["route:home"]);
    client.gauge("depth", 2.5, 1.0, &[]);
    client.shutdown();

    let lines = recv_lines_until(&receiver, |lines| lines.len() >= 2);
    assert_eq!(lines[0], "app.requests:3|c|#env:test,route:home");
    assert_eq!(lines[1], "app.depth:2.5|g|#env:test");
}

#[test]
fn records_pack_into_shared_datagrams() {
    let (receiver, addr) = udp_receiver();
    let mut client = DogStatsdClient::builder()
        .with_remote_address(&addr)
        .unwrap()
        .with_telemetry(false)
        .with_max_packet_size(512)
        .build()
        .unwrap();

    for i in 0..10 {
        client.count("batched", i, 1.0, &[]);
    }
    client.shutdown();

    let mut buf = [0u8; 65_536];
    let len = receiver.recv(&mut buf).unwrap();
    let datagram = std::str::from_utf8(&buf[..len]).unwrap();

    // Ten tiny records fit comfortably in one 512-byte frame, newline separated, in
    // submission order.
    let lines: Vec<&str> = datagram.lines().collect();
    assert_eq!(lines.len(), 10);
    assert_eq!(lines[0], "batched:0|c");
    assert_eq!(lines[9], "batched:9|c");
}

#[test]
fn telemetry_rides_the_same_pipeline() {
    let (receiver, addr) = udp_receiver();
    let mut client = DogStatsdClient::builder()
        .with_remote_address(&addr)
        .unwrap()
        .with_telemetry_flush_interval(Duration::from_secs(3600))
        .build()
        .unwrap();

    client.incr("observed", 1.0, &[]);
    // The interval never fires in this test; the reporter's final flush on shutdown carries
    // the counters out.
    client.shutdown();

    let lines = recv_lines_until(&receiver, |lines| {
        lines.iter().any(|l| l.starts_with("datadog.dogstatsd.client.metrics:"))
    });

    let metrics_line = lines
        .iter()
        .find(|l| l.starts_with("datadog.dogstatsd.client.metrics:"))
        .unwrap();
    assert!(metrics_line.contains(":1|c"));
    assert!(metrics_line.contains("client:rust"));
    assert!(metrics_line.contains("client_transport:udp"));
}
