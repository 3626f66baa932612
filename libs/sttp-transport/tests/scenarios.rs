//! End-to-end publisher/subscriber scenarios over real sockets

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use uuid::Uuid;

use sttp_core::{DataSet, Measurement, StateFlags, Ticks};
use sttp_transport::{
    DataPublisher, DataSubscriber, MeasurementReader, PublisherConfig, PublisherListener,
    ReconnectBackoff, SubscriberConfig, SubscriberListener, SubscriptionInfo, UdpDataChannel,
};

/// Records subscriber callbacks the scenarios assert on
#[derive(Default)]
struct RecordingListener {
    cipher_indices: Mutex<Vec<u8>>,
    notifications: Mutex<Vec<String>>,
    buffer_blocks: Mutex<Vec<(u32, Vec<u8>)>>,
}

impl SubscriberListener for RecordingListener {
    fn cipher_keys_updated(&self, active_index: u8) {
        self.cipher_indices.lock().push(active_index);
    }

    fn notification_received(&self, message: &str) {
        self.notifications.lock().push(message.to_string());
    }

    fn buffer_block_received(&self, sequence: u32, payload: &[u8]) {
        self.buffer_blocks.lock().push((sequence, payload.to_vec()));
    }
}

/// Records publisher callbacks, in particular connection ids at subscribe
#[derive(Default)]
struct PublisherRecorder {
    subscribed: Mutex<Vec<u64>>,
}

impl PublisherListener for PublisherRecorder {
    fn subscribed(&self, connection_id: u64, _signal_count: usize) {
        self.subscribed.lock().push(connection_id);
    }
}

struct Fixture {
    signals: Vec<Uuid>,
    publisher: DataPublisher,
    addr: std::net::SocketAddr,
}

async fn start_publisher(config: PublisherConfig) -> Fixture {
    let signals: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
    let publisher = DataPublisher::new(config);
    publisher.define_metadata(DataSet::with_active_measurements(vec![
        (signals[0], "a", "FREQ"),
        (signals[1], "b", "VPHM"),
        (signals[2], "c", "ALOG"),
    ]));
    let addr = publisher.start("127.0.0.1:0").await.expect("publisher start");
    Fixture {
        signals,
        publisher,
        addr,
    }
}

async fn wait_subscribed(subscriber: &DataSubscriber) {
    timeout(Duration::from_secs(5), async {
        while !subscriber.is_subscribed() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("subscription never confirmed");
}

async fn collect(reader: &mut MeasurementReader, count: usize) -> Vec<Measurement> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let m = timeout(Duration::from_secs(5), reader.next())
            .await
            .expect("timed out waiting for measurement")
            .expect("stream ended unexpectedly");
        out.push(m);
    }
    out
}

fn base_tick() -> Ticks {
    Ticks::now()
}

#[tokio::test(flavor = "multi_thread")]
async fn s1_all_signals_delivered_with_exact_values() {
    let fixture = start_publisher(PublisherConfig::default()).await;
    let (subscriber, mut reader) = DataSubscriber::new(SubscriberConfig::default());
    subscriber.connect(fixture.addr.to_string()).expect("connect");
    subscriber
        .subscribe(SubscriptionInfo::new("FILTER ActiveMeasurements WHERE True"))
        .await
        .expect("subscribe");
    wait_subscribed(&subscriber).await;

    let t0 = base_tick();
    fixture.publisher.publish(&[
        Measurement::new(fixture.signals[0], 60.01, t0),
        Measurement::new(fixture.signals[1], 218.07, t0),
        Measurement::new(fixture.signals[2], -0.23, t0),
    ]);

    let mut received = collect(&mut reader, 3).await;
    received.sort_by_key(|m| {
        fixture
            .signals
            .iter()
            .position(|s| *s == m.signal_id)
            .unwrap_or(usize::MAX)
    });

    let expected = [
        (fixture.signals[0], 60.01f32 as f64),
        (fixture.signals[1], 218.07f32 as f64),
        (fixture.signals[2], -0.23f32 as f64),
    ];
    for (m, (signal, value)) in received.iter().zip(expected.iter()) {
        assert_eq!(m.signal_id, *signal);
        assert_eq!(m.value, *value);
        assert_eq!(m.flags, StateFlags::NORMAL);
    }

    subscriber.disconnect().await;
    fixture.publisher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn s2_compressed_stream_is_lossless_and_small() {
    let fixture = start_publisher(PublisherConfig::default()).await;

    let config = SubscriberConfig {
        compress_payload_data: true,
        ..SubscriberConfig::default()
    };
    let (subscriber, mut reader) = DataSubscriber::new(config);
    subscriber.connect(fixture.addr.to_string()).expect("connect");
    subscriber
        .subscribe(SubscriptionInfo::new("FILTER ActiveMeasurements WHERE True"))
        .await
        .expect("subscribe");
    wait_subscribed(&subscriber).await;

    let signal = fixture.signals[0];
    let t0 = base_tick();
    let values = [60.0f64, 60.25, 60.5, 60.25];
    let total = 10_000usize;

    let mut published = Vec::with_capacity(total);
    for i in 0..total {
        published.push(Measurement::new(
            signal,
            values[i % values.len()],
            Ticks(t0.0 + (i as u64) * 10 * Ticks::PER_MILLISECOND),
        ));
    }

    for chunk in published.chunks(500) {
        fixture.publisher.publish(chunk);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let received = collect(&mut reader, total).await;
    for (m, expected) in received.iter().zip(published.iter()) {
        assert_eq!(m.signal_id, expected.signal_id);
        assert_eq!(m.value, expected.value);
        assert_eq!(m.timestamp, expected.timestamp);
    }

    // Uncompressed compact records would be 9 bytes each; the compressed
    // stream plus all control frames must land under 35% of that
    let compact_bytes = (total * 9) as u64;
    let wire_bytes = subscriber.stats().total_bytes;
    assert!(
        wire_bytes * 100 < compact_bytes * 35,
        "wire {wire_bytes} bytes vs compact {compact_bytes} bytes"
    );

    subscriber.disconnect().await;
    fixture.publisher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn s3_filter_narrows_delivery_to_selected_signals() {
    let fixture = start_publisher(PublisherConfig::default()).await;
    let (subscriber, mut reader) = DataSubscriber::new(SubscriberConfig::default());
    subscriber.connect(fixture.addr.to_string()).expect("connect");
    subscriber
        .subscribe(SubscriptionInfo::new(
            "FILTER ActiveMeasurements WHERE PointTag = 'a'",
        ))
        .await
        .expect("subscribe");
    wait_subscribed(&subscriber).await;

    let t0 = base_tick();
    fixture.publisher.publish(&[
        Measurement::new(fixture.signals[0], 1.0, t0),
        Measurement::new(fixture.signals[1], 2.0, t0),
    ]);

    let only = collect(&mut reader, 1).await.remove(0);
    assert_eq!(only.signal_id, fixture.signals[0]);
    assert_eq!(only.value, 1.0);

    // Nothing else may arrive: signal b is outside the subscription
    let extra = timeout(Duration::from_millis(300), reader.next()).await;
    assert!(extra.is_err(), "received a measurement outside the filter");

    subscriber.disconnect().await;
    fixture.publisher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn s4_udp_cipher_rotation_flips_selector_once() {
    let fixture = start_publisher(PublisherConfig::default()).await;

    let listener = Arc::new(RecordingListener::default());
    let config = SubscriberConfig {
        udp_data_channel: Some(UdpDataChannel {
            port: 0,
            interface: None,
            encrypt: true,
        }),
        ..SubscriberConfig::default()
    };
    let (subscriber, mut reader) = DataSubscriber::with_listener(config, listener.clone());
    subscriber.connect(fixture.addr.to_string()).expect("connect");
    subscriber
        .subscribe(SubscriptionInfo::new("FILTER ActiveMeasurements WHERE True"))
        .await
        .expect("subscribe");
    wait_subscribed(&subscriber).await;

    let signal = fixture.signals[0];
    let t0 = base_tick();

    for i in 0..10u64 {
        fixture.publisher.publish(&[Measurement::new(
            signal,
            i as f64,
            Ticks(t0.0 + i * Ticks::PER_MILLISECOND),
        )]);
        tokio::time::sleep(Duration::from_millis(40)).await;
    }
    // Datagram loss is tolerated; at least one must land on loopback
    let first = timeout(Duration::from_secs(5), reader.next())
        .await
        .expect("no UDP measurement before rotation")
        .expect("stream closed");
    assert_eq!(first.signal_id, signal);

    subscriber.rotate_cipher_keys().await.expect("rotate");
    timeout(Duration::from_secs(5), async {
        while listener.cipher_indices.lock().len() < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("rotated keys never arrived");

    for i in 100..110u64 {
        fixture.publisher.publish(&[Measurement::new(
            signal,
            i as f64,
            Ticks(t0.0 + i * Ticks::PER_MILLISECOND),
        )]);
        tokio::time::sleep(Duration::from_millis(40)).await;
    }
    // Drain and require at least one post-rotation value
    let mut saw_post_rotation = false;
    while let Ok(Some(m)) = timeout(Duration::from_millis(500), reader.next()).await {
        if m.value >= 100.0 {
            saw_post_rotation = true;
            break;
        }
    }
    assert!(saw_post_rotation, "no measurements decrypted after rotation");

    // The key selector flipped exactly once: initial keys then one rotation
    assert_eq!(*listener.cipher_indices.lock(), vec![0, 1]);

    subscriber.disconnect().await;
    fixture.publisher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn s5_disconnect_ends_stream_and_reconnect_resubscribes() {
    // Part 1: without auto-reconnect the reader observes end-of-stream
    let fixture = start_publisher(PublisherConfig::default()).await;
    let (subscriber, mut reader) = DataSubscriber::new(SubscriberConfig::default());
    subscriber.connect(fixture.addr.to_string()).expect("connect");
    subscriber
        .subscribe(SubscriptionInfo::new("FILTER ActiveMeasurements WHERE True"))
        .await
        .expect("subscribe");
    wait_subscribed(&subscriber).await;

    fixture.publisher.stop().await;
    let end = timeout(Duration::from_secs(10), reader.next())
        .await
        .expect("reader did not observe the disconnect");
    assert!(end.is_none(), "expected end-of-stream after publisher stop");

    // Part 2: with auto-reconnect a fresh cache precedes further data
    let signals = fixture.signals.clone();
    let addr = fixture.addr;
    let fixture2 = {
        let publisher = DataPublisher::new(PublisherConfig::default());
        publisher.define_metadata(DataSet::with_active_measurements(vec![
            (signals[0], "a", "FREQ"),
            (signals[1], "b", "VPHM"),
            (signals[2], "c", "ALOG"),
        ]));
        publisher
            .start(&addr.to_string())
            .await
            .expect("rebind publisher port");
        publisher
    };

    let config = SubscriberConfig {
        auto_reconnect: true,
        reconnect_backoff: ReconnectBackoff {
            base_ms: 100,
            cap_ms: 500,
            factor: 2.0,
            jitter: 0.1,
        },
        ..SubscriberConfig::default()
    };
    let (subscriber2, mut reader2) = DataSubscriber::new(config);
    subscriber2.connect(addr.to_string()).expect("connect");
    subscriber2
        .subscribe(SubscriptionInfo::new("FILTER ActiveMeasurements WHERE True"))
        .await
        .expect("subscribe");
    wait_subscribed(&subscriber2).await;

    // Drop the publisher mid-stream, then bring a new one up on the same port
    fixture2.stop().await;
    timeout(Duration::from_secs(5), async {
        while subscriber2.is_subscribed() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("subscriber never noticed the outage");

    let publisher3 = DataPublisher::new(PublisherConfig::default());
    publisher3.define_metadata(DataSet::with_active_measurements(vec![
        (signals[0], "a", "FREQ"),
        (signals[1], "b", "VPHM"),
        (signals[2], "c", "ALOG"),
    ]));
    publisher3
        .start(&addr.to_string())
        .await
        .expect("rebind publisher port again");

    // A fresh subscription (and with it a fresh signal-index cache) must be
    // in place before any of these publishes can reach the reader
    let t0 = base_tick();
    let received = timeout(Duration::from_secs(15), async {
        loop {
            publisher3.publish(&[Measurement::new(signals[0], 42.5, t0)]);
            match timeout(Duration::from_millis(200), reader2.next()).await {
                Ok(Some(m)) => break m,
                Ok(None) => panic!("stream ended while auto-reconnect is enabled"),
                Err(_) => continue,
            }
        }
    })
    .await
    .expect("no measurement after reconnect");
    assert_eq!(received.signal_id, signals[0]);
    assert_eq!(received.value, 42.5f32 as f64);

    subscriber2.disconnect().await;
    publisher3.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn s6_oversize_frame_closes_the_connection() {
    let fixture = start_publisher(PublisherConfig::default()).await;

    let mut socket = tokio::net::TcpStream::connect(fixture.addr)
        .await
        .expect("raw connect");
    let oversize = (sttp_transport::DEFAULT_MAX_PACKET_SIZE as u32) + 1;
    socket
        .write_all(&oversize.to_be_bytes())
        .await
        .expect("write length");

    // The publisher may answer Failed first; either way the socket must close
    let mut buf = [0u8; 4096];
    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "publisher kept an oversize connection open");

    fixture.publisher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn command_before_modes_is_fatal() {
    let fixture = start_publisher(PublisherConfig::default()).await;

    let mut socket = tokio::net::TcpStream::connect(fixture.addr)
        .await
        .expect("raw connect");
    // Subscribe (0x02) before DefineOperationalModes violates the handshake
    socket
        .write_all(&[0, 0, 0, 1, 0x02])
        .await
        .expect("write frame");

    let mut buf = [0u8; 4096];
    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "publisher ignored a handshake violation");

    fixture.publisher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_connection_expires_on_keepalive() {
    let config = PublisherConfig {
        keepalive_timeout_sec: 1,
        ..PublisherConfig::default()
    };
    let fixture = start_publisher(config).await;

    let mut socket = tokio::net::TcpStream::connect(fixture.addr)
        .await
        .expect("raw connect");

    let mut buf = [0u8; 256];
    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "idle connection outlived the keepalive window");

    fixture.publisher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn resubscribe_rotates_the_cache_slot() {
    let fixture = start_publisher(PublisherConfig::default()).await;
    let (subscriber, mut reader) = DataSubscriber::new(SubscriberConfig::default());
    subscriber.connect(fixture.addr.to_string()).expect("connect");

    subscriber
        .subscribe(SubscriptionInfo::new(
            "FILTER ActiveMeasurements WHERE PointTag = 'a'",
        ))
        .await
        .expect("first subscribe");
    wait_subscribed(&subscriber).await;

    let t0 = base_tick();
    fixture
        .publisher
        .publish(&[Measurement::new(fixture.signals[0], 1.5, t0)]);
    assert_eq!(collect(&mut reader, 1).await[0].value, 1.5);

    // Second subscription lands in the other cache slot; data packets that
    // follow reference it and must still decode
    subscriber
        .subscribe(SubscriptionInfo::new(
            "FILTER ActiveMeasurements WHERE PointTag IN ('a', 'b')",
        ))
        .await
        .expect("second subscribe");
    tokio::time::sleep(Duration::from_millis(200)).await;

    fixture.publisher.publish(&[
        Measurement::new(fixture.signals[0], 2.5, Ticks(t0.0 + 1000)),
        Measurement::new(fixture.signals[1], 3.5, Ticks(t0.0 + 1000)),
    ]);
    let mut values: Vec<f64> = collect(&mut reader, 2).await.iter().map(|m| m.value).collect();
    values.sort_by(f64::total_cmp);
    assert_eq!(values, vec![2.5, 3.5]);

    subscriber.disconnect().await;
    fixture.publisher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn buffer_blocks_round_trip_with_confirmation() {
    let signals: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
    let pub_listener = Arc::new(PublisherRecorder::default());
    let publisher = DataPublisher::with_listener(PublisherConfig::default(), pub_listener.clone());
    publisher.define_metadata(DataSet::with_active_measurements(vec![
        (signals[0], "a", "FREQ"),
        (signals[1], "b", "VPHM"),
        (signals[2], "c", "ALOG"),
    ]));
    let addr = publisher.start("127.0.0.1:0").await.expect("publisher start");

    let sub_listener = Arc::new(RecordingListener::default());
    let (subscriber, _reader) =
        DataSubscriber::with_listener(SubscriberConfig::default(), sub_listener.clone());
    subscriber.connect(addr.to_string()).expect("connect");
    let mut info = SubscriptionInfo::new("FILTER ActiveMeasurements WHERE True");
    info.buffer_block_limit = 4;
    subscriber.subscribe(info).await.expect("subscribe");
    wait_subscribed(&subscriber).await;

    let connection_id = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(&id) = pub_listener.subscribed.lock().first() {
                break id;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("publisher never reported the subscription");

    let seq0 = publisher
        .publish_buffer_block(connection_id, 0, b"first block")
        .await
        .expect("first buffer block");
    let seq1 = publisher
        .publish_buffer_block(connection_id, 1, b"second block")
        .await
        .expect("second buffer block");
    assert_eq!((seq0, seq1), (0, 1));

    timeout(Duration::from_secs(5), async {
        while sub_listener.buffer_blocks.lock().len() < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("buffer blocks never arrived");
    assert_eq!(
        *sub_listener.buffer_blocks.lock(),
        vec![
            (0, b"first block".to_vec()),
            (1, b"second block".to_vec()),
        ]
    );

    // Unknown connections are rejected rather than silently dropped
    assert!(publisher
        .publish_buffer_block(connection_id + 1000, 0, b"nobody home")
        .await
        .is_err());

    subscriber.disconnect().await;
    publisher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn metadata_refresh_and_notifications_round_trip() {
    let fixture = start_publisher(PublisherConfig::default()).await;

    let listener = Arc::new(RecordingListener::default());
    let (subscriber, _reader) =
        DataSubscriber::with_listener(SubscriberConfig::default(), listener.clone());
    subscriber.connect(fixture.addr.to_string()).expect("connect");
    subscriber
        .subscribe(SubscriptionInfo::new("FILTER ActiveMeasurements WHERE True"))
        .await
        .expect("subscribe");
    wait_subscribed(&subscriber).await;

    subscriber.request_metadata(None).await.expect("metadata");
    timeout(Duration::from_secs(5), async {
        while subscriber.metadata().is_none() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("metadata never arrived");

    let metadata = subscriber.metadata().expect("metadata");
    let table = metadata.table("ActiveMeasurements").expect("table");
    assert_eq!(table.row_count(), 3);

    fixture.publisher.notify("maintenance window at 02:00");
    timeout(Duration::from_secs(5), async {
        while listener.notifications.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("notification never arrived");
    assert_eq!(
        listener.notifications.lock().as_slice(),
        ["maintenance window at 02:00"]
    );

    subscriber.disconnect().await;
    fixture.publisher.stop().await;
}
