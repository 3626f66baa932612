//! Subscriber engine
//!
//! Drives the client side of the protocol: negotiates operational modes,
//! (re)issues the stored subscription, reassembles frames from the command
//! channel and optional UDP data channel, decodes measurements and feeds a
//! bounded queue consumed through a lazy reader. When the connection dies the
//! reader observes end-of-stream; with auto-reconnect enabled the engine
//! instead backs off, reconnects and resubscribes, invalidating every cache
//! first.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sttp_core::flags::data_packet_flags;
use sttp_core::wire::{decode_string, StringEncoding, WireReader};
use sttp_core::{
    CompactCodec, DataSet, Measurement, ServerCommand, ServerResponse, SignalIndexCache, Ticks,
    TsscDecoder,
};

use crate::callbacks::{NullListener, SubscriberListener};
use crate::cipher::{CipherKeys, ENCRYPTED_FLAG, PLAIN_HEADER};
use crate::compression::gunzip;
use crate::config::SubscriberConfig;
use crate::error::{ErrorKind, Result, TransportError};
use crate::framing::{writer_pump, Frame, FrameCodec};
use crate::packets::{
    decode_ack, decode_base_times, decode_buffer_block, decode_data_packet, notification_hash,
};
use crate::subscription::SubscriptionInfo;

/// Lazy single-consumer measurement stream.
///
/// `next` blocks until a measurement arrives; `None` means the engine shut
/// down (or the connection closed without auto-reconnect).
pub struct MeasurementReader {
    rx: mpsc::Receiver<Measurement>,
}

impl MeasurementReader {
    pub async fn next(&mut self) -> Option<Measurement> {
        self.rx.recv().await
    }
}

/// Point-in-time subscriber statistics
#[derive(Debug, Clone, Copy)]
pub struct SubscriberStatsSnapshot {
    pub connected: bool,
    pub subscribed: bool,
    pub total_bytes: u64,
    pub total_measurements: u64,
}

/// Decode-side connection state, guarded by one short-lived lock
struct DecodeState {
    subscription: Option<SubscriptionInfo>,
    metadata: Option<Arc<DataSet>>,
    /// Two active cache slots selected by the data-packet cache-index flag
    caches: [Option<Arc<SignalIndexCache>>; 2],
    bases: [Ticks; 2],
    codec: CompactCodec,
    compress: bool,
    tssc: TsscDecoder,
    cipher: Option<CipherKeys>,
}

impl DecodeState {
    fn new() -> Self {
        Self {
            subscription: None,
            metadata: None,
            caches: [None, None],
            bases: [Ticks::default(), Ticks::default()],
            codec: CompactCodec::default(),
            compress: false,
            tssc: TsscDecoder::new(),
            cipher: None,
        }
    }

    /// Invalidate everything derived from a connection
    fn invalidate(&mut self) {
        self.caches = [None, None];
        self.bases = [Ticks::default(), Ticks::default()];
        self.tssc.reset();
        self.cipher = None;
    }
}

struct SubscriberInner {
    config: SubscriberConfig,
    listener: Arc<dyn SubscriberListener>,
    state: Mutex<DecodeState>,
    command_tx: Mutex<Option<mpsc::Sender<Frame>>>,
    measurement_tx: Mutex<Option<mpsc::Sender<Measurement>>>,
    current_udp_port: Mutex<Option<u16>>,
    cancel: CancellationToken,
    started: AtomicBool,
    connected: AtomicBool,
    subscribed: AtomicBool,
    total_bytes: AtomicU64,
    total_measurements: AtomicU64,
}

/// Measurement subscriber: one instance per publisher connection
pub struct DataSubscriber {
    inner: Arc<SubscriberInner>,
}

impl DataSubscriber {
    pub fn new(config: SubscriberConfig) -> (Self, MeasurementReader) {
        Self::with_listener(config, Arc::new(NullListener))
    }

    pub fn with_listener(
        config: SubscriberConfig,
        listener: Arc<dyn SubscriberListener>,
    ) -> (Self, MeasurementReader) {
        let (tx, rx) = mpsc::channel(config.measurement_queue_size.max(1));
        let subscriber = Self {
            inner: Arc::new(SubscriberInner {
                config,
                listener,
                state: Mutex::new(DecodeState::new()),
                command_tx: Mutex::new(None),
                measurement_tx: Mutex::new(Some(tx)),
                current_udp_port: Mutex::new(None),
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                subscribed: AtomicBool::new(false),
                total_bytes: AtomicU64::new(0),
                total_measurements: AtomicU64::new(0),
            }),
        };
        (subscriber, MeasurementReader { rx })
    }

    /// Start the connection driver. Returns immediately; connection progress
    /// is reported through the listener.
    pub fn connect(&self, endpoint: impl Into<String>) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(TransportError::Config(
                "subscriber is already connected".to_string(),
            ));
        }
        let inner = Arc::clone(&self.inner);
        let endpoint = endpoint.into();
        tokio::spawn(async move {
            run_loop(inner, endpoint).await;
        });
        Ok(())
    }

    /// Store the subscription and issue it on the current connection (it is
    /// reissued automatically after every reconnect)
    pub async fn subscribe(&self, mut info: SubscriptionInfo) -> Result<()> {
        let config = &self.inner.config;
        if config.compress_payload_data {
            info.compress_payload = true;
        }
        if config.use_millisecond_resolution {
            info.use_millisecond_resolution = true;
        }
        if config.double_precision {
            info.double_precision = true;
        }
        if let Some(udp) = &config.udp_data_channel {
            info.encrypt_data_channel = udp.encrypt;
            if info.udp_interface.is_none() {
                info.udp_interface = udp.interface.clone();
            }
        }

        {
            let mut state = self.inner.state.lock();
            state.codec = CompactCodec {
                include_time: info.include_time,
                millisecond_resolution: info.use_millisecond_resolution,
                double_precision: info.double_precision,
            };
            state.compress = info.compress_payload;
            state.subscription = Some(info.clone());
        }

        let frame = build_subscribe_frame(&self.inner, &info)?;
        match self.send_command(frame).await {
            // Not connected yet: the stored subscription is issued as soon
            // as the connection comes up
            Err(TransportError::NotConnected) => Ok(()),
            other => other,
        }
    }

    pub async fn unsubscribe(&self) -> Result<()> {
        self.inner.state.lock().subscription = None;
        self.send_command(Frame::empty(ServerCommand::Unsubscribe.code()))
            .await
    }

    /// Ask for the publisher's metadata, optionally narrowed by a filter
    pub async fn request_metadata(&self, filter: Option<&str>) -> Result<()> {
        let encoding = self.encoding()?;
        let payload = match filter {
            Some(expression) => {
                let mut out = Vec::new();
                sttp_core::wire::put_string(&mut out, expression, encoding);
                out
            }
            None => Vec::new(),
        };
        self.send_command(Frame::new(ServerCommand::MetadataRefresh.code(), payload))
            .await
    }

    /// Request fresh data-channel keys
    pub async fn rotate_cipher_keys(&self) -> Result<()> {
        self.send_command(Frame::empty(ServerCommand::RotateCipherKeys.code()))
            .await
    }

    /// Ask the publisher to down-sample to `interval_ms` (-1 = full rate)
    pub async fn set_processing_interval(&self, interval_ms: i32) -> Result<()> {
        self.send_command(Frame::new(
            ServerCommand::UpdateProcessingInterval.code(),
            interval_ms.to_be_bytes().to_vec(),
        ))
        .await
    }

    /// Stop the engine; the measurement reader observes end-of-stream
    pub async fn disconnect(&self) {
        self.inner.cancel.cancel();
        *self.inner.measurement_tx.lock() = None;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn is_subscribed(&self) -> bool {
        self.inner.subscribed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SubscriberStatsSnapshot {
        SubscriberStatsSnapshot {
            connected: self.is_connected(),
            subscribed: self.is_subscribed(),
            total_bytes: self.inner.total_bytes.load(Ordering::Relaxed),
            total_measurements: self.inner.total_measurements.load(Ordering::Relaxed),
        }
    }

    /// Metadata from the most recent refresh, when one completed
    pub fn metadata(&self) -> Option<Arc<DataSet>> {
        self.inner.state.lock().metadata.clone()
    }

    fn encoding(&self) -> Result<StringEncoding> {
        self.inner
            .config
            .effective_modes()
            .string_encoding()
            .map_err(TransportError::Codec)
    }

    async fn send_command(&self, frame: Frame) -> Result<()> {
        let tx = self
            .inner
            .command_tx
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

fn build_subscribe_frame(inner: &SubscriberInner, info: &SubscriptionInfo) -> Result<Frame> {
    let encoding = inner
        .config
        .effective_modes()
        .string_encoding()
        .map_err(TransportError::Codec)?;
    let mut info = info.clone();
    info.udp_port = *inner.current_udp_port.lock();
    Ok(Frame::new(
        ServerCommand::Subscribe.code(),
        info.encode(encoding),
    ))
}

async fn run_loop(inner: Arc<SubscriberInner>, endpoint: String) {
    let mut attempt = 0u32;
    loop {
        if inner.cancel.is_cancelled() {
            break;
        }

        let outcome = run_connection(&inner, &endpoint).await;

        let was_connected = inner.connected.swap(false, Ordering::AcqRel);
        inner.subscribed.store(false, Ordering::Release);
        *inner.command_tx.lock() = None;
        *inner.current_udp_port.lock() = None;
        inner.state.lock().invalidate();
        if was_connected {
            inner.listener.connection_terminated();
        }

        match outcome {
            Ok(()) => break, // deliberate disconnect
            Err(e) => {
                inner.listener.error_message(e.kind(), &e.to_string());
                warn!("connection to {} lost: {}", endpoint, e);
            }
        }

        if inner.cancel.is_cancelled() || !inner.config.auto_reconnect {
            break;
        }

        let delay = inner.config.reconnect_backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        debug!("reconnecting to {} in {:?}", endpoint, delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.cancel.cancelled() => break,
        }
    }

    // End of stream for the lazy reader
    *inner.measurement_tx.lock() = None;
}

async fn run_connection(inner: &Arc<SubscriberInner>, endpoint: &str) -> Result<()> {
    let socket = tokio::time::timeout(
        Duration::from_secs(10),
        TcpStream::connect(endpoint),
    )
    .await
    .map_err(|_| TransportError::Timeout(Duration::from_secs(10)))??;
    let remote = socket.peer_addr()?;

    let modes = inner.config.effective_modes();
    let encoding = modes.string_encoding().map_err(TransportError::Codec)?;
    let codec = FrameCodec::new(inner.config.max_packet_size as usize);

    let (read_half, write_half) = socket.into_split();
    let mut frames = FramedRead::new(read_half, codec.clone());
    let (cmd_tx, cmd_rx) = mpsc::channel::<Frame>(64);
    let conn_cancel = inner.cancel.child_token();

    tokio::spawn(writer_pump(
        FramedWrite::new(write_half, codec),
        cmd_rx,
        conn_cancel.clone(),
    ));
    *inner.command_tx.lock() = Some(cmd_tx.clone());

    {
        let mut state = inner.state.lock();
        state.invalidate();
    }
    inner.connected.store(true, Ordering::Release);
    inner.listener.connection_established(remote);
    info!("connected to {}", remote);

    // The negotiated modes are the first frame on every connection
    cmd_tx
        .send(Frame::new(
            ServerCommand::DefineOperationalModes.code(),
            modes.0.to_be_bytes().to_vec(),
        ))
        .await
        .map_err(|_| TransportError::ConnectionClosed)?;

    // Optional UDP data channel
    if let Some(udp_config) = &inner.config.udp_data_channel {
        let interface = udp_config.interface.as_deref().unwrap_or("0.0.0.0");
        let udp = UdpSocket::bind((interface, udp_config.port)).await?;
        let local_port = udp.local_addr()?.port();
        *inner.current_udp_port.lock() = Some(local_port);
        debug!("UDP data channel listening on port {}", local_port);
        tokio::spawn(udp_reader(
            Arc::clone(inner),
            Arc::new(udp),
            conn_cancel.clone(),
        ));
    }

    // Reissue a stored subscription (fresh connect or reconnect)
    let stored = inner.state.lock().subscription.clone();
    if let Some(info) = stored {
        let frame = build_subscribe_frame(inner, &info)?;
        cmd_tx
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
    }

    let ping_period = Duration::from_secs(u64::from(inner.config.keepalive_timeout_sec.max(3)) / 3);
    let mut ping = tokio::time::interval(ping_period);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            _ = conn_cancel.cancelled() => break Ok(()),
            _ = ping.tick() => {
                // Liveness ping; the publisher treats any frame as proof of life
                if cmd_tx.send(Frame::empty(ServerCommand::Connect.code())).await.is_err() {
                    break Err(TransportError::ConnectionClosed);
                }
            }
            frame = frames.next() => match frame {
                Some(Ok(frame)) => {
                    inner.total_bytes.fetch_add(frame.wire_len() as u64, Ordering::Relaxed);
                    if let Err(e) = handle_response(inner, &cmd_tx, encoding, frame).await {
                        break Err(e);
                    }
                }
                Some(Err(e)) => break Err(e),
                None => break Err(TransportError::ConnectionClosed),
            }
        }
    };

    conn_cancel.cancel();
    result
}

async fn udp_reader(inner: Arc<SubscriberInner>, socket: Arc<UdpSocket>, cancel: CancellationToken) {
    let mut buf = vec![0u8; 65_536];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => {
                let Ok((n, _)) = received else { break };
                if n == 0 {
                    continue;
                }
                let datagram = &buf[..n];
                inner.total_bytes.fetch_add(n as u64, Ordering::Relaxed);

                let frame_bytes = if datagram[0] == PLAIN_HEADER {
                    datagram[1..].to_vec()
                } else if datagram[0] & ENCRYPTED_FLAG != 0 {
                    let keys = inner.state.lock().cipher.clone();
                    match keys.map(|k| k.open(datagram)) {
                        Some(Ok((_selector, bytes))) => bytes,
                        // Undecryptable datagrams count as loss
                        _ => continue,
                    }
                } else {
                    continue;
                };

                let Ok(frame) = Frame::from_datagram_bytes(&frame_bytes) else {
                    continue;
                };
                if frame.code != ServerResponse::DataPacket.code() {
                    continue;
                }
                match decode_measurements(&inner, &frame.payload) {
                    Ok(measurements) => deliver(&inner, measurements).await,
                    // Datagram loss is expected; a corrupt packet is dropped
                    Err(e) => debug!("UDP packet dropped: {}", e),
                }
            }
        }
    }
}

async fn handle_response(
    inner: &Arc<SubscriberInner>,
    cmd_tx: &mpsc::Sender<Frame>,
    encoding: StringEncoding,
    frame: Frame,
) -> Result<()> {
    let response = ServerResponse::try_from(frame.code).map_err(TransportError::Codec)?;
    let payload = frame.payload.as_ref();

    match response {
        ServerResponse::Succeeded => {
            let (command, body) = decode_ack(payload)?;
            match command {
                ServerCommand::Subscribe => {
                    inner.subscribed.store(true, Ordering::Release);
                    let message = decode_string(body, encoding).unwrap_or_default();
                    inner.listener.subscription_confirmed(&message);
                }
                ServerCommand::Unsubscribe => {
                    inner.subscribed.store(false, Ordering::Release);
                    inner.listener.status_message("unsubscribed");
                }
                ServerCommand::MetadataRefresh => {
                    let raw = if inner.config.effective_modes().compress_metadata() {
                        gunzip(body)?
                    } else {
                        body.to_vec()
                    };
                    let dataset =
                        DataSet::from_json_bytes(&raw).map_err(TransportError::Codec)?;
                    let dataset = Arc::new(dataset);
                    inner.state.lock().metadata = Some(Arc::clone(&dataset));
                    inner.listener.metadata_received(&dataset);
                }
                other => {
                    let message = decode_string(body, encoding).unwrap_or_default();
                    inner
                        .listener
                        .status_message(&format!("{other} succeeded: {message}"));
                }
            }
        }
        ServerResponse::Failed => {
            let (command, body) = decode_ack(payload)?;
            let message = decode_string(body, encoding).unwrap_or_default();
            if command == ServerCommand::DefineOperationalModes {
                return Err(TransportError::PeerFailure {
                    command: command.to_string(),
                    reason: message,
                });
            }
            if command == ServerCommand::Subscribe {
                inner.subscribed.store(false, Ordering::Release);
            }
            inner
                .listener
                .error_message(ErrorKind::Subscription, &format!("{command} failed: {message}"));
        }
        ServerResponse::DataPacket => {
            let measurements = decode_measurements(inner, payload)?;
            deliver(inner, measurements).await;
        }
        ServerResponse::UpdateSignalIndexCache => {
            if payload.is_empty() {
                return Err(TransportError::MalformedFrame(
                    "empty signal-index cache update".to_string(),
                ));
            }
            let slot = usize::from(payload[0] & 1);
            let raw = if inner.config.effective_modes().compress_signal_index_cache() {
                gunzip(&payload[1..])?
            } else {
                payload[1..].to_vec()
            };
            let cache =
                SignalIndexCache::decode(&raw, encoding).map_err(TransportError::Codec)?;
            let count = cache.len();
            {
                let mut state = inner.state.lock();
                state.caches[slot] = Some(Arc::new(cache));
                if state.compress {
                    // A fresh cache implies fresh compressor state on both ends
                    state.tssc.reset();
                }
            }
            inner
                .listener
                .status_message(&format!("signal-index cache slot {slot}: {count} signal(s)"));
        }
        ServerResponse::UpdateBaseTimes => {
            let (_rollover, bases) = decode_base_times(payload)?;
            inner.state.lock().bases = bases;
        }
        ServerResponse::UpdateCipherKeys => {
            let keys = CipherKeys::decode_payload(payload)?;
            let active = keys.active;
            inner.state.lock().cipher = Some(keys);
            cmd_tx
                .send(Frame::new(
                    ServerCommand::ConfirmUpdateCipherKeys.code(),
                    vec![active],
                ))
                .await
                .map_err(|_| TransportError::ConnectionClosed)?;
            inner.listener.cipher_keys_updated(active);
        }
        ServerResponse::DataStartTime => {
            let mut reader = WireReader::new(payload);
            let start = Ticks(reader.read_u64().map_err(TransportError::Codec)?);
            inner.listener.data_start_time(start);
        }
        ServerResponse::ProcessingComplete => {
            let message = decode_string(payload, encoding).unwrap_or_default();
            inner.listener.processing_complete(&message);
        }
        ServerResponse::BufferBlock => {
            let (sequence, _runtime_index, body) = decode_buffer_block(payload)?;
            cmd_tx
                .send(Frame::new(
                    ServerCommand::ConfirmBufferBlock.code(),
                    sequence.to_be_bytes().to_vec(),
                ))
                .await
                .map_err(|_| TransportError::ConnectionClosed)?;
            inner.listener.buffer_block_received(sequence, body);
        }
        ServerResponse::Notify => {
            let message = decode_string(payload, encoding).unwrap_or_default();
            cmd_tx
                .send(Frame::new(
                    ServerCommand::ConfirmNotification.code(),
                    notification_hash(payload).to_be_bytes().to_vec(),
                ))
                .await
                .map_err(|_| TransportError::ConnectionClosed)?;
            inner.listener.notification_received(&message);
        }
        ServerResponse::ConfigurationChanged => {
            inner.listener.configuration_changed();
        }
        ServerResponse::UserResponse(code) => {
            inner
                .listener
                .status_message(&format!("user response 0x{code:02X}"));
        }
    }
    Ok(())
}

/// Decode a data packet under the state lock; measurements are delivered
/// afterwards so the lock never spans an await point
fn decode_measurements(inner: &SubscriberInner, payload: &[u8]) -> Result<Vec<Measurement>> {
    let (flags, count, body) = decode_data_packet(payload)?;
    let slot = usize::from(flags & data_packet_flags::CACHE_INDEX != 0);

    let mut state = inner.state.lock();
    // Mid-rotation packets for an unknown cache are dropped, not an error
    let Some(cache) = state.caches[slot].clone() else {
        return Ok(Vec::new());
    };

    let mut out = Vec::with_capacity(count as usize);
    if flags & data_packet_flags::COMPRESSED != 0 {
        state.tssc.set_block(body).map_err(TransportError::Codec)?;
        for _ in 0..count {
            match state.tssc.next_measurement().map_err(TransportError::Codec)? {
                Some((index, timestamp, flags, value)) => {
                    // Indices missing from this cache belong to the other
                    // slot's era; skip them rather than fail the stream
                    if let Some(signal_id) = cache.signal_id(index) {
                        out.push(Measurement {
                            signal_id,
                            value: f64::from(value),
                            timestamp,
                            flags,
                        });
                    }
                }
                None => break,
            }
        }
    } else {
        let mut reader = WireReader::new(body);
        for _ in 0..count {
            let record = state
                .codec
                .decode(&mut reader, &state.bases)
                .map_err(TransportError::Codec)?;
            if let Some(signal_id) = cache.signal_id(record.runtime_index) {
                out.push(Measurement {
                    signal_id,
                    value: record.value,
                    timestamp: record.timestamp,
                    flags: record.flags,
                });
            }
        }
    }
    Ok(out)
}

async fn deliver(inner: &SubscriberInner, measurements: Vec<Measurement>) {
    if measurements.is_empty() {
        return;
    }
    let Some(tx) = inner.measurement_tx.lock().clone() else {
        return;
    };
    let count = measurements.len() as u64;
    for measurement in measurements {
        // A full queue blocks here, which throttles the socket readers
        if tx.send(measurement).await.is_err() {
            return;
        }
    }
    inner.total_measurements.fetch_add(count, Ordering::Relaxed);
}
