//! Per-subscriber connection handling
//!
//! Each accepted socket runs a task trio plus a watchdog: a reader drives the
//! handshake state machine, a writer serializes every outbound frame, a
//! batcher turns routed measurements into data packets on the publish
//! interval, and a callback pump keeps user handlers single-threaded per
//! connection. The watchdog enforces keepalive and cipher-ack deadlines.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use sttp_core::flags::data_packet_flags;
use sttp_core::wire::{encode_string, StringEncoding};
use sttp_core::{
    CompactCodec, DataSet, FilterExpression, Measurement, OperationalModes, ServerCommand,
    ServerResponse, SignalIndexCache, Ticks, TsscEncoder,
};

use crate::callbacks::PublisherListener;
use crate::cipher::{CipherKeys, PLAIN_HEADER};
use crate::compression::gzip;
use crate::error::{ErrorKind, Result, TransportError};
use crate::framing::{Frame, FrameCodec};
use crate::packets::{encode_ack, encode_base_times, encode_data_packet};
use crate::subscription::SubscriptionInfo;

use super::PublisherInner;

/// Handle shared with the routing engine
pub(crate) struct ConnectionHandle {
    pub id: u64,
    pub remote: SocketAddr,
    pub cancel: CancellationToken,
    pub outbound: mpsc::Sender<Frame>,
    pub data_tx: mpsc::Sender<Vec<Measurement>>,
    subscribed: AtomicBool,
    pub signal_set: RwLock<AHashSet<Uuid>>,
    /// Next buffer-block sequence number handed out for this connection
    pub buffer_block_sequence: AtomicU32,
    /// Blocks sent but not yet confirmed by the subscriber
    pub unconfirmed_buffer_blocks: AtomicU32,
    /// Negotiated cap on unconfirmed blocks, 0 = unbounded
    pub buffer_block_limit: AtomicU32,
    last_received: Mutex<Instant>,
    encoding: Mutex<Option<EncodingState>>,
    cipher_ack_deadline: Mutex<Option<Instant>>,
}

impl ConnectionHandle {
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }
}

/// Per-subscription wire state, shared between reader and batcher
struct EncodingState {
    codec: CompactCodec,
    compress: bool,
    tssc: TsscEncoder,
    cache: Arc<SignalIndexCache>,
    cache_slot: u8,
    bases: [Ticks; 2],
    active_base: u8,
    last_rotation: Instant,
    start_time_sent: bool,
    cipher: Option<CipherKeys>,
    udp_target: Option<SocketAddr>,
}

/// Publisher-side handshake states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    New,
    Moded,
    Subscribed,
    Unsubscribed,
}

impl Handshake {
    fn name(self) -> &'static str {
        match self {
            Handshake::New => "NEW",
            Handshake::Moded => "MODED",
            Handshake::Subscribed => "SUBSCRIBED",
            Handshake::Unsubscribed => "UNSUBSCRIBED",
        }
    }
}

/// Reader-owned connection state
struct ConnState {
    handshake: Handshake,
    modes: OperationalModes,
    encoding: StringEncoding,
    next_cache_slot: u8,
    pending_cipher: Option<CipherKeys>,
    processing_interval: i32,
}

impl ConnState {
    fn new() -> Self {
        Self {
            handshake: Handshake::New,
            modes: OperationalModes::default(),
            encoding: StringEncoding::Utf8,
            next_cache_slot: 0,
            pending_cipher: None,
            processing_interval: -1,
        }
    }
}

/// Callback events, pumped through one task so handlers never overlap
enum ConnEvent {
    Established(SocketAddr),
    Terminated,
    Subscribed(usize),
    Unsubscribed,
    Status(String),
    Error(ErrorKind, String),
    ProcessingInterval(i32),
}

pub(crate) fn spawn(inner: Arc<PublisherInner>, id: u64, socket: TcpStream, remote: SocketAddr) {
    let cancel = inner.cancel.child_token();
    let (outbound_tx, outbound_rx) = mpsc::channel(inner.config.outbound_queue_size);
    let (data_tx, data_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let handle = Arc::new(ConnectionHandle {
        id,
        remote,
        cancel: cancel.clone(),
        outbound: outbound_tx,
        data_tx,
        subscribed: AtomicBool::new(false),
        signal_set: RwLock::new(AHashSet::new()),
        buffer_block_sequence: AtomicU32::new(0),
        unconfirmed_buffer_blocks: AtomicU32::new(0),
        buffer_block_limit: AtomicU32::new(0),
        last_received: Mutex::new(Instant::now()),
        encoding: Mutex::new(None),
        cipher_ack_deadline: Mutex::new(None),
    });

    inner.connections.write().insert(id, Arc::clone(&handle));

    let (read_half, write_half) = socket.into_split();
    let codec = FrameCodec::new(inner.config.max_packet_size as usize);

    tokio::spawn(callback_pump(
        id,
        Arc::clone(&inner.listener),
        event_rx,
    ));
    tokio::spawn(crate::framing::writer_pump(
        FramedWrite::new(write_half, codec.clone()),
        outbound_rx,
        cancel.clone(),
    ));
    tokio::spawn(batcher_task(
        Arc::clone(&inner),
        Arc::clone(&handle),
        data_rx,
        event_tx.clone(),
    ));
    tokio::spawn(watchdog_task(
        Arc::clone(&inner),
        Arc::clone(&handle),
        event_tx.clone(),
    ));
    tokio::spawn(reader_task(
        inner,
        handle,
        FramedRead::new(read_half, codec),
        event_tx,
    ));
}

async fn callback_pump(
    id: u64,
    listener: Arc<dyn PublisherListener>,
    mut events: mpsc::UnboundedReceiver<ConnEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnEvent::Established(remote) => listener.connection_established(id, remote),
            ConnEvent::Terminated => listener.connection_terminated(id),
            ConnEvent::Subscribed(count) => listener.subscribed(id, count),
            ConnEvent::Unsubscribed => listener.unsubscribed(id),
            ConnEvent::Status(message) => listener.status_message(id, &message),
            ConnEvent::Error(kind, message) => listener.error_message(id, kind, &message),
            ConnEvent::ProcessingInterval(interval) => {
                listener.processing_interval_changed(id, interval)
            }
        }
    }
}

async fn watchdog_task(
    inner: Arc<PublisherInner>,
    handle: Arc<ConnectionHandle>,
    events: mpsc::UnboundedSender<ConnEvent>,
) {
    let keepalive = Duration::from_secs(u64::from(inner.config.keepalive_timeout_sec));
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => break,
            _ = ticker.tick() => {
                let idle = handle.last_received.lock().elapsed();
                if idle > keepalive {
                    let err = TransportError::KeepaliveExpired(keepalive);
                    let _ = events.send(ConnEvent::Error(err.kind(), err.to_string()));
                    handle.cancel.cancel();
                    break;
                }
                let expired = handle
                    .cipher_ack_deadline
                    .lock()
                    .is_some_and(|deadline| Instant::now() > deadline);
                if expired {
                    let timeout = Duration::from_secs(inner.config.cipher_ack_timeout_sec);
                    let err = TransportError::CipherAckTimeout(timeout);
                    let _ = events.send(ConnEvent::Error(err.kind(), err.to_string()));
                    handle.cancel.cancel();
                    break;
                }
            }
        }
    }
}

async fn reader_task(
    inner: Arc<PublisherInner>,
    handle: Arc<ConnectionHandle>,
    mut frames: FramedRead<tokio::net::tcp::OwnedReadHalf, FrameCodec>,
    events: mpsc::UnboundedSender<ConnEvent>,
) {
    let _ = events.send(ConnEvent::Established(handle.remote));
    let mut state = ConnState::new();

    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => break,
            frame = frames.next() => match frame {
                Some(Ok(frame)) => {
                    *handle.last_received.lock() = Instant::now();
                    let code = frame.code;
                    match handle_command(&inner, &handle, &mut state, frame, &events).await {
                        Ok(()) => {}
                        Err(e) if e.is_fatal() => {
                            warn!("connection {}: fatal: {}", handle.id, e);
                            let _ = events.send(ConnEvent::Error(e.kind(), e.to_string()));
                            send_failed(&handle, &state, code, &e.to_string());
                            break;
                        }
                        Err(e) => {
                            debug!("connection {}: {}", handle.id, e);
                            let _ = events.send(ConnEvent::Error(e.kind(), e.to_string()));
                            send_failed(&handle, &state, code, &e.to_string());
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!("connection {}: framing error: {}", handle.id, e);
                    let _ = events.send(ConnEvent::Error(e.kind(), e.to_string()));
                    send_failed(&handle, &state, ServerCommand::Connect.code(), &e.to_string());
                    break;
                }
                None => {
                    debug!("connection {}: socket closed by peer", handle.id);
                    break;
                }
            }
        }
    }

    inner.connections.write().remove(&handle.id);
    handle.cancel.cancel();
    let _ = events.send(ConnEvent::Terminated);
}

/// Best-effort `Failed` response ahead of a close
fn send_failed(handle: &ConnectionHandle, state: &ConnState, command: u8, reason: &str) {
    let body = encode_string(reason, state.encoding);
    let command = ServerCommand::try_from(command).unwrap_or(ServerCommand::Connect);
    let frame = Frame::new(ServerResponse::Failed.code(), encode_ack(command, &body));
    let _ = handle.outbound.try_send(frame);
}

async fn send_frame(
    inner: &PublisherInner,
    handle: &ConnectionHandle,
    frame: Frame,
) -> Result<()> {
    let stall = Duration::from_secs(inner.config.stall_timeout_sec);
    handle
        .outbound
        .send_timeout(frame, stall)
        .await
        .map_err(|_| TransportError::QueueStalled(stall))
}

async fn send_succeeded(
    inner: &PublisherInner,
    handle: &ConnectionHandle,
    state: &ConnState,
    command: ServerCommand,
    message: &str,
) -> Result<()> {
    let body = encode_string(message, state.encoding);
    let frame = Frame::new(ServerResponse::Succeeded.code(), encode_ack(command, &body));
    send_frame(inner, handle, frame).await
}

async fn handle_command(
    inner: &Arc<PublisherInner>,
    handle: &Arc<ConnectionHandle>,
    state: &mut ConnState,
    frame: Frame,
    events: &mpsc::UnboundedSender<ConnEvent>,
) -> Result<()> {
    let command = ServerCommand::try_from(frame.code).map_err(TransportError::Codec)?;

    // The ping is valid in every state; everything else but the mode
    // definition needs a negotiated connection first.
    if command == ServerCommand::Connect {
        return Ok(());
    }
    if state.handshake == Handshake::New && command != ServerCommand::DefineOperationalModes {
        return Err(TransportError::UnexpectedCommand {
            command: frame.code,
            state: state.handshake.name(),
        });
    }

    match command {
        ServerCommand::Connect => Ok(()),
        ServerCommand::DefineOperationalModes => {
            handle_define_modes(inner, handle, state, &frame.payload).await
        }
        ServerCommand::MetadataRefresh => {
            let result = handle_metadata_refresh(inner, handle, state, &frame.payload).await;
            if result.is_ok() {
                let _ = events.send(ConnEvent::Status("metadata sent".to_string()));
            }
            result
        }
        ServerCommand::Subscribe => {
            handle_subscribe(inner, handle, state, &frame.payload, events).await
        }
        ServerCommand::Unsubscribe => {
            let result = handle_unsubscribe(inner, handle, state).await;
            if result.is_ok() {
                let _ = events.send(ConnEvent::Unsubscribed);
            }
            result
        }
        ServerCommand::RotateCipherKeys => handle_rotate_keys(inner, handle, state).await,
        ServerCommand::ConfirmUpdateCipherKeys => {
            handle_confirm_cipher(handle, state);
            Ok(())
        }
        ServerCommand::UpdateProcessingInterval => {
            let result = handle_processing_interval(inner, handle, state, &frame.payload).await;
            if result.is_ok() {
                let _ = events.send(ConnEvent::ProcessingInterval(state.processing_interval));
            }
            result
        }
        ServerCommand::ConfirmNotification => {
            debug!("connection {}: notification confirmed", handle.id);
            Ok(())
        }
        ServerCommand::ConfirmBufferBlock => {
            let _ = handle.unconfirmed_buffer_blocks.fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |count| count.checked_sub(1),
            );
            debug!("connection {}: buffer block confirmed", handle.id);
            Ok(())
        }
        ServerCommand::UserCommand(code) => Err(TransportError::SubscriptionRejected(format!(
            "user command 0x{code:02X} is not supported"
        ))),
    }
}

async fn handle_define_modes(
    inner: &PublisherInner,
    handle: &ConnectionHandle,
    state: &mut ConnState,
    payload: &[u8],
) -> Result<()> {
    if state.handshake != Handshake::New {
        // Modes are immutable for the life of the connection
        return Err(TransportError::UnexpectedCommand {
            command: ServerCommand::DefineOperationalModes.code(),
            state: state.handshake.name(),
        });
    }
    if payload.len() != 4 {
        return Err(TransportError::MalformedFrame(format!(
            "operational modes payload of {} bytes",
            payload.len()
        )));
    }
    let modes = OperationalModes(u32::from_be_bytes([
        payload[0], payload[1], payload[2], payload[3],
    ]));
    if modes.version() != OperationalModes::CURRENT_VERSION {
        return Err(TransportError::SubscriptionRejected(format!(
            "unsupported protocol version {}",
            modes.version()
        )));
    }
    state.encoding = modes.string_encoding().map_err(TransportError::Codec)?;
    state.modes = modes;
    state.handshake = Handshake::Moded;
    debug!(
        "connection {}: modes 0x{:08X}, encoding {:?}",
        handle.id, modes.0, state.encoding
    );
    send_succeeded(
        inner,
        handle,
        state,
        ServerCommand::DefineOperationalModes,
        "operational modes accepted",
    )
    .await
}

async fn handle_metadata_refresh(
    inner: &PublisherInner,
    handle: &ConnectionHandle,
    state: &ConnState,
    payload: &[u8],
) -> Result<()> {
    let metadata = inner.metadata.read().clone();

    let filtered: DataSet = if payload.is_empty() {
        (*metadata).clone()
    } else {
        let mut reader = sttp_core::wire::WireReader::new(payload);
        let expression = reader
            .read_string(state.encoding)
            .map_err(TransportError::Codec)?;
        filter_metadata(&metadata, &expression)?
    };

    let mut blob = filtered.to_json_bytes().map_err(TransportError::Codec)?;
    if state.modes.compress_metadata() {
        blob = gzip(&blob)?;
    }

    let frame = Frame::new(
        ServerResponse::Succeeded.code(),
        encode_ack(ServerCommand::MetadataRefresh, &blob),
    );
    send_frame(inner, handle, frame).await
}

/// Restrict metadata to rows matching a subscriber-supplied expression
fn filter_metadata(metadata: &DataSet, expression: &str) -> Result<DataSet> {
    let filter = FilterExpression::parse(expression).map_err(TransportError::Codec)?;
    let selected: AHashSet<Uuid> = filter
        .resolve(metadata)
        .map_err(TransportError::Codec)?
        .into_iter()
        .collect();

    let table_name = match &filter {
        FilterExpression::All { table }
        | FilterExpression::Equals { table, .. }
        | FilterExpression::In { table, .. } => Some(table.clone()),
        FilterExpression::SignalIds(_) => None,
    };

    let mut filtered = DataSet::new(metadata.name.clone());
    for table in metadata.tables() {
        let mut table = table.clone();
        let applies = table_name
            .as_deref()
            .map(|n| table.name.eq_ignore_ascii_case(n))
            // A bare signal-ID list filters any table that names signals
            .unwrap_or(table.column_index("SignalID").is_some());
        if applies {
            if let Some(column) = table.column_index("SignalID") {
                table.retain_rows(|row| {
                    row.get(column)
                        .and_then(|v| v.as_str())
                        .and_then(|s| Uuid::parse_str(s).ok())
                        .is_some_and(|id| selected.contains(&id))
                });
            }
        }
        filtered.add_table(table);
    }
    Ok(filtered)
}

async fn handle_subscribe(
    inner: &Arc<PublisherInner>,
    handle: &Arc<ConnectionHandle>,
    state: &mut ConnState,
    payload: &[u8],
    events: &mpsc::UnboundedSender<ConnEvent>,
) -> Result<()> {
    let info = SubscriptionInfo::decode(payload, state.encoding)?;
    let filter = info.parsed_filter()?;
    let metadata = inner.metadata.read().clone();
    let signals = filter.resolve(&metadata).map_err(TransportError::Codec)?;

    // Per-signal source metadata rides along when the measurement table has it
    let mut sources: AHashMap<Uuid, (String, u64)> = AHashMap::new();
    if let Some(table) = metadata.table("ActiveMeasurements") {
        if let (Some(sig_col), Some(tag_col)) =
            (table.column_index("SignalID"), table.column_index("PointTag"))
        {
            for (row_number, row) in table.rows().enumerate() {
                if let Some(id) = row[sig_col].as_str().and_then(|s| Uuid::parse_str(s).ok()) {
                    let tag = row[tag_col].as_str().unwrap_or_default().to_string();
                    sources.insert(id, (tag, row_number as u64 + 1));
                }
            }
        }
    }

    let mut cache = SignalIndexCache::new();
    for (index, signal_id) in signals.iter().enumerate() {
        let (source, source_id) = sources.get(signal_id).cloned().unwrap_or_default();
        cache
            .add_record(index as u32, *signal_id, source, source_id)
            .map_err(TransportError::Codec)?;
    }
    let cache = Arc::new(cache);

    let slot = state.next_cache_slot;
    state.next_cache_slot ^= 1;

    // Cipher keys only apply to an encrypted UDP data channel
    let cipher = if info.udp_port.is_some() && info.encrypt_data_channel {
        Some(CipherKeys::generate())
    } else {
        None
    };
    // Datagrams target the subscriber's bound interface when it names a
    // concrete address; an unspecified or absent interface falls back to the
    // command channel's remote address
    let udp_target = info.udp_port.map(|port| {
        let host = info
            .udp_interface
            .as_deref()
            .and_then(|interface| interface.parse::<std::net::IpAddr>().ok())
            .filter(|ip| !ip.is_unspecified())
            .unwrap_or_else(|| handle.remote.ip());
        SocketAddr::new(host, port)
    });

    let now = Ticks::now();
    let rollover = Duration::from_secs(inner.config.base_time_rotation_sec);
    {
        let mut encoding = handle.encoding.lock();
        *encoding = Some(EncodingState {
            codec: CompactCodec {
                include_time: info.include_time,
                millisecond_resolution: info.use_millisecond_resolution,
                double_precision: info.double_precision,
            },
            compress: info.compress_payload && state.modes.compress_payload_data(),
            tssc: TsscEncoder::new(),
            cache: Arc::clone(&cache),
            cache_slot: slot,
            bases: [now, now],
            active_base: 0,
            last_rotation: Instant::now(),
            start_time_sent: false,
            cipher: cipher.clone(),
            udp_target,
        });
    }

    *handle.signal_set.write() = cache.signal_ids().collect();

    // Cache first, then keys, then the acknowledgement: the subscriber must
    // hold everything it needs before the first data packet can be observed.
    let mut cache_bytes = cache.encode(state.encoding);
    if state.modes.compress_signal_index_cache() {
        cache_bytes = gzip(&cache_bytes)?;
    }
    let mut update = Vec::with_capacity(cache_bytes.len() + 1);
    update.push(slot);
    update.extend_from_slice(&cache_bytes);
    send_frame(
        inner,
        handle,
        Frame::new(ServerResponse::UpdateSignalIndexCache.code(), update),
    )
    .await?;

    send_frame(
        inner,
        handle,
        Frame::new(
            ServerResponse::UpdateBaseTimes.code(),
            encode_base_times(Ticks(rollover.as_millis() as u64 * Ticks::PER_MILLISECOND), &[now, now]),
        ),
    )
    .await?;

    if let Some(keys) = &cipher {
        send_frame(
            inner,
            handle,
            Frame::new(ServerResponse::UpdateCipherKeys.code(), keys.encode_payload()),
        )
        .await?;
    }

    let signal_count = cache.len();
    send_succeeded(
        inner,
        handle,
        state,
        ServerCommand::Subscribe,
        &format!("{signal_count} signal(s) subscribed"),
    )
    .await?;

    handle
        .buffer_block_limit
        .store(info.buffer_block_limit, Ordering::Release);
    handle.buffer_block_sequence.store(0, Ordering::Release);
    handle.unconfirmed_buffer_blocks.store(0, Ordering::Release);
    handle.subscribed.store(true, Ordering::Release);
    state.handshake = Handshake::Subscribed;
    let _ = events.send(ConnEvent::Subscribed(signal_count));
    debug!(
        "connection {}: subscribed to {} signal(s), slot {}, compress={}",
        handle.id,
        signal_count,
        slot,
        info.compress_payload && state.modes.compress_payload_data(),
    );
    Ok(())
}

async fn handle_unsubscribe(
    inner: &PublisherInner,
    handle: &ConnectionHandle,
    state: &mut ConnState,
) -> Result<()> {
    handle.subscribed.store(false, Ordering::Release);
    handle.signal_set.write().clear();
    handle.buffer_block_limit.store(0, Ordering::Release);
    handle.unconfirmed_buffer_blocks.store(0, Ordering::Release);
    *handle.encoding.lock() = None;
    *handle.cipher_ack_deadline.lock() = None;
    state.pending_cipher = None;
    state.handshake = Handshake::Unsubscribed;
    send_succeeded(inner, handle, state, ServerCommand::Unsubscribe, "unsubscribed").await
}

async fn handle_rotate_keys(
    inner: &PublisherInner,
    handle: &ConnectionHandle,
    state: &mut ConnState,
) -> Result<()> {
    let current = {
        let encoding = handle.encoding.lock();
        encoding.as_ref().and_then(|e| e.cipher.clone())
    };
    let Some(current) = current else {
        return Err(TransportError::SubscriptionRejected(
            "no encrypted data channel to rotate".to_string(),
        ));
    };

    let pending = current.rotated();
    let frame = Frame::new(
        ServerResponse::UpdateCipherKeys.code(),
        pending.encode_payload(),
    );
    send_frame(inner, handle, frame).await?;

    state.pending_cipher = Some(pending);
    *handle.cipher_ack_deadline.lock() =
        Some(Instant::now() + Duration::from_secs(inner.config.cipher_ack_timeout_sec));
    Ok(())
}

fn handle_confirm_cipher(handle: &ConnectionHandle, state: &mut ConnState) {
    let Some(pending) = state.pending_cipher.take() else {
        debug!("connection {}: spurious cipher confirmation", handle.id);
        return;
    };
    *handle.cipher_ack_deadline.lock() = None;
    if let Some(encoding) = handle.encoding.lock().as_mut() {
        encoding.cipher = Some(pending);
    }
    debug!("connection {}: cipher keys rotated", handle.id);
}

async fn handle_processing_interval(
    inner: &PublisherInner,
    handle: &ConnectionHandle,
    state: &mut ConnState,
    payload: &[u8],
) -> Result<()> {
    if payload.len() != 4 {
        return Err(TransportError::MalformedFrame(format!(
            "processing interval payload of {} bytes",
            payload.len()
        )));
    }
    let interval = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    state.processing_interval = interval;
    send_succeeded(
        inner,
        handle,
        state,
        ServerCommand::UpdateProcessingInterval,
        "processing interval updated",
    )
    .await
}

/// Estimated compact record size used for early-flush decisions
const RECORD_ESTIMATE: usize = 20;

async fn batcher_task(
    inner: Arc<PublisherInner>,
    handle: Arc<ConnectionHandle>,
    mut data_rx: mpsc::Receiver<Vec<Measurement>>,
    events: mpsc::UnboundedSender<ConnEvent>,
) {
    let mut flush = tokio::time::interval(Duration::from_millis(inner.config.publish_interval_ms));
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut pending: Vec<Measurement> = Vec::new();

    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => break,
            batch = data_rx.recv() => match batch {
                Some(mut batch) => {
                    pending.append(&mut batch);
                    if pending.len() * RECORD_ESTIMATE >= inner.config.max_batch_bytes {
                        if let Err(e) = flush_batch(&inner, &handle, &mut pending).await {
                            let _ = events.send(ConnEvent::Error(e.kind(), e.to_string()));
                            handle.cancel.cancel();
                            break;
                        }
                    }
                }
                None => break,
            },
            _ = flush.tick() => {
                if !pending.is_empty() {
                    if let Err(e) = flush_batch(&inner, &handle, &mut pending).await {
                        let _ = events.send(ConnEvent::Error(e.kind(), e.to_string()));
                        handle.cancel.cancel();
                        break;
                    }
                }
            }
        }
    }
}

async fn flush_batch(
    inner: &PublisherInner,
    handle: &ConnectionHandle,
    pending: &mut Vec<Measurement>,
) -> Result<()> {
    let batch = std::mem::take(pending);

    // Encode under the lock, ship after releasing it
    let (frames, udp, measurements) = {
        let mut guard = handle.encoding.lock();
        let Some(encoding) = guard.as_mut() else {
            return Ok(()); // unsubscribed while batch was queued
        };

        let mut frames: Vec<Frame> = Vec::new();
        let rollover = Duration::from_secs(inner.config.base_time_rotation_sec);

        // Rotate the older base slot forward when it ages out
        if encoding.last_rotation.elapsed() >= rollover {
            let stale = encoding.active_base ^ 1;
            encoding.bases[usize::from(stale)] = Ticks::now();
            encoding.active_base = stale;
            encoding.last_rotation = Instant::now();
            frames.push(Frame::new(
                ServerResponse::UpdateBaseTimes.code(),
                encode_base_times(
                    Ticks(rollover.as_millis() as u64 * Ticks::PER_MILLISECOND),
                    &encoding.bases,
                ),
            ));
        }

        if !encoding.start_time_sent {
            encoding.start_time_sent = true;
            let start = batch.first().map(|m| m.timestamp).unwrap_or_else(Ticks::now);
            frames.push(Frame::new(
                ServerResponse::DataStartTime.code(),
                start.0.to_be_bytes().to_vec(),
            ));
        }

        let mut packet_flags = data_packet_flags::COMPACT;
        if encoding.cache_slot == 1 {
            packet_flags |= data_packet_flags::CACHE_INDEX;
        }

        let mut count = 0u32;
        let body = if encoding.compress {
            for m in &batch {
                // Signals that left the cache mid-rotation are skipped
                let Some(index) = encoding.cache.index_of(&m.signal_id) else {
                    continue;
                };
                encoding
                    .tssc
                    .add_measurement(index, m.timestamp, m.flags, m.value as f32);
                count += 1;
            }
            packet_flags |= data_packet_flags::COMPRESSED;
            encoding.tssc.finish()
        } else {
            let mut body = Vec::with_capacity(batch.len() * RECORD_ESTIMATE);
            for m in &batch {
                let Some(index) = encoding.cache.index_of(&m.signal_id) else {
                    continue;
                };
                encoding.codec.encode(
                    &mut body,
                    index,
                    m.value,
                    m.timestamp,
                    m.flags,
                    &encoding.bases,
                    encoding.active_base,
                );
                count += 1;
            }
            body
        };

        if count > 0 {
            frames.push(Frame::new(
                ServerResponse::DataPacket.code(),
                encode_data_packet(packet_flags, count, &body),
            ));
        }

        // Compressed payloads stay on TCP: stream state cannot be allowed
        // to desynchronize through datagram loss
        let udp = if encoding.compress {
            None
        } else {
            encoding
                .udp_target
                .map(|target| (target, encoding.cipher.clone()))
        };
        (frames, udp, u64::from(count))
    };

    let udp_socket = inner.udp_socket.read().clone();
    let mut bytes_sent = 0u64;

    for frame in frames {
        let is_data = frame.code == ServerResponse::DataPacket.code();
        bytes_sent += frame.wire_len() as u64;

        match (&udp, &udp_socket, is_data) {
            (Some((target, cipher)), Some(socket), true) => {
                let raw = frame.to_datagram_bytes();
                let datagram = match cipher {
                    Some(keys) => keys.seal(&raw)?,
                    None => {
                        let mut plain = Vec::with_capacity(raw.len() + 1);
                        plain.push(PLAIN_HEADER);
                        plain.extend_from_slice(&raw);
                        plain
                    }
                };
                socket.send_to(&datagram, *target).await?;
            }
            _ => send_frame(inner, handle, frame).await?,
        }
    }

    inner
        .stats
        .total_bytes
        .fetch_add(bytes_sent, Ordering::Relaxed);
    inner
        .stats
        .total_measurements
        .fetch_add(measurements, Ordering::Relaxed);
    Ok(())
}
