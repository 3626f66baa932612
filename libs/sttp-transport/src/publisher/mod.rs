//! Publisher engine
//!
//! Owns the TCP listener, the copy-on-write metadata snapshot and the set of
//! subscriber connections. Publishing never blocks: each batch is intersected
//! with every subscriber's signal set and handed to that connection's bounded
//! queue; a connection that cannot keep up is closed on its own without
//! disturbing the others.

mod connection;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::RwLock;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sttp_core::{DataSet, Measurement, ServerCommand, ServerResponse};

use crate::callbacks::{NullListener, PublisherListener};
use crate::config::PublisherConfig;
use crate::error::{Result, TransportError};
use crate::framing::Frame;
use crate::packets::{encode_ack, encode_buffer_block};

pub(crate) use connection::ConnectionHandle;

/// Aggregate publish-side counters
#[derive(Debug, Default)]
pub struct PublisherStats {
    pub total_bytes: AtomicU64,
    pub total_measurements: AtomicU64,
}

/// Point-in-time statistics snapshot
#[derive(Debug, Clone, Copy)]
pub struct PublisherStatsSnapshot {
    pub connections: usize,
    pub total_bytes: u64,
    pub total_measurements: u64,
}

pub(crate) struct PublisherInner {
    pub config: PublisherConfig,
    pub metadata: RwLock<Arc<DataSet>>,
    pub connections: RwLock<AHashMap<u64, Arc<ConnectionHandle>>>,
    pub listener: Arc<dyn PublisherListener>,
    pub next_id: AtomicU64,
    pub cancel: CancellationToken,
    pub udp_socket: RwLock<Option<Arc<UdpSocket>>>,
    pub stats: PublisherStats,
}

/// Measurement publisher: accepts subscriber connections and fans published
/// batches out to whoever subscribed to each signal.
pub struct DataPublisher {
    inner: Arc<PublisherInner>,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl DataPublisher {
    pub fn new(config: PublisherConfig) -> Self {
        Self::with_listener(config, Arc::new(NullListener))
    }

    pub fn with_listener(config: PublisherConfig, listener: Arc<dyn PublisherListener>) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                config,
                metadata: RwLock::new(Arc::new(DataSet::new("Metadata"))),
                connections: RwLock::new(AHashMap::new()),
                listener,
                next_id: AtomicU64::new(1),
                cancel: CancellationToken::new(),
                udp_socket: RwLock::new(None),
                stats: PublisherStats::default(),
            }),
            local_addr: RwLock::new(None),
        }
    }

    /// Bind the listener and start accepting subscribers
    pub async fn start(&self, endpoint: &str) -> Result<SocketAddr> {
        let addr: SocketAddr = endpoint.parse().map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid endpoint '{endpoint}'"),
            )
        })?;
        // Reuse-addr so a publisher can rebind its port right after a restart
        let socket = if addr.is_ipv4() {
            tokio::net::TcpSocket::new_v4()?
        } else {
            tokio::net::TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(1024)?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.write() = Some(local_addr);

        // One shared socket sources all UDP data channels
        let udp = Arc::new(UdpSocket::bind(("0.0.0.0", 0)).await?);
        *self.inner.udp_socket.write() = Some(udp);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            accept_loop(inner, listener).await;
        });

        info!("Publisher listening on {}", local_addr);
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Atomically replace the metadata offered to new and refreshing
    /// subscribers. Active subscriptions keep their resolved signal sets;
    /// every connection is told the configuration changed.
    pub fn define_metadata(&self, dataset: DataSet) {
        *self.inner.metadata.write() = Arc::new(dataset);

        let connections: Vec<_> = self.inner.connections.read().values().cloned().collect();
        for connection in connections {
            let frame = Frame::empty(ServerResponse::ConfigurationChanged.code());
            if connection.outbound.try_send(frame).is_err() {
                debug!(
                    "connection {}: configuration-changed notice dropped (queue full)",
                    connection.id
                );
            }
        }
    }

    /// Submit a batch to all interested subscribers. Non-blocking: a
    /// subscriber whose routing queue is full misses this batch and the
    /// stall watchdog decides its fate.
    pub fn publish(&self, batch: &[Measurement]) {
        if batch.is_empty() {
            return;
        }

        let connections: Vec<_> = self.inner.connections.read().values().cloned().collect();
        for connection in connections {
            if !connection.is_subscribed() {
                continue;
            }
            let matching: Vec<Measurement> = {
                let signals = connection.signal_set.read();
                batch
                    .iter()
                    .filter(|m| signals.contains(&m.signal_id))
                    .copied()
                    .collect()
            };
            if matching.is_empty() {
                continue;
            }
            let count = matching.len() as u64;
            if connection.data_tx.try_send(matching).is_err() {
                warn!(
                    "connection {}: routing queue full, dropping {} measurement(s)",
                    connection.id, count
                );
            }
        }
    }

    /// Send an opaque buffer block to one subscriber over its command
    /// channel. Returns the assigned sequence number; the subscriber
    /// confirms each block with `ConfirmBufferBlock`. When the subscription
    /// negotiated a buffer-block limit, sends beyond the unconfirmed cap are
    /// rejected.
    pub async fn publish_buffer_block(
        &self,
        connection_id: u64,
        runtime_index: u32,
        body: &[u8],
    ) -> Result<u32> {
        let connection = self
            .inner
            .connections
            .read()
            .get(&connection_id)
            .cloned()
            .ok_or(TransportError::NotConnected)?;
        if !connection.is_subscribed() {
            return Err(TransportError::NotConnected);
        }

        let limit = connection.buffer_block_limit.load(Ordering::Acquire);
        if limit > 0 && connection.unconfirmed_buffer_blocks.load(Ordering::Acquire) >= limit {
            return Err(TransportError::SubscriptionRejected(format!(
                "buffer block limit {limit} reached"
            )));
        }

        let sequence = connection.buffer_block_sequence.fetch_add(1, Ordering::AcqRel);
        let frame = Frame::new(
            ServerResponse::BufferBlock.code(),
            encode_buffer_block(sequence, runtime_index, body),
        );
        let frame_len = frame.wire_len() as u64;
        let stall = Duration::from_secs(self.inner.config.stall_timeout_sec);
        connection
            .outbound
            .send_timeout(frame, stall)
            .await
            .map_err(|_| TransportError::QueueStalled(stall))?;

        connection
            .unconfirmed_buffer_blocks
            .fetch_add(1, Ordering::AcqRel);
        self.inner
            .stats
            .total_bytes
            .fetch_add(frame_len, Ordering::Relaxed);
        Ok(sequence)
    }

    /// Send a user notification to every connected subscriber
    pub fn notify(&self, message: &str) {
        let connections: Vec<_> = self.inner.connections.read().values().cloned().collect();
        for connection in connections {
            let frame = Frame::new(ServerResponse::Notify.code(), message.as_bytes().to_vec());
            let _ = connection.outbound.try_send(frame);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    pub fn stats(&self) -> PublisherStatsSnapshot {
        PublisherStatsSnapshot {
            connections: self.connection_count(),
            total_bytes: self.inner.stats.total_bytes.load(Ordering::Relaxed),
            total_measurements: self.inner.stats.total_measurements.load(Ordering::Relaxed),
        }
    }

    /// Close every connection gracefully and release the listener
    pub async fn stop(&self) {
        let connections: Vec<_> = self.inner.connections.read().values().cloned().collect();
        for connection in &connections {
            let goodbye = Frame::new(
                ServerResponse::Failed.code(),
                encode_ack(ServerCommand::Connect, b"publisher shutting down"),
            );
            let _ = connection.outbound.try_send(goodbye);
        }

        // Give the writers a moment to flush the goodbyes
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        self.inner.cancel.cancel();
        for connection in &connections {
            connection.cancel.cancel();
        }
        self.inner.connections.write().clear();
        info!("Publisher stopped");
    }
}

async fn accept_loop(inner: Arc<PublisherInner>, listener: TcpListener) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, remote)) => {
                        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
                        debug!("connection {}: accepted from {}", id, remote);
                        connection::spawn(Arc::clone(&inner), id, socket, remote);
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
            _ = inner.cancel.cancelled() => break,
        }
    }
    debug!("accept loop exited");
}
