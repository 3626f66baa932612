//! User callback contracts
//!
//! Implementers override what they need; every method has a no-op default.
//! Dispatch is serialized per connection, so a handler never observes
//! overlapping calls for the same connection.

use std::net::SocketAddr;

use sttp_core::{DataSet, Ticks};

use crate::error::ErrorKind;

/// Events surfaced by the subscriber engine
pub trait SubscriberListener: Send + Sync + 'static {
    fn connection_established(&self, _remote: SocketAddr) {}
    fn connection_terminated(&self) {}
    fn subscription_confirmed(&self, _message: &str) {}
    fn status_message(&self, _message: &str) {}
    fn error_message(&self, _kind: ErrorKind, _message: &str) {}
    fn metadata_received(&self, _dataset: &DataSet) {}
    fn data_start_time(&self, _timestamp: Ticks) {}
    fn configuration_changed(&self) {}
    fn processing_complete(&self, _message: &str) {}
    fn notification_received(&self, _message: &str) {}
    fn buffer_block_received(&self, _sequence: u32, _payload: &[u8]) {}
    fn cipher_keys_updated(&self, _active_index: u8) {}
}

/// Events surfaced by the publisher engine
pub trait PublisherListener: Send + Sync + 'static {
    fn connection_established(&self, _connection_id: u64, _remote: SocketAddr) {}
    fn connection_terminated(&self, _connection_id: u64) {}
    fn subscribed(&self, _connection_id: u64, _signal_count: usize) {}
    fn unsubscribed(&self, _connection_id: u64) {}
    fn status_message(&self, _connection_id: u64, _message: &str) {}
    fn error_message(&self, _connection_id: u64, _kind: ErrorKind, _message: &str) {}
    fn processing_interval_changed(&self, _connection_id: u64, _interval_ms: i32) {}
}

/// Default listener that ignores everything
pub struct NullListener;

impl SubscriberListener for NullListener {}
impl PublisherListener for NullListener {}
