//! Engine configuration records
//!
//! Plain serde structs with spec defaults; the CLI loads them from YAML files
//! and `STTP_`-prefixed environment variables through figment.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use sttp_core::OperationalModes;

use crate::error::{Result, TransportError};
use crate::framing::DEFAULT_MAX_PACKET_SIZE;

/// Exponential backoff with jitter for subscriber reconnects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectBackoff {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub factor: f64,
    /// Fractional jitter applied to each delay (0.25 = ±25%)
    pub jitter: f64,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 30_000,
            factor: 2.0,
            jitter: 0.25,
        }
    }
}

impl ReconnectBackoff {
    /// Delay before the given retry attempt (0-based), jittered
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.base_ms as f64 * self.factor.powi(attempt as i32);
        let capped = raw.min(self.cap_ms as f64);
        let jitter_span = capped * self.jitter;
        let jittered = capped - jitter_span + rand::random::<f64>() * 2.0 * jitter_span;
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

/// UDP data-channel request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UdpDataChannel {
    /// Local port the subscriber listens on; 0 picks an ephemeral port
    pub port: u16,
    /// Local interface address, defaults to all interfaces
    pub interface: Option<String>,
    /// Encrypt datagrams with rotating connection keys
    pub encrypt: bool,
}

/// Subscriber-side engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Negotiated connection modes
    pub operational_modes: u32,
    /// Compact time offsets count milliseconds instead of ticks
    pub use_millisecond_resolution: bool,
    /// Request the stateful payload compressor
    pub compress_payload_data: bool,
    /// Gzip metadata payloads
    pub compress_metadata: bool,
    /// Gzip signal-index cache payloads
    pub compress_signal_index_cache: bool,
    /// Request 64-bit values in the compact format
    pub double_precision: bool,
    pub keepalive_timeout_sec: u32,
    pub auto_reconnect: bool,
    pub reconnect_backoff: ReconnectBackoff,
    pub udp_data_channel: Option<UdpDataChannel>,
    pub max_packet_size: u32,
    /// Capacity of the in-memory measurement queue; full queue blocks the reader
    pub measurement_queue_size: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            operational_modes: OperationalModes::default().0,
            use_millisecond_resolution: false,
            compress_payload_data: false,
            compress_metadata: false,
            compress_signal_index_cache: false,
            double_precision: false,
            keepalive_timeout_sec: 30,
            auto_reconnect: false,
            reconnect_backoff: ReconnectBackoff::default(),
            udp_data_channel: None,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE as u32,
            measurement_queue_size: 4096,
        }
    }
}

impl SubscriberConfig {
    /// Operational modes with the compression switches folded in
    pub fn effective_modes(&self) -> OperationalModes {
        let mut modes = OperationalModes(self.operational_modes);
        if self.compress_payload_data {
            modes = modes.with(OperationalModes::COMPRESS_PAYLOAD_DATA);
        }
        if self.compress_metadata {
            modes = modes.with(OperationalModes::COMPRESS_METADATA);
        }
        if self.compress_signal_index_cache {
            modes = modes.with(OperationalModes::COMPRESS_SIGNAL_INDEX_CACHE);
        }
        modes
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        load(path)
    }
}

/// Publisher-side engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub keepalive_timeout_sec: u32,
    pub max_packet_size: u32,
    /// Flush interval for per-connection measurement batches
    pub publish_interval_ms: u64,
    /// Flush early once a pending batch reaches this size
    pub max_batch_bytes: usize,
    /// Close a connection whose outbound queue stalls this long
    pub stall_timeout_sec: u64,
    /// Close a connection that leaves a cipher rotation unacknowledged
    pub cipher_ack_timeout_sec: u64,
    /// Refresh period for the rotating shared base times
    pub base_time_rotation_sec: u64,
    /// Outbound frame queue depth per connection
    pub outbound_queue_size: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            keepalive_timeout_sec: 30,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE as u32,
            publish_interval_ms: 33,
            max_batch_bytes: 32 * 1024,
            stall_timeout_sec: 5,
            cipher_ack_timeout_sec: 5,
            base_time_rotation_sec: 60,
            outbound_queue_size: 256,
        }
    }
}

impl PublisherConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        load(path)
    }
}

fn load<T>(path: impl AsRef<Path>) -> Result<T>
where
    T: Default + Serialize + for<'de> Deserialize<'de>,
{
    Figment::from(Serialized::defaults(T::default()))
        .merge(Yaml::file(path.as_ref()))
        .merge(Env::prefixed("STTP_"))
        .extract()
        .map_err(|e| TransportError::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn backoff_is_capped_and_jittered() {
        let backoff = ReconnectBackoff::default();
        for attempt in 0..12 {
            let delay = backoff.delay(attempt).as_millis() as f64;
            assert!(delay <= 30_000.0 * 1.25 + 1.0, "attempt {attempt}: {delay}");
        }
        // First attempt centers on base_ms
        let first = backoff.delay(0).as_millis() as f64;
        assert!((750.0..=1250.0).contains(&first), "{first}");
    }

    #[test]
    fn yaml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").expect("tempfile");
        writeln!(
            file,
            "keepalive_timeout_sec: 10\ncompress_payload_data: true"
        )
        .expect("write");

        let config = SubscriberConfig::from_yaml_file(file.path()).expect("load");
        assert_eq!(config.keepalive_timeout_sec, 10);
        assert!(config.compress_payload_data);
        // Untouched fields keep their defaults
        assert_eq!(config.max_packet_size, DEFAULT_MAX_PACKET_SIZE as u32);
        assert!(config.effective_modes().compress_payload_data());
    }
}
