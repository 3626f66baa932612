//! STTP transport engines
//!
//! The wire side of the protocol: command-channel framing, the publisher
//! engine with its per-connection routing, the subscriber engine with its
//! lazy measurement stream, the optional encrypted UDP data channel, and the
//! configuration records both engines consume.

pub mod callbacks;
pub mod cipher;
pub mod compression;
pub mod config;
pub mod error;
pub mod framing;
pub mod packets;
pub mod publisher;
pub mod subscriber;
pub mod subscription;

pub use callbacks::{NullListener, PublisherListener, SubscriberListener};
pub use config::{PublisherConfig, ReconnectBackoff, SubscriberConfig, UdpDataChannel};
pub use error::{ErrorKind, TransportError};
pub use framing::{Frame, FrameCodec, DEFAULT_MAX_PACKET_SIZE};
pub use publisher::DataPublisher;
pub use subscriber::{DataSubscriber, MeasurementReader};
pub use subscription::SubscriptionInfo;
