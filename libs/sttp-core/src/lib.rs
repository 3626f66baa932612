//! STTP protocol core
//!
//! Data model and codecs for the streaming telemetry transport protocol:
//! the tick time model, signal identities and their wire byte order, quality
//! flags, the signal-index cache, the compact measurement codec, the stateful
//! stream compressor, command/response codes with operational modes, and the
//! opaque metadata tables subscriptions are resolved against.
//!
//! Everything here is transport-agnostic; the engines that move these bytes
//! over sockets live in `sttp-transport`.

pub mod commands;
pub mod compact;
pub mod dataset;
pub mod error;
pub mod flags;
pub mod guid;
pub mod measurement;
pub mod signal_index;
pub mod time;
pub mod tssc;
pub mod wire;

pub use commands::{OperationalModes, ServerCommand, ServerResponse};
pub use compact::{CompactCodec, CompactRecord};
pub use dataset::{DataSet, DataTable, FilterExpression};
pub use error::CodecError;
pub use flags::StateFlags;
pub use measurement::Measurement;
pub use signal_index::SignalIndexCache;
pub use time::Ticks;
pub use tssc::{TsscDecoder, TsscEncoder};
pub use wire::StringEncoding;
