//! Command and response codes, operational modes
//!
//! One byte after the frame length identifies the payload. Codes at or above
//! 0x80 flow publisher → subscriber; the rest flow subscriber → publisher.

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::wire::StringEncoding;

/// Commands sent from a subscriber to a publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerCommand {
    /// No-op; doubles as the subscriber's keepalive ping
    Connect,
    MetadataRefresh,
    Subscribe,
    Unsubscribe,
    RotateCipherKeys,
    UpdateProcessingInterval,
    DefineOperationalModes,
    ConfirmNotification,
    ConfirmBufferBlock,
    ConfirmUpdateCipherKeys,
    /// Application-defined command (0xD0..=0xFF)
    UserCommand(u8),
}

impl ServerCommand {
    pub fn code(self) -> u8 {
        match self {
            ServerCommand::Connect => 0x00,
            ServerCommand::MetadataRefresh => 0x01,
            ServerCommand::Subscribe => 0x02,
            ServerCommand::Unsubscribe => 0x03,
            ServerCommand::RotateCipherKeys => 0x04,
            ServerCommand::UpdateProcessingInterval => 0x05,
            ServerCommand::DefineOperationalModes => 0x06,
            ServerCommand::ConfirmNotification => 0x07,
            ServerCommand::ConfirmBufferBlock => 0x08,
            ServerCommand::ConfirmUpdateCipherKeys => 0x09,
            ServerCommand::UserCommand(code) => code,
        }
    }
}

impl TryFrom<u8> for ServerCommand {
    type Error = CodecError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x00 => Ok(ServerCommand::Connect),
            0x01 => Ok(ServerCommand::MetadataRefresh),
            0x02 => Ok(ServerCommand::Subscribe),
            0x03 => Ok(ServerCommand::Unsubscribe),
            0x04 => Ok(ServerCommand::RotateCipherKeys),
            0x05 => Ok(ServerCommand::UpdateProcessingInterval),
            0x06 => Ok(ServerCommand::DefineOperationalModes),
            0x07 => Ok(ServerCommand::ConfirmNotification),
            0x08 => Ok(ServerCommand::ConfirmBufferBlock),
            0x09 => Ok(ServerCommand::ConfirmUpdateCipherKeys),
            0xD0..=0xFF => Ok(ServerCommand::UserCommand(code)),
            other => Err(CodecError::UnknownCommand(other)),
        }
    }
}

impl std::fmt::Display for ServerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerCommand::UserCommand(code) => write!(f, "UserCommand(0x{:02X})", code),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Responses and notifications sent from a publisher to a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerResponse {
    Succeeded,
    Failed,
    DataPacket,
    UpdateSignalIndexCache,
    UpdateBaseTimes,
    UpdateCipherKeys,
    DataStartTime,
    ProcessingComplete,
    BufferBlock,
    Notify,
    ConfigurationChanged,
    /// Application-defined response (0xE0..=0xFF)
    UserResponse(u8),
}

impl ServerResponse {
    pub fn code(self) -> u8 {
        match self {
            ServerResponse::Succeeded => 0x80,
            ServerResponse::Failed => 0x81,
            ServerResponse::DataPacket => 0x82,
            ServerResponse::UpdateSignalIndexCache => 0x83,
            ServerResponse::UpdateBaseTimes => 0x84,
            ServerResponse::UpdateCipherKeys => 0x85,
            ServerResponse::DataStartTime => 0x86,
            ServerResponse::ProcessingComplete => 0x87,
            ServerResponse::BufferBlock => 0x88,
            ServerResponse::Notify => 0x89,
            ServerResponse::ConfigurationChanged => 0x8A,
            ServerResponse::UserResponse(code) => code,
        }
    }
}

impl TryFrom<u8> for ServerResponse {
    type Error = CodecError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x80 => Ok(ServerResponse::Succeeded),
            0x81 => Ok(ServerResponse::Failed),
            0x82 => Ok(ServerResponse::DataPacket),
            0x83 => Ok(ServerResponse::UpdateSignalIndexCache),
            0x84 => Ok(ServerResponse::UpdateBaseTimes),
            0x85 => Ok(ServerResponse::UpdateCipherKeys),
            0x86 => Ok(ServerResponse::DataStartTime),
            0x87 => Ok(ServerResponse::ProcessingComplete),
            0x88 => Ok(ServerResponse::BufferBlock),
            0x89 => Ok(ServerResponse::Notify),
            0x8A => Ok(ServerResponse::ConfigurationChanged),
            0xE0..=0xFF => Ok(ServerResponse::UserResponse(code)),
            other => Err(CodecError::UnknownResponse(other)),
        }
    }
}

/// Negotiated connection parameters, immutable after `DefineOperationalModes`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationalModes(pub u32);

impl OperationalModes {
    /// Protocol version carried in the low byte
    pub const VERSION_MASK: u32 = 0x0000_00FF;
    /// Current protocol version
    pub const CURRENT_VERSION: u32 = 1;

    /// String encoding selector
    pub const ENCODING_MASK: u32 = 0x0000_0300;
    pub const ENCODING_UTF8: u32 = 0x0000_0000;
    pub const ENCODING_UTF16LE: u32 = 0x0000_0100;

    /// Metadata and cache exchange use the common serialization format
    pub const USE_COMMON_SERIALIZATION: u32 = 0x0100_0000;
    /// Publisher may forward metadata learned from external sources
    pub const RECEIVE_EXTERNAL_METADATA: u32 = 0x0200_0000;
    /// Measurement payloads use the stateful stream compressor
    pub const COMPRESS_PAYLOAD_DATA: u32 = 0x2000_0000;
    /// Signal-index cache payloads are gzipped
    pub const COMPRESS_SIGNAL_INDEX_CACHE: u32 = 0x4000_0000;
    /// Metadata payloads are gzipped
    pub const COMPRESS_METADATA: u32 = 0x8000_0000;

    pub fn version(self) -> u32 {
        self.0 & Self::VERSION_MASK
    }

    pub fn string_encoding(self) -> Result<StringEncoding, CodecError> {
        match self.0 & Self::ENCODING_MASK {
            Self::ENCODING_UTF8 => Ok(StringEncoding::Utf8),
            Self::ENCODING_UTF16LE => Ok(StringEncoding::Utf16Le),
            other => Err(CodecError::UnsupportedEncoding(other)),
        }
    }

    pub fn compress_payload_data(self) -> bool {
        self.0 & Self::COMPRESS_PAYLOAD_DATA != 0
    }

    pub fn compress_signal_index_cache(self) -> bool {
        self.0 & Self::COMPRESS_SIGNAL_INDEX_CACHE != 0
    }

    pub fn compress_metadata(self) -> bool {
        self.0 & Self::COMPRESS_METADATA != 0
    }

    pub fn receive_external_metadata(self) -> bool {
        self.0 & Self::RECEIVE_EXTERNAL_METADATA != 0
    }

    pub fn with(self, flags: u32) -> Self {
        OperationalModes(self.0 | flags)
    }
}

impl Default for OperationalModes {
    fn default() -> Self {
        OperationalModes(
            Self::CURRENT_VERSION | Self::ENCODING_UTF8 | Self::USE_COMMON_SERIALIZATION,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes_round_trip() {
        for code in [0x00u8, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0xD0, 0xFF] {
            let cmd = ServerCommand::try_from(code).unwrap();
            assert_eq!(cmd.code(), code);
        }
        assert!(ServerCommand::try_from(0x42).is_err());
    }

    #[test]
    fn response_codes_round_trip() {
        for code in [0x80u8, 0x81, 0x82, 0x83, 0x84, 0x85, 0x86, 0x87, 0x88, 0x89, 0x8A, 0xE0] {
            let resp = ServerResponse::try_from(code).unwrap();
            assert_eq!(resp.code(), code);
        }
        assert!(ServerResponse::try_from(0x10).is_err());
    }

    #[test]
    fn default_modes_negotiate_version_one_utf8() {
        let modes = OperationalModes::default();
        assert_eq!(modes.version(), 1);
        assert_eq!(modes.string_encoding().unwrap(), StringEncoding::Utf8);
        assert!(!modes.compress_payload_data());

        let compressed = modes.with(OperationalModes::COMPRESS_PAYLOAD_DATA);
        assert!(compressed.compress_payload_data());
        assert_eq!(compressed.version(), 1);
    }

    #[test]
    fn utf16_encoding_bit() {
        let modes = OperationalModes::default().with(OperationalModes::ENCODING_UTF16LE);
        assert_eq!(modes.string_encoding().unwrap(), StringEncoding::Utf16Le);
    }
}
