//! Transport error taxonomy
//!
//! Five stable kinds drive user-visible handling: protocol and codec errors
//! are fatal to the connection, subscription errors leave it intact,
//! transport errors may trigger reconnection, and resource exhaustion closes
//! only the offending connection.

use thiserror::Error;

use sttp_core::CodecError;

/// Stable error-kind tag surfaced through the error callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed frame, unknown command, oversize packet. Fatal.
    Protocol,
    /// Bad filter expression or mode combination. Connection survives.
    Subscription,
    /// Compression desync, unknown version, bad index. Fatal on both ends.
    Codec,
    /// Socket failure or keepalive expiry. Fatal, reconnectable.
    Transport,
    /// Stalled outbound queue or memory pressure. Offender is closed.
    ResourceExhaustion,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            ErrorKind::Protocol => "protocol",
            ErrorKind::Subscription => "subscription",
            ErrorKind::Codec => "codec",
            ErrorKind::Transport => "transport",
            ErrorKind::ResourceExhaustion => "resource-exhaustion",
        };
        write!(f, "{tag}")
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {length} bytes exceeds the {max} byte packet limit")]
    OversizePacket { length: usize, max: usize },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("command 0x{command:02X} not valid in state {state}")]
    UnexpectedCommand { command: u8, state: &'static str },

    #[error("subscription rejected: {0}")]
    SubscriptionRejected(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("codec failure: {0}")]
    Codec(#[from] CodecError),

    #[error("peer reported failure for {command}: {reason}")]
    PeerFailure { command: String, reason: String },

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("keepalive expired after {0:?}")]
    KeepaliveExpired(std::time::Duration),

    #[error("cipher key rotation was not acknowledged within {0:?}")]
    CipherAckTimeout(std::time::Duration),

    #[error("data channel decryption failed")]
    DecryptFailed,

    #[error("outbound queue stalled for {0:?}")]
    QueueStalled(std::time::Duration),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl TransportError {
    /// Classify into the user-visible taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::OversizePacket { .. }
            | TransportError::MalformedFrame(_)
            | TransportError::UnexpectedCommand { .. } => ErrorKind::Protocol,

            TransportError::SubscriptionRejected(_) | TransportError::Config(_) => {
                ErrorKind::Subscription
            }

            TransportError::Codec(source) => match source {
                CodecError::InvalidFilter(_)
                | CodecError::UnknownTable(_)
                | CodecError::UnknownColumn(_) => ErrorKind::Subscription,
                CodecError::UnknownCommand(_) | CodecError::UnknownResponse(_) => {
                    ErrorKind::Protocol
                }
                _ => ErrorKind::Codec,
            },

            TransportError::DecryptFailed => ErrorKind::Codec,

            TransportError::Io(_)
            | TransportError::NotConnected
            | TransportError::ConnectionClosed
            | TransportError::KeepaliveExpired(_)
            | TransportError::CipherAckTimeout(_)
            | TransportError::PeerFailure { .. }
            | TransportError::Timeout(_) => ErrorKind::Transport,

            TransportError::QueueStalled(_) => ErrorKind::ResourceExhaustion,
        }
    }

    /// Whether the connection must be torn down
    pub fn is_fatal(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Subscription)
    }
}

/// Convenience result alias for the transport layer
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_matches_fatality() {
        let stall = TransportError::QueueStalled(std::time::Duration::from_secs(5));
        assert_eq!(stall.kind(), ErrorKind::ResourceExhaustion);
        assert!(stall.is_fatal());

        let rejected = TransportError::SubscriptionRejected("bad filter".to_string());
        assert_eq!(rejected.kind(), ErrorKind::Subscription);
        assert!(!rejected.is_fatal());

        let filter = TransportError::Codec(CodecError::UnknownTable("x".to_string()));
        assert_eq!(filter.kind(), ErrorKind::Subscription);

        let desync = TransportError::Codec(CodecError::SequenceMismatch {
            expected: 1,
            actual: 3,
        });
        assert_eq!(desync.kind(), ErrorKind::Codec);
        assert!(desync.is_fatal());
    }
}
