//! Command-channel framing
//!
//! Every frame on the reliable channel is `[u32 length N][u8 code][N-1 bytes
//! payload]`, length counting the code byte. Oversize frames are a fatal
//! protocol violation, enforced in both directions before any allocation of
//! the offending size.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TransportError;

/// Default packet ceiling: 1.5 MB
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1_572_864;

/// One framed command or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(code: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }

    pub fn empty(code: u8) -> Self {
        Self {
            code,
            payload: Bytes::new(),
        }
    }

    /// Full wire length including the length prefix
    pub fn wire_len(&self) -> usize {
        4 + 1 + self.payload.len()
    }

    /// Serialize for a self-contained datagram
    pub fn to_datagram_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        out.put_u32(self.payload.len() as u32 + 1);
        out.push(self.code);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a self-contained datagram produced by [`to_datagram_bytes`](Self::to_datagram_bytes)
    pub fn from_datagram_bytes(data: &[u8]) -> Result<Self, TransportError> {
        if data.len() < 5 {
            return Err(TransportError::MalformedFrame(format!(
                "datagram of {} bytes is shorter than a frame header",
                data.len()
            )));
        }
        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if length == 0 || data.len() - 4 != length {
            return Err(TransportError::MalformedFrame(format!(
                "datagram length field {length} does not match {} available bytes",
                data.len() - 4
            )));
        }
        Ok(Frame {
            code: data[4],
            payload: Bytes::copy_from_slice(&data[5..]),
        })
    }
}

/// Length-prefixed frame codec with a packet-size ceiling
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_packet_size: usize,
}

impl FrameCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length == 0 {
            return Err(TransportError::MalformedFrame(
                "zero-length frame".to_string(),
            ));
        }
        if length > self.max_packet_size {
            return Err(TransportError::OversizePacket {
                length,
                max: self.max_packet_size,
            });
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let code = src[0];
        src.advance(1);
        let payload = src.split_to(length - 1).freeze();
        Ok(Some(Frame { code, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), TransportError> {
        let length = frame.payload.len() + 1;
        if length > self.max_packet_size {
            return Err(TransportError::OversizePacket {
                length,
                max: self.max_packet_size,
            });
        }
        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(frame.code);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

/// Writer half of a connection: serializes every frame onto the socket in
/// queue order, draining whatever is already queued when cancelled so
/// goodbyes still reach the peer.
pub(crate) async fn writer_pump(
    mut sink: tokio_util::codec::FramedWrite<tokio::net::tcp::OwnedWriteHalf, FrameCodec>,
    mut outbound: tokio::sync::mpsc::Receiver<Frame>,
    cancel: tokio_util::sync::CancellationToken,
) {
    use futures::SinkExt;

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if sink.send(frame).await.is_err() {
                        cancel.cancel();
                        break;
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => {
                while let Ok(frame) = outbound.try_recv() {
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = sink.flush().await;
}
