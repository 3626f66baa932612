//! Response payload layouts shared by both engines

use bytes::BufMut;
use crc::{Crc, CRC_32_ISO_HDLC};

use sttp_core::wire::WireReader;
use sttp_core::{ServerCommand, Ticks};

use crate::error::{Result, TransportError};

/// CRC used for notification confirmation hashes
const NOTIFICATION_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// `DataPacket` payload: `[u8 flags][u32 count][measurement bytes]`
pub fn encode_data_packet(flags: u8, count: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + body.len());
    out.push(flags);
    out.put_u32(count);
    out.extend_from_slice(body);
    out
}

pub fn decode_data_packet(payload: &[u8]) -> Result<(u8, u32, &[u8])> {
    if payload.len() < 5 {
        return Err(TransportError::MalformedFrame(format!(
            "data packet of {} bytes is shorter than its header",
            payload.len()
        )));
    }
    let flags = payload[0];
    let count = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
    Ok((flags, count, &payload[5..]))
}

/// `UpdateBaseTimes` payload: `[u64 rollover][u64 base0][u64 base1]`
pub fn encode_base_times(rollover: Ticks, bases: &[Ticks; 2]) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    out.put_u64(rollover.0);
    out.put_u64(bases[0].0);
    out.put_u64(bases[1].0);
    out
}

pub fn decode_base_times(payload: &[u8]) -> Result<(Ticks, [Ticks; 2])> {
    let mut reader = WireReader::new(payload);
    let rollover = Ticks(reader.read_u64().map_err(TransportError::Codec)?);
    let base0 = Ticks(reader.read_u64().map_err(TransportError::Codec)?);
    let base1 = Ticks(reader.read_u64().map_err(TransportError::Codec)?);
    Ok((rollover, [base0, base1]))
}

/// `Succeeded`/`Failed` payload: `[u8 command][remaining bytes]`
pub fn encode_ack(command: ServerCommand, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(command.code());
    out.extend_from_slice(body);
    out
}

pub fn decode_ack(payload: &[u8]) -> Result<(ServerCommand, &[u8])> {
    if payload.is_empty() {
        return Err(TransportError::MalformedFrame(
            "empty acknowledgement payload".to_string(),
        ));
    }
    let command = ServerCommand::try_from(payload[0]).map_err(TransportError::Codec)?;
    Ok((command, &payload[1..]))
}

/// `BufferBlock` payload: `[u32 sequence][u16 runtime index][raw bytes]`
pub fn encode_buffer_block(sequence: u32, runtime_index: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + body.len());
    out.put_u32(sequence);
    out.put_u16(runtime_index as u16);
    out.extend_from_slice(body);
    out
}

pub fn decode_buffer_block(payload: &[u8]) -> Result<(u32, u32, &[u8])> {
    if payload.len() < 6 {
        return Err(TransportError::MalformedFrame(format!(
            "buffer block of {} bytes is shorter than its header",
            payload.len()
        )));
    }
    let sequence = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let runtime_index = u32::from(u16::from_be_bytes([payload[4], payload[5]]));
    Ok((sequence, runtime_index, &payload[6..]))
}

/// Confirmation hash echoed back for a received notification
pub fn notification_hash(message: &[u8]) -> u32 {
    NOTIFICATION_CRC.checksum(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_packet_round_trip() {
        let payload = encode_data_packet(0x0A, 3, &[1, 2, 3]);
        let (flags, count, body) = decode_data_packet(&payload).unwrap();
        assert_eq!((flags, count, body), (0x0A, 3, &[1u8, 2, 3][..]));
    }

    #[test]
    fn base_times_round_trip() {
        let bases = [Ticks(100), Ticks(200)];
        let payload = encode_base_times(Ticks(60_000), &bases);
        assert_eq!(
            decode_base_times(&payload).unwrap(),
            (Ticks(60_000), bases)
        );
    }

    #[test]
    fn ack_round_trip() {
        let payload = encode_ack(ServerCommand::Subscribe, b"3 signals");
        let (command, body) = decode_ack(&payload).unwrap();
        assert_eq!(command, ServerCommand::Subscribe);
        assert_eq!(body, b"3 signals");
    }

    #[test]
    fn buffer_block_round_trip() {
        let payload = encode_buffer_block(42, 7, b"opaque");
        let (sequence, index, body) = decode_buffer_block(&payload).unwrap();
        assert_eq!((sequence, index, body), (42, 7, &b"opaque"[..]));
    }

    #[test]
    fn notification_hash_is_stable() {
        let h1 = notification_hash(b"metadata updated");
        let h2 = notification_hash(b"metadata updated");
        assert_eq!(h1, h2);
        assert_ne!(h1, notification_hash(b"something else"));
    }
}
