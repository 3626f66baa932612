//! Signal-ID byte order
//!
//! Signal IDs travel in Microsoft RPC byte order: the first three GUID fields
//! little-endian, the trailing eight bytes as-is. Kept bit-exact for interop
//! with other STTP implementations.

use uuid::Uuid;

/// Serialize a signal ID into its 16-byte wire representation
pub fn to_wire_bytes(id: Uuid) -> [u8; 16] {
    let (d1, d2, d3, d4) = id.as_fields();
    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&d1.to_le_bytes());
    out[4..6].copy_from_slice(&d2.to_le_bytes());
    out[6..8].copy_from_slice(&d3.to_le_bytes());
    out[8..16].copy_from_slice(d4);
    out
}

/// Reconstruct a signal ID from its 16-byte wire representation
pub fn from_wire_bytes(bytes: &[u8; 16]) -> Uuid {
    let d1 = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let d2 = u16::from_le_bytes([bytes[4], bytes[5]]);
    let d3 = u16::from_le_bytes([bytes[6], bytes[7]]);
    let mut d4 = [0u8; 8];
    d4.copy_from_slice(&bytes[8..16]);
    Uuid::from_fields(d1, d2, d3, &d4)
}
