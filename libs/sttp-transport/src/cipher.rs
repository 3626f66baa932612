//! Data-channel confidentiality
//!
//! The command channel stays clear; only UDP data packets are sealed. A
//! connection carries two AES-256-GCM keys selected by one header bit, so
//! packets sealed under the previous key remain readable through a rotation.
//! Rotation regenerates the incoming slot and flips the selector once the
//! subscriber acknowledges.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use bytes::BufMut;

use sttp_core::wire::WireReader;

use crate::error::{Result, TransportError};

/// Datagram header byte for an unencrypted frame
pub const PLAIN_HEADER: u8 = 0x00;
/// Header bit marking an encrypted datagram; bit 0 selects the key slot
pub const ENCRYPTED_FLAG: u8 = 0x80;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Two-slot symmetric key set for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherKeys {
    /// Key slot selected by the datagram header bit
    pub active: u8,
    slots: [Vec<u8>; 2],
}

impl CipherKeys {
    /// Fresh material in both slots, slot 0 active
    pub fn generate() -> Self {
        Self {
            active: 0,
            slots: [Self::fresh_key(), Self::fresh_key()],
        }
    }

    /// Rotation: regenerate the inactive slot and make it active. The old
    /// active slot stays intact for datagrams still in flight.
    pub fn rotated(&self) -> Self {
        let next = self.active ^ 1;
        let mut slots = self.slots.clone();
        slots[usize::from(next)] = Self::fresh_key();
        Self { active: next, slots }
    }

    fn fresh_key() -> Vec<u8> {
        Aes256Gcm::generate_key(OsRng).to_vec()
    }

    /// `UpdateCipherKeys` payload: `[u8 active][u32 len][slot0][u32 len][slot1]`
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 2 * (4 + KEY_LEN));
        out.push(self.active);
        for slot in &self.slots {
            out.put_u32(slot.len() as u32);
            out.extend_from_slice(slot);
        }
        out
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(payload);
        let active = reader.read_u8().map_err(TransportError::Codec)? & 1;
        let mut slots: [Vec<u8>; 2] = [Vec::new(), Vec::new()];
        for slot in &mut slots {
            let len = reader.read_u32().map_err(TransportError::Codec)? as usize;
            if len != KEY_LEN {
                return Err(TransportError::MalformedFrame(format!(
                    "cipher key of {len} bytes, expected {KEY_LEN}"
                )));
            }
            *slot = reader
                .read_bytes(len)
                .map_err(TransportError::Codec)?
                .to_vec();
        }
        Ok(Self { active, slots })
    }

    fn cipher(&self, selector: u8) -> Result<Aes256Gcm> {
        let key = &self.slots[usize::from(selector & 1)];
        Aes256Gcm::new_from_slice(key).map_err(|_| TransportError::DecryptFailed)
    }

    /// Seal a frame under the active key: `[header][nonce][ciphertext]`
    pub fn seal(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher(self.active)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, frame)
            .map_err(|_| TransportError::DecryptFailed)?;

        let mut out = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        out.push(ENCRYPTED_FLAG | self.active);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a sealed datagram, returning the key selector and the frame bytes
    pub fn open(&self, datagram: &[u8]) -> Result<(u8, Vec<u8>)> {
        if datagram.len() < 1 + NONCE_LEN + 1 {
            return Err(TransportError::MalformedFrame(
                "encrypted datagram too short".to_string(),
            ));
        }
        let header = datagram[0];
        if header & ENCRYPTED_FLAG == 0 {
            return Err(TransportError::MalformedFrame(
                "datagram is not encrypted".to_string(),
            ));
        }
        let selector = header & 1;
        let cipher = self.cipher(selector)?;
        let nonce = Nonce::from_slice(&datagram[1..1 + NONCE_LEN]);
        let frame = cipher
            .decrypt(nonce, &datagram[1 + NONCE_LEN..])
            .map_err(|_| TransportError::DecryptFailed)?;
        Ok((selector, frame))
    }
}
