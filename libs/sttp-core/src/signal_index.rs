//! Signal-index cache
//!
//! Per-connection bijection between compact 32-bit runtime indices and
//! 128-bit signal IDs, with optional per-signal source metadata. A publisher
//! rebuilds the cache on every subscription change; the subscriber swaps its
//! active cache atomically on receipt.

use ahash::AHashMap;
use bytes::BufMut;
use uuid::Uuid;

use crate::error::{CodecError, Result};
use crate::wire::{put_guid, put_string, StringEncoding, WireReader};

/// One cache record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Compact wire handle for the signal
    pub index: u32,
    /// Signal identity
    pub signal_id: Uuid,
    /// Source measurement table or device name, may be empty
    pub source: String,
    /// Source-scoped numeric ID, zero when unused
    pub id: u64,
}

/// Bijective runtime-index ↔ signal-ID map
#[derive(Debug, Clone, Default)]
pub struct SignalIndexCache {
    entries: Vec<CacheEntry>,
    by_index: AHashMap<u32, usize>,
    by_signal: AHashMap<Uuid, u32>,
}

impl SignalIndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a cache with contiguous indices over `signal_ids` in iteration order
    pub fn from_signals<I>(signal_ids: I) -> Self
    where
        I: IntoIterator<Item = Uuid>,
    {
        let mut cache = Self::new();
        for (index, signal_id) in signal_ids.into_iter().enumerate() {
            // Indices assigned here are fresh and contiguous, no collision possible
            let _ = cache.add_record(index as u32, signal_id, String::new(), 0);
        }
        cache
    }

    /// Insert a record; rejects duplicate runtime indices
    pub fn add_record(&mut self, index: u32, signal_id: Uuid, source: String, id: u64) -> Result<()> {
        if self.by_index.contains_key(&index) {
            return Err(CodecError::DuplicateIndex(index));
        }
        self.by_index.insert(index, self.entries.len());
        self.by_signal.insert(signal_id, index);
        self.entries.push(CacheEntry {
            index,
            signal_id,
            source,
            id,
        });
        Ok(())
    }

    pub fn signal_id(&self, index: u32) -> Option<Uuid> {
        self.by_index
            .get(&index)
            .map(|&pos| self.entries[pos].signal_id)
    }

    pub fn index_of(&self, signal_id: &Uuid) -> Option<u32> {
        self.by_signal.get(signal_id).copied()
    }

    pub fn entry(&self, index: u32) -> Option<&CacheEntry> {
        self.by_index.get(&index).map(|&pos| &self.entries[pos])
    }

    pub fn contains_signal(&self, signal_id: &Uuid) -> bool {
        self.by_signal.contains_key(signal_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.iter()
    }

    pub fn signal_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.entries.iter().map(|e| e.signal_id)
    }

    /// Wire format: `[u32 binaryLength][u32 referenceCount]` then per entry
    /// `[u32 sourceIndex][u16 runtimeIndex][16-byte signalID][u32 sourceLen]
    /// [source bytes][u64 id]`.
    pub fn encode(&self, encoding: StringEncoding) -> Vec<u8> {
        let mut body = Vec::with_capacity(8 + self.entries.len() * 40);
        body.put_u32(self.entries.len() as u32);

        for (source_index, entry) in self.entries.iter().enumerate() {
            body.put_u32(source_index as u32);
            body.put_u16(entry.index as u16);
            put_guid(&mut body, entry.signal_id);
            put_string(&mut body, &entry.source, encoding);
            body.put_u64(entry.id);
        }

        let mut out = Vec::with_capacity(body.len() + 4);
        out.put_u32(body.len() as u32);
        out.extend_from_slice(&body);
        out
    }

    pub fn decode(buf: &[u8], encoding: StringEncoding) -> Result<Self> {
        let mut reader = WireReader::new(buf);
        let binary_length = reader.read_u32()? as usize;
        if reader.remaining() < binary_length {
            return Err(CodecError::BufferUnderrun {
                needed: binary_length,
                remaining: reader.remaining(),
            });
        }

        let reference_count = reader.read_u32()?;
        let mut cache = Self::new();

        for _ in 0..reference_count {
            let _source_index = reader.read_u32()?;
            let runtime_index = u32::from(reader.read_u16()?);
            let signal_id = reader.read_guid()?;
            let source = reader.read_string(encoding)?;
            let id = reader.read_u64()?;
            cache.add_record(runtime_index, signal_id, source, id)?;
        }

        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cache() -> SignalIndexCache {
        let mut cache = SignalIndexCache::new();
        cache
            .add_record(0, Uuid::new_v4(), "PPA:1".to_string(), 1)
            .unwrap();
        cache
            .add_record(1, Uuid::new_v4(), "PPA:2".to_string(), 2)
            .unwrap();
        cache.add_record(2, Uuid::new_v4(), String::new(), 0).unwrap();
        cache
    }

    #[test]
    fn mapping_is_bijective() {
        let cache = sample_cache();
        for entry in cache.iter() {
            assert_eq!(cache.index_of(&entry.signal_id), Some(entry.index));
            assert_eq!(cache.signal_id(entry.index), Some(entry.signal_id));
        }
        assert_eq!(cache.signal_id(99), None);
    }

    #[test]
    fn duplicate_index_is_rejected() {
        let mut cache = sample_cache();
        let err = cache.add_record(1, Uuid::new_v4(), String::new(), 0);
        assert!(matches!(err, Err(CodecError::DuplicateIndex(1))));
    }

    #[test]
    fn serialization_round_trip_is_bit_identical() {
        let cache = sample_cache();
        for encoding in [StringEncoding::Utf8, StringEncoding::Utf16Le] {
            let wire = cache.encode(encoding);
            let decoded = SignalIndexCache::decode(&wire, encoding).unwrap();
            assert_eq!(decoded.len(), cache.len());
            for (a, b) in cache.iter().zip(decoded.iter()) {
                assert_eq!(a, b);
            }
            assert_eq!(decoded.encode(encoding), wire);
        }
    }

    #[test]
    fn from_signals_assigns_contiguous_indices() {
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        let cache = SignalIndexCache::from_signals(ids.clone());
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(cache.index_of(id), Some(i as u32));
        }
    }

    #[test]
    fn truncated_payload_is_an_underrun() {
        let wire = sample_cache().encode(StringEncoding::Utf8);
        let err = SignalIndexCache::decode(&wire[..wire.len() - 3], StringEncoding::Utf8);
        assert!(matches!(err, Err(CodecError::BufferUnderrun { .. })));
    }
}
