//! Cross-module round trips: cache, compact codec and compressor working
//! together the way the transport drives them

use uuid::Uuid;

use sttp_core::compact::CompactRecord;
use sttp_core::wire::{StringEncoding, WireReader};
use sttp_core::{CompactCodec, SignalIndexCache, StateFlags, Ticks, TsscDecoder, TsscEncoder};

#[test]
fn cache_resolves_what_the_compact_codec_carries() {
    let signals: Vec<Uuid> = (0..50).map(|_| Uuid::new_v4()).collect();
    let cache = SignalIndexCache::from_signals(signals.iter().copied());

    let codec = CompactCodec::default();
    let base = Ticks::now();
    let bases = [base, base];

    let mut wire = Vec::new();
    for (i, signal) in signals.iter().enumerate() {
        let index = cache.index_of(signal).expect("signal in cache");
        codec.encode(
            &mut wire,
            index,
            i as f64 * 0.5,
            Ticks(base.0 + i as u64),
            StateFlags::NORMAL,
            &bases,
            0,
        );
    }

    let mut reader = WireReader::new(&wire);
    for (i, signal) in signals.iter().enumerate() {
        let record: CompactRecord = codec.decode(&mut reader, &bases).expect("decode");
        assert_eq!(cache.signal_id(record.runtime_index), Some(*signal));
        assert_eq!(record.value, (i as f32 * 0.5) as f64);
        assert_eq!(record.timestamp, Ticks(base.0 + i as u64));
    }
    assert!(reader.is_empty());
}

#[test]
fn cache_replacement_with_compressor_reset_stays_in_sync() {
    // First subscription era
    let era1: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
    let cache1 = SignalIndexCache::from_signals(era1.iter().copied());
    let mut encoder = TsscEncoder::new();
    let mut decoder = TsscDecoder::new();
    let base = Ticks(640_000_000_000_000_000);

    for i in 0..200u64 {
        let signal = &era1[(i % 4) as usize];
        let index = cache1.index_of(signal).expect("era1 signal");
        encoder.add_measurement(index, Ticks(base.0 + i * 1000), StateFlags::NORMAL, i as f32);
    }
    let block = encoder.finish();
    decoder.set_block(&block).expect("era1 block");
    for i in 0..200u64 {
        let (index, _, _, value) = decoder.next_measurement().expect("decode").expect("value");
        assert_eq!(cache1.signal_id(index), Some(era1[(i % 4) as usize]));
        assert_eq!(value, i as f32);
    }

    // New cache: both ends reset, sequence restarts, indices remap
    let era2: Vec<Uuid> = (0..2).map(|_| Uuid::new_v4()).collect();
    let cache2 = SignalIndexCache::from_signals(era2.iter().copied());
    encoder.reset();
    decoder.reset();

    for i in 0..50u64 {
        let signal = &era2[(i % 2) as usize];
        let index = cache2.index_of(signal).expect("era2 signal");
        encoder.add_measurement(index, Ticks(base.0 + i * 2000), StateFlags::NORMAL, -(i as f32));
    }
    let block = encoder.finish();
    decoder.set_block(&block).expect("era2 block");
    for i in 0..50u64 {
        let (index, ts, _, value) = decoder.next_measurement().expect("decode").expect("value");
        assert_eq!(cache2.signal_id(index), Some(era2[(i % 2) as usize]));
        assert_eq!(ts, Ticks(base.0 + i * 2000));
        assert_eq!(value, -(i as f32));
    }
}

#[test]
fn cache_wire_image_survives_both_encodings() {
    let mut cache = SignalIndexCache::new();
    for i in 0..10u32 {
        cache
            .add_record(i, Uuid::new_v4(), format!("STATION:{i}"), u64::from(i) + 100)
            .expect("add");
    }

    for encoding in [StringEncoding::Utf8, StringEncoding::Utf16Le] {
        let wire = cache.encode(encoding);
        let decoded = SignalIndexCache::decode(&wire, encoding).expect("decode");
        for entry in cache.iter() {
            let round = decoded.entry(entry.index).expect("entry");
            assert_eq!(round, entry);
        }
    }
}
