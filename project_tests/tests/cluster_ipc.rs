//! Cluster message protocol scenarios: fragmentation and reassembly.

use proptest::prelude::*;
use wharf::cluster::{Assembler, Mode, Splitter};

#[test]
fn ten_kilobyte_record_fragments_exactly_as_specified() {
    let mut splitter = Splitter::new(31337);
    let record: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let frames = splitter.split(&record);

    let modes: Vec<Mode> = frames.iter().map(|f| f.header.mode).collect();
    assert_eq!(modes, vec![Mode::Begin, Mode::Continue, Mode::End]);
    let sizes: Vec<u64> = frames.iter().map(|f| f.header.bytes).collect();
    assert_eq!(sizes, vec![4096, 4096, 1808]);

    let mut assembler = Assembler::new();
    let mut deliveries = Vec::new();
    for frame in frames {
        deliveries.extend(assembler.push(frame));
    }
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].data, record);
}

proptest! {
    // Splitting then reassembling returns the record byte for byte, for any
    // record length and chunk size; per-sender index order survives any
    // chunk-level interleaving of two senders.
    #[test]
    fn split_then_reassemble_is_identity(
        record in proptest::collection::vec(any::<u8>(), 0..20_000),
        chunk in 1usize..6000,
    ) {
        let mut splitter = Splitter::new(1);
        splitter.chunk_size(chunk);
        let frames = splitter.split(&record);
        let mut assembler = Assembler::new();
        let mut out = Vec::new();
        for frame in frames {
            if let Some(delivery) = assembler.push(frame) {
                out.push(delivery);
            }
        }
        prop_assert_eq!(out.len(), 1);
        prop_assert_eq!(&out[0].data, &record);
    }

    #[test]
    fn interleaved_senders_preserve_per_sender_order(
        records_a in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..9000), 1..4),
        records_b in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..9000), 1..4),
    ) {
        let mut alice = Splitter::new(100);
        let mut bob = Splitter::new(200);
        let mut frames_a: Vec<_> = records_a.iter().flat_map(|r| alice.split(r)).collect();
        let mut frames_b: Vec<_> = records_b.iter().flat_map(|r| bob.split(r)).collect();

        // Round-robin interleave without reordering either side.
        let mut assembler = Assembler::new();
        let mut got_a = Vec::new();
        let mut got_b = Vec::new();
        frames_a.reverse();
        frames_b.reverse();
        while !frames_a.is_empty() || !frames_b.is_empty() {
            for frames in [&mut frames_a, &mut frames_b] {
                if let Some(frame) = frames.pop() {
                    if let Some(delivery) = assembler.push(frame) {
                        match delivery.pid {
                            100 => got_a.push(delivery.data),
                            200 => got_b.push(delivery.data),
                            _ => unreachable!(),
                        }
                    }
                }
            }
        }
        prop_assert_eq!(got_a, records_a);
        prop_assert_eq!(got_b, records_b);
    }
}
