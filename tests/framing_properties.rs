//! Property-based tests for stream framing
//!
//! A packet stream must decode to the same packets however it is split across
//! read completions, and the per-read bound must never lose a packet.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use packet_channel::buffer::DefaultAllocator;
use packet_channel::connection::PacketReader;
use packet_channel::core::framing::{ByteOrder, Frame, Framing};
use packet_channel::core::packet::RawPacket;
use proptest::prelude::*;
use std::sync::Arc;

fn framing_strategy() -> impl Strategy<Value = Framing> {
    (
        prop_oneof![Just(2usize), Just(4usize)],
        prop_oneof![Just(0usize), Just(1usize), Just(2usize), Just(4usize)],
        prop_oneof![Just(ByteOrder::BigEndian), Just(ByteOrder::LittleEndian)],
    )
        .prop_map(|(length, id, order)| Framing::new(length, id, order).unwrap())
}

fn bodies() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 1..20)
}

fn encode_all(framing: Framing, bodies: &[Vec<u8>]) -> Vec<u8> {
    let mut wire = BytesMut::new();
    for (i, body) in bodies.iter().enumerate() {
        let id = if framing.has_id() { (i % 200) as u32 } else { 0 };
        framing
            .encode(&RawPacket::new(id, body.clone()), &mut wire)
            .unwrap();
    }
    wire.to_vec()
}

fn reader(framing: Framing, max: usize) -> PacketReader {
    PacketReader::new(framing, max, Arc::new(DefaultAllocator::default()))
}

/// Feed `chunks` one completion at a time, draining limited cycles in between.
fn decode(framing: Framing, max: usize, chunks: &[&[u8]]) -> Vec<Frame> {
    let mut reader = reader(framing, max);
    let mut out = Vec::new();
    for chunk in chunks {
        let mut cycle = reader
            .on_read(chunk, |frame| {
                out.push(frame);
                Ok(())
            })
            .unwrap();
        while cycle.limited {
            cycle = reader
                .frame_buffered(|frame| {
                    out.push(frame);
                    Ok(())
                })
                .unwrap();
        }
    }
    assert_eq!(reader.carried_len(), 0);
    out
}

fn split_at_cuts<'a>(wire: &'a [u8], cuts: &[usize]) -> Vec<&'a [u8]> {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (wire.len() + 1)).collect();
    points.sort_unstable();
    points.dedup();

    let mut chunks = Vec::new();
    let mut start = 0;
    for point in points {
        if point > start {
            chunks.push(&wire[start..point]);
            start = point;
        }
    }
    if start < wire.len() {
        chunks.push(&wire[start..]);
    }
    chunks
}

proptest! {
    #[test]
    fn prop_fragmentation_is_invisible(
        framing in framing_strategy(),
        bodies in bodies(),
        cuts in prop::collection::vec(any::<usize>(), 0..40),
    ) {
        let wire = encode_all(framing, &bodies);
        let whole = decode(framing, usize::MAX, &[&wire]);
        let split = decode(framing, usize::MAX, &split_at_cuts(&wire, &cuts));

        prop_assert_eq!(whole.len(), bodies.len());
        prop_assert_eq!(&whole, &split);
        for (frame, body) in whole.iter().zip(&bodies) {
            prop_assert_eq!(&frame.body[..], &body[..]);
        }
    }
}

proptest! {
    #[test]
    fn prop_fairness_bound_loses_nothing(
        bodies in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..32), 1..50),
        max in 1usize..8,
    ) {
        let framing = Framing::length_prefixed();
        let wire = encode_all(framing, &bodies);
        let mut reader = reader(framing, max);

        let mut first = 0;
        let cycle = reader.on_read(&wire, |_| {
            first += 1;
            Ok(())
        }).unwrap();

        prop_assert_eq!(first, bodies.len().min(max));
        prop_assert_eq!(cycle.limited, bodies.len() > max);

        let all = decode(framing, max, &[&wire]);
        prop_assert_eq!(all.len(), bodies.len());
    }
}

proptest! {
    #[test]
    fn prop_garbage_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let framing = Framing::id_prefixed().with_max_packet_size(1024);
        let mut reader = reader(framing, 16);
        let _ = reader.on_read(&data, |_| Ok(()));
    }
}
