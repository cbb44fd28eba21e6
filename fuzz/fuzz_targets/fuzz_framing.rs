#![no_main]

use libfuzzer_sys::fuzz_target;
use packet_channel::buffer::DefaultAllocator;
use packet_channel::connection::PacketReader;
use packet_channel::core::framing::Framing;
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    // Fuzz inbound framing - first byte picks where the stream is split
    let Some((&cut, stream)) = data.split_first() else {
        return;
    };
    let (head, tail) = stream.split_at((cut as usize).min(stream.len()));

    let framing = Framing::id_prefixed().with_max_packet_size(4096);
    let mut reader = PacketReader::new(framing, 8, Arc::new(DefaultAllocator::default()));

    for part in [head, tail] {
        let mut cycle = match reader.on_read(part, |_| Ok(())) {
            Ok(cycle) => cycle,
            Err(_) => return,
        };
        while cycle.limited {
            cycle = match reader.frame_buffered(|_| Ok(())) {
                Ok(cycle) => cycle,
                Err(_) => return,
            };
        }
    }
});
