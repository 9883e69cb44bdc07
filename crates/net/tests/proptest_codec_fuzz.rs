//! Fuzz-style property tests for the wire codec.
//!
//! Decoders see untrusted network input; they must reject garbage with an
//! error instead of panicking.

use isoworld_net::{
    chunk_count, chunk_span, decode_chunk, decode_chunk_message, decode_status,
    decode_world_info, encode_chunk, Hail, MessageType, CHUNK_HEADER_LEN,
};
use isoworld_world::{CellFlags, GridCell, TileKind, Tint, CELL_WIRE_SIZE};
use proptest::prelude::*;

fn arb_cell() -> impl Strategy<Value = GridCell> {
    (0u8..5, 0u8..8, any::<bool>(), any::<[u8; 4]>()).prop_map(|(kind, flags, occupied, rgba)| {
        let mut flags = CellFlags::from_bits_truncate(flags);
        flags.set(CellFlags::OCCUPIED, occupied);
        GridCell {
            kind: TileKind::from_u8(kind).unwrap_or(TileKind::Empty),
            flags,
            tint: Tint(rgba),
        }
    })
}

proptest! {
    /// Arbitrary bytes never crash the chunk decoder.
    #[test]
    fn arbitrary_bytes_dont_crash_chunk_decoder(
        bytes in prop::collection::vec(any::<u8>(), 0..2000),
    ) {
        let _ = decode_chunk(&bytes);
        let _ = decode_chunk_message(&bytes);
    }

    /// Arbitrary bytes never crash the other decoders.
    #[test]
    fn arbitrary_bytes_dont_crash_other_decoders(
        bytes in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let _ = decode_status(&bytes);
        let _ = Hail::decode(&bytes);
        let _ = decode_world_info(&bytes);
    }

    /// A chunk header lying about its length is always rejected.
    #[test]
    fn chunk_length_mismatch_is_rejected(
        cells in prop::collection::vec(arb_cell(), 1..64),
        declared in any::<i32>(),
        start in 0i32..1_000_000,
    ) {
        prop_assume!(declared as i64 != cells.len() as i64);
        let mut payload = Vec::new();
        payload.extend_from_slice(&declared.to_le_bytes());
        payload.extend_from_slice(&start.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        for cell in &cells {
            payload.extend_from_slice(&cell.to_wire());
        }
        prop_assert!(decode_chunk(&payload).is_err());
    }

    /// Valid chunks decode to the same cells at the same position.
    #[test]
    fn encoded_chunks_decode(
        cells in prop::collection::vec(arb_cell(), 0..600),
        start in 0usize..1_000_000,
        sequence in any::<u16>(),
    ) {
        let message = encode_chunk(&cells, start, sequence).unwrap();
        prop_assert_eq!(message[0], MessageType::WorldChunk.as_u8());
        prop_assert_eq!(message.len(), 1 + CHUNK_HEADER_LEN + cells.len() * CELL_WIRE_SIZE);
        let chunk = decode_chunk_message(&message).unwrap();
        prop_assert_eq!(chunk.start_index, start);
        prop_assert_eq!(chunk.sequence_id, sequence);
        prop_assert_eq!(chunk.cells, cells);
    }

    /// Chunk spans tile the volume without gaps or overlap.
    #[test]
    fn chunk_spans_cover_volume_exactly(
        volume in 1usize..200_000,
        chunk_size in 1usize..4096,
    ) {
        let count = chunk_count(volume, chunk_size);
        prop_assert_eq!(count, (volume + chunk_size - 1) / chunk_size);

        let mut expected_start = 0;
        for index in 0..count {
            let span = chunk_span(volume, chunk_size, index).unwrap();
            prop_assert_eq!(span.start, expected_start);
            prop_assert!(!span.is_empty());
            prop_assert!(span.len() <= chunk_size);
            expected_start = span.end;
        }
        prop_assert_eq!(expected_start, volume);
        prop_assert!(chunk_span(volume, chunk_size, count).is_none());
    }
}
