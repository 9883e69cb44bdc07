//! Message encoding and decoding.
//!
//! Primitive values are little-endian; strings are `[len: u16][utf-8 bytes]`.
//! World chunks use a fixed layout so clients can place cells without any
//! schema negotiation:
//!
//! ```text
//! [tag: u8 = 3][chunk_length: i32][start_index: i32][sequence_id: u16][chunk_length x cell]
//! ```

use crate::channel::MAX_FRAME_LEN;
use crate::error::NetError;
use crate::protocol::{ConnectionStatus, MessageType, WorldInfo, MAX_REASON_LEN};
use isoworld_world::{GridCell, CELL_WIRE_SIZE};
use std::ops::Range;

/// Bytes of chunk header following the message tag.
pub const CHUNK_HEADER_LEN: usize = 4 + 4 + 2;

/// Largest number of cells one world chunk may carry and still fit in a frame.
pub const MAX_CHUNK_CELLS: usize = (MAX_FRAME_LEN - 1 - CHUNK_HEADER_LEN) / CELL_WIRE_SIZE;

/// Longest prefix of `value` that fits in `max` bytes without splitting a char.
pub(crate) fn truncate_utf8(value: &str, max: usize) -> &str {
    let mut end = value.len().min(max);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Little-endian message builder.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    /// Empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer pre-sized for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Writer with the message tag already written.
    pub fn message(message_type: MessageType) -> Self {
        let mut writer = Self::new();
        writer.write_u8(message_type.as_u8());
        writer
    }

    /// Append one byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Append a `u16`.
    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Append an `i32`.
    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Append a `u32`.
    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Append a length-prefixed string, truncated to `u16::MAX` bytes on a
    /// character boundary.
    pub fn write_str(&mut self, value: &str) {
        let value = truncate_utf8(value, u16::MAX as usize);
        self.write_u16(value.len() as u16);
        self.buf.extend_from_slice(value.as_bytes());
    }

    /// Append raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take the finished buffer.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Little-endian cursor over a received message.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Cursor at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8], NetError> {
        if self.remaining() < len {
            return Err(NetError::malformed(format!(
                "truncated {what}: need {len} bytes, have {}",
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Result<u8, NetError> {
        Ok(self.take(1, "u8")?[0])
    }

    /// Read a `u16`.
    pub fn read_u16(&mut self) -> Result<u16, NetError> {
        let bytes = self.take(2, "u16")?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Read an `i32`.
    pub fn read_i32(&mut self) -> Result<i32, NetError> {
        let bytes = self.take(4, "i32")?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a `u32`.
    pub fn read_u32(&mut self) -> Result<u32, NetError> {
        let bytes = self.take(4, "u32")?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_str(&mut self) -> Result<String, NetError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len, "string")?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| NetError::malformed("string is not valid utf-8"))
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// The unread tail.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

/// Number of chunks needed to cover `volume` cells.
pub fn chunk_count(volume: usize, chunk_size: usize) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    volume.div_ceil(chunk_size)
}

/// Linear index range covered by chunk `chunk_index`; the last chunk may be short.
pub fn chunk_span(volume: usize, chunk_size: usize, chunk_index: usize) -> Option<Range<usize>> {
    if chunk_index >= chunk_count(volume, chunk_size) {
        return None;
    }
    let start = chunk_index * chunk_size;
    let end = (start + chunk_size).min(volume);
    Some(start..end)
}

/// A decoded world chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldChunk {
    /// Linear index of the first cell.
    pub start_index: usize,
    /// Per-session sequence number.
    pub sequence_id: u16,
    /// Cells in linear order.
    pub cells: Vec<GridCell>,
}

impl WorldChunk {
    /// Index range covered by this chunk.
    pub fn span(&self) -> Range<usize> {
        self.start_index..self.start_index + self.cells.len()
    }
}

/// Encode a world chunk message (tag included).
pub fn encode_chunk(
    cells: &[GridCell],
    start_index: usize,
    sequence_id: u16,
) -> Result<Vec<u8>, NetError> {
    if cells.len() > MAX_CHUNK_CELLS {
        return Err(NetError::malformed(format!(
            "chunk of {} cells exceeds limit {MAX_CHUNK_CELLS}",
            cells.len()
        )));
    }
    let chunk_length = i32::try_from(cells.len())
        .map_err(|_| NetError::malformed("chunk length exceeds i32"))?;
    let start = i32::try_from(start_index)
        .map_err(|_| NetError::malformed("start index exceeds i32"))?;
    if start.checked_add(chunk_length).is_none() {
        return Err(NetError::malformed("chunk end exceeds i32"));
    }

    let mut writer =
        PacketWriter::with_capacity(1 + CHUNK_HEADER_LEN + cells.len() * CELL_WIRE_SIZE);
    writer.write_u8(MessageType::WorldChunk.as_u8());
    writer.write_i32(chunk_length);
    writer.write_i32(start);
    writer.write_u16(sequence_id);
    for cell in cells {
        writer.write_bytes(&cell.to_wire());
    }
    Ok(writer.finish())
}

/// Decode a world chunk payload (everything after the tag).
///
/// The declared length must match the bytes present exactly.
pub fn decode_chunk(payload: &[u8]) -> Result<WorldChunk, NetError> {
    let mut reader = PacketReader::new(payload);
    let chunk_length = reader.read_i32()?;
    let start_index = reader.read_i32()?;
    let sequence_id = reader.read_u16()?;

    if chunk_length < 0 {
        return Err(NetError::malformed(format!(
            "negative chunk length {chunk_length}"
        )));
    }
    if start_index < 0 {
        return Err(NetError::malformed(format!(
            "negative start index {start_index}"
        )));
    }
    let expected = chunk_length as usize * CELL_WIRE_SIZE;
    if reader.remaining() != expected {
        return Err(NetError::malformed(format!(
            "chunk declares {chunk_length} cells ({expected} bytes) but carries {} bytes",
            reader.remaining()
        )));
    }

    let cells = reader
        .rest()
        .chunks_exact(CELL_WIRE_SIZE)
        .enumerate()
        .map(|(i, raw)| {
            let mut bytes = [0u8; CELL_WIRE_SIZE];
            bytes.copy_from_slice(raw);
            GridCell::from_wire(bytes)
                .ok_or_else(|| NetError::malformed(format!("invalid cell {i} in chunk")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(WorldChunk {
        start_index: start_index as usize,
        sequence_id,
        cells,
    })
}

/// Decode a full world chunk message, checking the tag.
pub fn decode_chunk_message(message: &[u8]) -> Result<WorldChunk, NetError> {
    let (tag, payload) = split_message(message)?;
    if tag != MessageType::WorldChunk.as_u8() {
        return Err(NetError::malformed(format!(
            "expected world chunk tag, found {tag}"
        )));
    }
    decode_chunk(payload)
}

/// Split an application message into its tag and payload.
pub fn split_message(message: &[u8]) -> Result<(u8, &[u8]), NetError> {
    match message.split_first() {
        Some((tag, payload)) => Ok((*tag, payload)),
        None => Err(NetError::malformed("empty message")),
    }
}

/// A message consisting of only a tag.
pub fn encode_request(message_type: MessageType) -> Vec<u8> {
    vec![message_type.as_u8()]
}

/// Encode a server info reply (tag + postcard body).
pub fn encode_world_info(info: &WorldInfo) -> Result<Vec<u8>, NetError> {
    let body = postcard::to_allocvec(info)
        .map_err(|e| NetError::malformed(format!("failed to serialize world info: {e}")))?;
    let mut writer = PacketWriter::with_capacity(1 + body.len());
    writer.write_u8(MessageType::ServerInfo.as_u8());
    writer.write_bytes(&body);
    Ok(writer.finish())
}

/// Decode a server info payload (everything after the tag).
pub fn decode_world_info(payload: &[u8]) -> Result<WorldInfo, NetError> {
    let info: WorldInfo = postcard::from_bytes(payload)
        .map_err(|e| NetError::malformed(format!("failed to deserialize world info: {e}")))?;
    info.verify().map_err(NetError::malformed)?;
    Ok(info)
}

/// Status payload: `[status: u8][reason: str]`.
pub fn encode_status(status: ConnectionStatus, reason: &str) -> Vec<u8> {
    let reason = truncate_utf8(reason, MAX_REASON_LEN);
    let mut writer = PacketWriter::with_capacity(3 + reason.len());
    writer.write_u8(status.as_u8());
    writer.write_str(reason);
    writer.finish()
}

/// Parse a status payload. A missing reason decodes as empty.
pub fn decode_status(payload: &[u8]) -> Result<(ConnectionStatus, String), NetError> {
    let mut reader = PacketReader::new(payload);
    let raw = reader.read_u8()?;
    let status = ConnectionStatus::from_u8(raw)
        .ok_or_else(|| NetError::malformed(format!("unknown connection status {raw}")))?;
    let reason = if reader.remaining() == 0 {
        String::new()
    } else {
        reader.read_str()?
    };
    Ok((status, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use isoworld_world::{CellFlags, TileKind};

    fn sample_cells(count: usize) -> Vec<GridCell> {
        (0..count)
            .map(|i| {
                let mut cell = GridCell::new(if i % 2 == 0 {
                    TileKind::Grass
                } else {
                    TileKind::Stone
                });
                if i % 3 == 0 {
                    cell.flags |= CellFlags::TREES;
                }
                cell
            })
            .collect()
    }

    #[test]
    fn chunk_layout_matches_wire_format() {
        let cells = sample_cells(3);
        let message = encode_chunk(&cells, 1024, 7).unwrap();
        assert_eq!(message.len(), 1 + CHUNK_HEADER_LEN + 3 * CELL_WIRE_SIZE);
        assert_eq!(message[0], MessageType::WorldChunk.as_u8());
        assert_eq!(&message[1..5], &3i32.to_le_bytes());
        assert_eq!(&message[5..9], &1024i32.to_le_bytes());
        assert_eq!(&message[9..11], &7u16.to_le_bytes());

        let chunk = decode_chunk_message(&message).unwrap();
        assert_eq!(chunk.start_index, 1024);
        assert_eq!(chunk.sequence_id, 7);
        assert_eq!(chunk.cells, cells);
        assert_eq!(chunk.span(), 1024..1027);
    }

    #[test]
    fn chunk_with_mismatched_length_is_rejected() {
        let mut message = encode_chunk(&sample_cells(4), 0, 0).unwrap();
        message.truncate(message.len() - 1);
        assert!(matches!(
            decode_chunk(&message[1..]),
            Err(NetError::Malformed(_))
        ));

        let mut padded = encode_chunk(&sample_cells(4), 0, 0).unwrap();
        padded.push(0);
        assert!(decode_chunk(&padded[1..]).is_err());
    }

    #[test]
    fn negative_header_fields_are_rejected() {
        let mut writer = PacketWriter::new();
        writer.write_i32(-1);
        writer.write_i32(0);
        writer.write_u16(0);
        assert!(decode_chunk(&writer.finish()).is_err());

        let mut writer = PacketWriter::new();
        writer.write_i32(0);
        writer.write_i32(-5);
        writer.write_u16(0);
        assert!(decode_chunk(&writer.finish()).is_err());
    }

    #[test]
    fn empty_chunk_is_valid() {
        let message = encode_chunk(&[], 30_000, 0).unwrap();
        let chunk = decode_chunk_message(&message).unwrap();
        assert!(chunk.cells.is_empty());
    }

    #[test]
    fn wrong_tag_is_rejected() {
        let mut message = encode_chunk(&sample_cells(1), 0, 0).unwrap();
        message[0] = MessageType::ServerInfo.as_u8();
        assert!(decode_chunk_message(&message).is_err());
        assert!(split_message(&[]).is_err());
    }

    #[test]
    fn chunk_spans_cover_volume() {
        assert_eq!(chunk_count(30_000, 512), 59);
        assert_eq!(chunk_span(30_000, 512, 0), Some(0..512));
        assert_eq!(chunk_span(30_000, 512, 58), Some(29_696..30_000));
        assert_eq!(chunk_span(30_000, 512, 59), None);
        assert_eq!(chunk_count(1024, 512), 2);
        assert_eq!(chunk_count(0, 512), 0);
    }

    #[test]
    fn status_payload_round_trip() {
        let payload = encode_status(ConnectionStatus::Disconnected, "Incorrect password");
        let (status, reason) = decode_status(&payload).unwrap();
        assert_eq!(status, ConnectionStatus::Disconnected);
        assert_eq!(reason, "Incorrect password");

        let (status, reason) = decode_status(&[ConnectionStatus::Connected.as_u8()]).unwrap();
        assert_eq!(status, ConnectionStatus::Connected);
        assert!(reason.is_empty());

        assert!(decode_status(&[42]).is_err());
        assert!(decode_status(&[]).is_err());
    }

    #[test]
    fn long_status_reasons_are_cut_on_a_char_boundary() {
        let reason = "é".repeat(MAX_REASON_LEN);
        let payload = encode_status(ConnectionStatus::Disconnected, &reason);
        let (_, decoded) = decode_status(&payload).unwrap();
        assert_eq!(decoded.len(), MAX_REASON_LEN);
        assert!(reason.starts_with(&decoded));
    }

    #[test]
    fn largest_chunk_fits_in_one_frame() {
        let cells = vec![GridCell::default(); MAX_CHUNK_CELLS];
        let message = encode_chunk(&cells, 0, 0).unwrap();
        assert!(message.len() <= MAX_FRAME_LEN);

        let cells = vec![GridCell::default(); MAX_CHUNK_CELLS + 1];
        assert!(encode_chunk(&cells, 0, 0).is_err());
    }

    #[test]
    fn world_info_travels_with_tag() {
        let info = WorldInfo {
            width: 100,
            depth: 100,
            height: 3,
            chunk_size: 512,
            total_chunks: 59,
            player_count: 2,
            server_name: "isoworld".into(),
        };
        let message = encode_world_info(&info).unwrap();
        let (tag, payload) = split_message(&message).unwrap();
        assert_eq!(tag, MessageType::ServerInfo.as_u8());
        assert_eq!(decode_world_info(payload).unwrap(), info);
    }

    #[test]
    fn reader_reports_truncation() {
        let mut reader = PacketReader::new(&[5, 0, b'a']);
        assert!(reader.read_str().is_err());
        let mut reader = PacketReader::new(&[1]);
        assert!(reader.read_u16().is_err());
    }
}
