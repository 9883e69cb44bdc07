#![warn(missing_docs)]
//! Networking for isoworld: message framing, the join handshake, dispatch of
//! inbound packets, and the transports that carry them.

mod channel;
mod codec;
mod error;
mod handshake;
mod memory;
mod peer;
mod protocol;
mod quic;
mod transport;

pub use channel::{read_frame, write_frame, MAX_FRAME_LEN};
pub use codec::{
    chunk_count, chunk_span, decode_chunk, decode_chunk_message, decode_status,
    decode_world_info, encode_chunk, encode_request, encode_status, encode_world_info,
    split_message, PacketReader, PacketWriter, WorldChunk, CHUNK_HEADER_LEN, MAX_CHUNK_CELLS,
};
pub use error::{AuthError, NetError};
pub use handshake::{evaluate_hail, Hail};
pub use memory::{MemoryTransport, SentMessage, Verdict};
pub use peer::{MessageHandler, Peer, PumpStats, StatusChange, StatusObserver, SystemHandler};
pub use protocol::{
    Connection, ConnectionId, ConnectionStatus, DeliveryMethod, IncomingPacket, MessageType,
    PacketKind, PeerRole, SystemEventKind, WorldInfo, ALPN_PROTOCOL, DEFAULT_CHUNK_SIZE,
    MAX_CREDENTIAL_LEN, MAX_NAME_LEN, MAX_REASON_LEN, MAX_SERVER_NAME_LEN, MAX_WORLD_CELLS,
};
pub use quic::{QuicClientTransport, QuicServerTransport};
pub use transport::{ClientTransport, ServerTransport, Transport};
