//! Protocol definitions shared by client and server.
//!
//! Every application message on the wire is `[message_type: u8][payload]`.
//! System-level traffic (status changes, approval requests, diagnostics) is
//! produced by the transport itself and never carries a message-type tag.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// ALPN protocol identifier. The suffix is the wire version; peers with a
/// different version fail the TLS handshake.
pub const ALPN_PROTOCOL: &[u8] = b"isoworld/1";

/// Maximum display-name length in bytes.
pub const MAX_NAME_LEN: usize = 32;

/// Maximum credential length in bytes.
pub const MAX_CREDENTIAL_LEN: usize = 64;

/// Maximum length of a status or denial reason in bytes; longer reasons are
/// truncated.
pub const MAX_REASON_LEN: usize = 256;

/// Maximum length of a server name in bytes.
pub const MAX_SERVER_NAME_LEN: usize = 64;

/// Default number of cells carried by one world chunk.
pub const DEFAULT_CHUNK_SIZE: u32 = 512;

/// Transport-assigned connection identifier, stable for a connection's life.
pub type ConnectionId = u64;

/// Application message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Client asks for world dimensions and transfer size.
    RequestServerInfo = 0,
    /// Server reply carrying [`WorldInfo`].
    ServerInfo = 1,
    /// Client asks for the full world to be streamed.
    RequestWorldChunks = 2,
    /// One run of world cells.
    WorldChunk = 3,
}

impl MessageType {
    /// Wire tag.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse a wire tag.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::RequestServerInfo),
            1 => Some(Self::ServerInfo),
            2 => Some(Self::RequestWorldChunks),
            3 => Some(Self::WorldChunk),
            _ => None,
        }
    }
}

/// Delivery guarantees requested when sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMethod {
    /// Fire and forget.
    Unreliable,
    /// Guaranteed delivery, arrival order not preserved.
    ReliableUnordered,
    /// Guaranteed delivery in send order.
    ReliableOrdered,
}

/// Which side of the protocol a peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Accepts connections and hosts the world.
    Server,
    /// Connects to a server.
    Client,
}

impl PeerRole {
    /// Tag used in log output.
    pub fn tag(&self) -> &'static str {
        match self {
            PeerRole::Server => "server",
            PeerRole::Client => "client",
        }
    }
}

/// Lifecycle of a single connection.
///
/// `Connecting` covers both [`InitiatedConnect`](Self::InitiatedConnect) and
/// [`RespondedAwaitingApproval`](Self::RespondedAwaitingApproval).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ConnectionStatus {
    /// No connection exists.
    #[default]
    None = 0,
    /// Client sent its hail and waits for the server.
    InitiatedConnect = 1,
    /// Server received the hail and is deciding.
    RespondedAwaitingApproval = 2,
    /// Approved and live.
    Connected = 3,
    /// Shutting down.
    Disconnecting = 4,
    /// Closed (denied, dropped or shut down).
    Disconnected = 5,
}

impl ConnectionStatus {
    /// Wire tag.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse a wire tag.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::InitiatedConnect),
            2 => Some(Self::RespondedAwaitingApproval),
            3 => Some(Self::Connected),
            4 => Some(Self::Disconnecting),
            5 => Some(Self::Disconnected),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    ///
    /// A connection still being set up may also enter `Disconnecting` when
    /// the local side gives up on it before the remote answers.
    pub fn can_transition_to(&self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        match (self, next) {
            (None | Disconnected, InitiatedConnect | RespondedAwaitingApproval) => true,
            (InitiatedConnect, RespondedAwaitingApproval) => true,
            (
                InitiatedConnect | RespondedAwaitingApproval,
                Connected | Disconnecting | Disconnected,
            ) => true,
            (Connected, Disconnecting | Disconnected) => true,
            (Disconnecting, Disconnected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Handle to one remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Connection {
    id: ConnectionId,
    remote: SocketAddr,
}

impl Connection {
    /// Construct a handle.
    pub fn new(id: ConnectionId, remote: SocketAddr) -> Self {
        Self { id, remote }
    }

    /// Transport-assigned unique identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote socket address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.remote, self.id)
    }
}

/// Transport-level event classes that are not application messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemEventKind {
    /// A connection changed [`ConnectionStatus`].
    StatusChanged,
    /// A remote peer sent its hail and awaits approval.
    ConnectionApproval,
    /// Transport debug output.
    DebugMessage,
    /// Transport warning.
    WarningMessage,
    /// Transport error.
    ErrorMessage,
}

/// Classification of an inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Produced by the transport.
    System(SystemEventKind),
    /// Application message (`[message_type][payload]`).
    Data,
}

/// Raw packet as delivered by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingPacket {
    /// Packet class.
    pub kind: PacketKind,
    /// Originating connection, absent for peer-wide diagnostics.
    pub connection: Option<Connection>,
    /// Raw bytes.
    ///
    /// Status changes carry `[status: u8][reason: str]`, approvals carry the
    /// hail, diagnostics carry a single string.
    pub payload: Vec<u8>,
}

impl IncomingPacket {
    /// Application data from a connection.
    pub fn data(connection: Connection, payload: Vec<u8>) -> Self {
        Self {
            kind: PacketKind::Data,
            connection: Some(connection),
            payload,
        }
    }

    /// Status change notification.
    pub fn status(connection: Connection, status: ConnectionStatus, reason: &str) -> Self {
        Self {
            kind: PacketKind::System(SystemEventKind::StatusChanged),
            connection: Some(connection),
            payload: crate::codec::encode_status(status, reason),
        }
    }

    /// Join request carrying the remote peer's hail.
    pub fn approval(connection: Connection, hail: Vec<u8>) -> Self {
        Self {
            kind: PacketKind::System(SystemEventKind::ConnectionApproval),
            connection: Some(connection),
            payload: hail,
        }
    }

    /// Log-style diagnostic of the given kind.
    pub fn diagnostic(kind: SystemEventKind, text: &str) -> Self {
        let mut writer = crate::codec::PacketWriter::new();
        writer.write_str(text);
        Self {
            kind: PacketKind::System(kind),
            connection: None,
            payload: writer.finish(),
        }
    }
}

/// Largest world, in cells, a client agrees to download.
pub const MAX_WORLD_CELLS: u64 = 1 << 24;

/// World description sent in reply to [`MessageType::RequestServerInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldInfo {
    /// Grid width.
    pub width: u32,
    /// Grid depth.
    pub depth: u32,
    /// Grid height.
    pub height: u32,
    /// Cells per world chunk.
    pub chunk_size: u32,
    /// Chunks a full download consists of.
    pub total_chunks: u32,
    /// Players currently on the server.
    pub player_count: u32,
    /// Human-readable server name.
    pub server_name: String,
}

impl WorldInfo {
    /// Verify limits on a received info record.
    pub fn verify(&self) -> Result<(), &'static str> {
        if self.server_name.len() > MAX_SERVER_NAME_LEN {
            return Err("Server name too long");
        }
        if self.chunk_size == 0 {
            return Err("Chunk size must be non-zero");
        }
        if self.chunk_size as usize > crate::codec::MAX_CHUNK_CELLS {
            return Err("Chunk size exceeds frame limit");
        }
        let volume = u64::from(self.width) * u64::from(self.depth) * u64::from(self.height);
        if volume == 0 {
            return Err("World has no cells");
        }
        if volume > MAX_WORLD_CELLS {
            return Err("World too large");
        }
        let expected = volume.div_ceil(u64::from(self.chunk_size));
        if expected != u64::from(self.total_chunks) {
            return Err("Chunk count does not match world volume");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_tags_are_stable() {
        for tag in 0..=3u8 {
            assert_eq!(MessageType::from_u8(tag).unwrap().as_u8(), tag);
        }
        assert_eq!(MessageType::from_u8(4), None);
    }

    #[test]
    fn status_transitions_follow_handshake() {
        use ConnectionStatus::*;
        assert!(InitiatedConnect.can_transition_to(Connected));
        assert!(RespondedAwaitingApproval.can_transition_to(Disconnected));
        assert!(Connected.can_transition_to(Disconnecting));
        assert!(Disconnecting.can_transition_to(Disconnected));
        assert!(RespondedAwaitingApproval.can_transition_to(Disconnecting));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Disconnected));
        assert!(!Disconnecting.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(InitiatedConnect));
    }

    #[test]
    fn world_info_checks_chunk_count() {
        let mut info = WorldInfo {
            width: 100,
            depth: 100,
            height: 3,
            chunk_size: 512,
            total_chunks: 59,
            player_count: 1,
            server_name: "test".into(),
        };
        assert!(info.verify().is_ok());
        info.total_chunks = 58;
        assert!(info.verify().is_err());
    }

    #[test]
    fn world_info_rejects_oversized_worlds() {
        let mut info = WorldInfo {
            width: 65_536,
            depth: 65_536,
            height: 1,
            chunk_size: 512,
            total_chunks: 8_388_608,
            player_count: 0,
            server_name: "huge".into(),
        };
        assert_eq!(info.verify(), Err("World too large"));

        info.width = 4_096;
        info.depth = 4_096;
        info.total_chunks = 32_768;
        assert!(info.verify().is_ok());

        info.chunk_size = 1 << 20;
        info.total_chunks = 16;
        assert_eq!(info.verify(), Err("Chunk size exceeds frame limit"));
    }
}
