#![warn(missing_docs)]
//! Joining client: connects, asks for the world and reassembles it.

mod download;

pub use download::WorldDownload;

use anyhow::{Context, Result};
use isoworld_net::{
    decode_chunk, decode_world_info, encode_request, ClientTransport, ConnectionId,
    ConnectionStatus, DeliveryMethod, Hail, MessageType, NetError, Peer, QuicClientTransport,
    StatusChange, Transport, WorldInfo,
};
use isoworld_world::TileGrid;
use std::net::SocketAddr;
use tracing::{info, instrument, warn};

/// Reason sent when the player leaves.
const LEAVE_REASON: &str = "Client disconnected";

/// Things the presentation layer reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The server approved us.
    Connected,
    /// The connection ended or was refused.
    Disconnected {
        /// Reason given by whoever closed it.
        reason: String,
    },
    /// Server described its world; the download starts.
    WorldInfo(WorldInfo),
    /// More of the world arrived.
    DownloadProgress {
        /// Distinct cells received.
        received_cells: usize,
        /// Cells in the world.
        total_cells: usize,
    },
    /// The whole world has arrived.
    WorldReady,
}

/// Client-side session state lent to handlers.
#[derive(Default)]
pub struct ClientState {
    server: Option<ConnectionId>,
    status: ConnectionStatus,
    info: Option<WorldInfo>,
    download: Option<WorldDownload>,
    world: Option<TileGrid>,
    events: Vec<ClientEvent>,
}

impl ClientState {
    fn on_status_change<T: Transport>(&mut self, transport: &mut T, change: &StatusChange) {
        if self.server != Some(change.connection.id()) {
            return;
        }
        self.status = change.status;
        match change.status {
            ConnectionStatus::Connected => {
                info!(server = %change.connection, "connected");
                self.events.push(ClientEvent::Connected);
                let request = encode_request(MessageType::RequestServerInfo);
                if let Err(err) = transport.send(
                    change.connection.id(),
                    request,
                    DeliveryMethod::ReliableOrdered,
                ) {
                    warn!("failed to request server info: {err}");
                }
            }
            ConnectionStatus::Disconnected => {
                info!(server = %change.connection, reason = %change.reason, "disconnected");
                self.download = None;
                self.events.push(ClientEvent::Disconnected {
                    reason: change.reason.clone(),
                });
            }
            _ => {}
        }
    }

    fn on_server_info<T: Transport>(
        &mut self,
        transport: &mut T,
        server: ConnectionId,
        payload: &[u8],
    ) -> Result<(), NetError> {
        let info = decode_world_info(payload)?;
        let download = WorldDownload::new(info.clone())
            .map_err(|err| NetError::Malformed(format!("unusable world info: {err}")))?;
        info!(
            server = %info.server_name,
            width = info.width,
            depth = info.depth,
            height = info.height,
            chunks = info.total_chunks,
            "world info received"
        );
        self.download = Some(download);
        self.world = None;
        self.info = Some(info.clone());
        self.events.push(ClientEvent::WorldInfo(info));
        transport.send(
            server,
            encode_request(MessageType::RequestWorldChunks),
            DeliveryMethod::ReliableOrdered,
        )
    }

    fn on_world_chunk(&mut self, payload: &[u8]) -> Result<(), NetError> {
        let chunk = decode_chunk(payload)?;
        let download = self
            .download
            .as_mut()
            .ok_or_else(|| NetError::Malformed("world chunk before server info".into()))?;
        download
            .apply(&chunk)
            .map_err(|err| NetError::Malformed(format!("chunk does not fit world: {err}")))?;
        self.events.push(ClientEvent::DownloadProgress {
            received_cells: download.received_cells(),
            total_cells: download.total_cells(),
        });

        if download.is_complete() {
            self.world = self.download.take().and_then(WorldDownload::into_grid);
            info!("world download complete");
            self.events.push(ClientEvent::WorldReady);
        }
        Ok(())
    }
}

/// Player-side peer.
pub struct GameClient<T: ClientTransport + 'static = QuicClientTransport> {
    peer: Peer<T, ClientState>,
    state: ClientState,
}

impl GameClient<QuicClientTransport> {
    /// Client on a fresh QUIC transport.
    pub fn quic() -> Result<Self> {
        let transport = QuicClientTransport::new().context("Failed to create client transport")?;
        Self::new(transport)
    }
}

impl<T: ClientTransport + 'static> GameClient<T> {
    /// Wrap a transport.
    pub fn new(transport: T) -> Result<Self> {
        let mut peer = Peer::new(transport);
        peer.register_handler(
            MessageType::ServerInfo.as_u8(),
            |state: &mut ClientState, transport: &mut T, connection, payload| {
                state.on_server_info(transport, connection.id(), payload)
            },
        )
        .context("Failed to register server info handler")?;
        peer.register_handler(
            MessageType::WorldChunk.as_u8(),
            |state: &mut ClientState, _transport: &mut T, _connection, payload| {
                state.on_world_chunk(payload)
            },
        )
        .context("Failed to register world chunk handler")?;
        peer.on_status_change(|state: &mut ClientState, transport: &mut T, change| {
            state.on_status_change(transport, change)
        });

        Ok(Self {
            peer,
            state: ClientState::default(),
        })
    }

    /// Start joining the server at `addr`.
    pub fn connect(
        &mut self,
        addr: SocketAddr,
        credential: &str,
        name: &str,
    ) -> Result<(), NetError> {
        if !matches!(
            self.state.status,
            ConnectionStatus::None | ConnectionStatus::Disconnected
        ) {
            return Err(NetError::Transport(format!(
                "cannot connect while {}",
                self.state.status
            )));
        }
        let transport = self.peer.transport_mut();
        transport.connect(addr, &Hail::new(credential, name))?;
        self.state = ClientState {
            server: transport.server_connection(),
            status: ConnectionStatus::InitiatedConnect,
            ..ClientState::default()
        };
        info!(%addr, name, "joining");
        Ok(())
    }

    /// Leave the server.
    pub fn disconnect(&mut self) {
        let Some(server) = self.state.server else {
            warn!("not connected");
            return;
        };
        if matches!(
            self.state.status,
            ConnectionStatus::None | ConnectionStatus::Disconnected | ConnectionStatus::Disconnecting
        ) {
            warn!(status = %self.state.status, "already disconnected");
            return;
        }
        match self.peer.transport_mut().disconnect(server, LEAVE_REASON) {
            Ok(()) => self.state.status = ConnectionStatus::Disconnecting,
            Err(err) => warn!("disconnect failed: {err}"),
        }
    }

    /// Process everything the server sent since the last call.
    #[instrument(skip(self), fields(peer = self.peer.tag()))]
    pub fn update(&mut self) -> Vec<ClientEvent> {
        self.peer.pump(&mut self.state);
        std::mem::take(&mut self.state.events)
    }

    /// Connection status as last reported.
    pub fn status(&self) -> ConnectionStatus {
        self.state.status
    }

    /// World description, once received.
    pub fn world_info(&self) -> Option<&WorldInfo> {
        self.state.info.as_ref()
    }

    /// Download in progress, if any.
    pub fn download(&self) -> Option<&WorldDownload> {
        self.state.download.as_ref()
    }

    /// Completed world, if received.
    pub fn world(&self) -> Option<&TileGrid> {
        self.state.world.as_ref()
    }

    /// Take ownership of the completed world.
    pub fn take_world(&mut self) -> Option<TileGrid> {
        self.state.world.take()
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        self.peer.transport()
    }

    /// Underlying transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        self.peer.transport_mut()
    }

    /// Close the transport.
    pub fn shutdown(&mut self, reason: &str) {
        self.peer.transport_mut().shutdown(reason);
        self.state.status = ConnectionStatus::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isoworld_net::{encode_chunk, encode_world_info, Connection, MemoryTransport};
    use isoworld_world::{generate_terrain, Grid, GridDims, TerrainConfig};

    const ADDR: &str = "127.0.0.1:7777";

    fn connected_client() -> (GameClient<MemoryTransport>, Connection) {
        let mut client = GameClient::new(MemoryTransport::client()).unwrap();
        client.connect(ADDR.parse().unwrap(), "", "ann").unwrap();
        client.transport_mut().accept_connection();
        assert_eq!(client.update(), vec![ClientEvent::Connected]);
        let id = client.transport().server_connection().unwrap();
        (client, Connection::new(id, ADDR.parse().unwrap()))
    }

    fn world_info_for(grid: &dyn Grid, chunk_size: u32) -> WorldInfo {
        let dims = grid.dimensions();
        WorldInfo {
            width: dims.width(),
            depth: dims.depth(),
            height: dims.height(),
            chunk_size,
            total_chunks: dims.volume().div_ceil(chunk_size as usize) as u32,
            player_count: 1,
            server_name: "test".into(),
        }
    }

    #[test]
    fn connect_sends_hail_and_requests_info() {
        let (mut client, _) = connected_client();
        assert_eq!(client.transport().hails()[0].1, Hail::new("", "ann"));
        let sent = client.transport_mut().take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].bytes, vec![MessageType::RequestServerInfo.as_u8()]);
        assert_eq!(client.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn refused_connection_reports_reason() {
        let mut client = GameClient::new(MemoryTransport::client()).unwrap();
        client.connect(ADDR.parse().unwrap(), "bad", "ann").unwrap();
        client.transport_mut().reject_connection("Incorrect password");
        assert_eq!(
            client.update(),
            vec![ClientEvent::Disconnected {
                reason: "Incorrect password".into()
            }]
        );
        client.connect(ADDR.parse().unwrap(), "good", "ann").unwrap();
    }

    #[test]
    fn second_connect_is_refused() {
        let mut client = GameClient::new(MemoryTransport::client()).unwrap();
        client.connect(ADDR.parse().unwrap(), "", "ann").unwrap();
        assert!(matches!(
            client.connect(ADDR.parse().unwrap(), "", "ann"),
            Err(NetError::Transport(_))
        ));
    }

    #[test]
    fn world_reassembles_from_shuffled_chunks() {
        let dims = GridDims::new(20, 20, 3).unwrap();
        let source = generate_terrain(dims, &TerrainConfig::default());
        let (mut client, server) = connected_client();
        client.transport_mut().take_sent();

        let info = world_info_for(&source, 128);
        client
            .transport_mut()
            .inject_data(&server, encode_world_info(&info).unwrap());
        let events = client.update();
        assert_eq!(events, vec![ClientEvent::WorldInfo(info.clone())]);
        let sent = client.transport_mut().take_sent();
        assert_eq!(sent[0].bytes, vec![MessageType::RequestWorldChunks.as_u8()]);

        let volume = dims.volume();
        let mut chunks: Vec<Vec<u8>> = (0..info.total_chunks as usize)
            .map(|i| {
                let start = i * 128;
                let end = (start + 128).min(volume);
                encode_chunk(&source.cells()[start..end], start, i as u16).unwrap()
            })
            .collect();
        chunks.reverse();
        for message in chunks {
            client.transport_mut().inject_data(&server, message);
        }

        let events = client.update();
        assert_eq!(events.last(), Some(&ClientEvent::WorldReady));
        assert_eq!(client.world(), Some(&source));
        assert!(client.download().is_none());
    }

    #[test]
    fn chunk_before_info_is_dropped() {
        let (mut client, server) = connected_client();
        let cells = vec![isoworld_world::GridCell::EMPTY; 4];
        client
            .transport_mut()
            .inject_data(&server, encode_chunk(&cells, 0, 0).unwrap());
        assert!(client.update().is_empty());
    }

    #[test]
    fn disconnect_twice_is_harmless() {
        let (mut client, _) = connected_client();
        client.disconnect();
        assert_eq!(client.status(), ConnectionStatus::Disconnecting);
        client.disconnect();
        let events = client.update();
        assert_eq!(
            events,
            vec![ClientEvent::Disconnected {
                reason: LEAVE_REASON.into()
            }]
        );
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
        client.disconnect();
    }
}
