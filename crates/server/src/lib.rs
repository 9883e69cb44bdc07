#![warn(missing_docs)]
//! Authoritative host: admits players, answers world queries and streams the
//! world to clients that ask for it.

mod registry;
mod uploads;

pub use registry::{Player, PlayerEvent, PlayerKind, PlayerRegistry};
pub use uploads::{
    UploadError, UploadLimits, UploadScheduler, UploadSession, DEFAULT_MAX_CHUNKS_PER_TICK,
    DEFAULT_MAX_CONCURRENT_UPLOADS,
};

use anyhow::{Context, Result};
use isoworld_core::SimTick;
use isoworld_net::{
    chunk_count, encode_world_info, evaluate_hail, AuthError, Connection, ConnectionId,
    ConnectionStatus, DeliveryMethod, Hail, IncomingPacket, MessageType, Peer,
    QuicServerTransport, ServerTransport, StatusChange, SystemEventKind, Transport, WorldInfo,
    MAX_SERVER_NAME_LEN, MAX_WORLD_CELLS,
};
use isoworld_world::{Grid, TileGrid};
use std::net::SocketAddr;
use tracing::{debug, info, instrument, warn};

/// Server behaviour knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Name reported to clients.
    pub name: String,
    /// Password required to join; `None` admits everyone.
    pub password: Option<String>,
    /// Maximum number of players.
    pub max_connections: usize,
    /// Upload pacing.
    pub uploads: UploadLimits,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "isoworld".to_string(),
            password: None,
            max_connections: 16,
            uploads: UploadLimits::default(),
        }
    }
}

/// Everything handlers need, owned by the server and lent to the peer.
pub struct ServerState {
    settings: ServerSettings,
    registry: PlayerRegistry,
    uploads: UploadScheduler,
    grid: TileGrid,
}

impl ServerState {
    fn admit(&self, hail: &Hail) -> Result<String, AuthError> {
        if self.registry.len() >= self.settings.max_connections {
            return Err(AuthError::ServerFull);
        }
        evaluate_hail(hail, self.settings.password.as_deref())
    }

    fn world_info(&self) -> WorldInfo {
        let dims = self.grid.dimensions();
        let chunk_size = self.uploads.limits().chunk_size;
        WorldInfo {
            width: dims.width(),
            depth: dims.depth(),
            height: dims.height(),
            chunk_size: chunk_size as u32,
            total_chunks: chunk_count(dims.volume(), chunk_size) as u32,
            player_count: self.registry.len() as u32,
            server_name: truncate_name(&self.settings.name),
        }
    }
}

fn truncate_name(name: &str) -> String {
    let mut end = name.len().min(MAX_SERVER_NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// Counters from one [`GameServer::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerTickStats {
    /// Packets processed.
    pub packets: usize,
    /// World chunks sent.
    pub chunks_sent: usize,
}

/// Game host driving a transport once per tick.
pub struct GameServer<T: ServerTransport + 'static = QuicServerTransport> {
    peer: Peer<T, ServerState>,
    state: ServerState,
    running: bool,
    tick: SimTick,
}

impl<T: ServerTransport + 'static> GameServer<T> {
    /// Build a stopped server hosting `grid`.
    pub fn new(settings: ServerSettings, grid: TileGrid, transport: T) -> Result<Self> {
        let volume = grid.dimensions().volume();
        if volume as u64 > MAX_WORLD_CELLS {
            anyhow::bail!("world of {volume} cells exceeds the client limit of {MAX_WORLD_CELLS}");
        }
        let mut peer = Peer::new(transport);
        peer.set_system_handler(SystemEventKind::ConnectionApproval, handle_approval::<T>);
        peer.register_handler(
            MessageType::RequestServerInfo.as_u8(),
            |state: &mut ServerState, transport: &mut T, connection, _payload| {
                let message = encode_world_info(&state.world_info())?;
                transport.send(connection.id(), message, DeliveryMethod::ReliableOrdered)
            },
        )
        .context("Failed to register server info handler")?;
        peer.register_handler(
            MessageType::RequestWorldChunks.as_u8(),
            |state: &mut ServerState, _transport: &mut T, connection, _payload| {
                let volume = state.grid.dimensions().volume();
                if let Err(err) = state.uploads.on_world_data_request(connection.id(), volume) {
                    warn!("ignoring world request: {err}");
                }
                Ok(())
            },
        )
        .context("Failed to register world request handler")?;
        peer.on_status_change(handle_status_change::<T>);

        let uploads = UploadScheduler::new(settings.uploads);
        Ok(Self {
            peer,
            state: ServerState {
                settings,
                registry: PlayerRegistry::new(),
                uploads,
                grid,
            },
            running: false,
            tick: SimTick::ZERO,
        })
    }

    /// Start accepting players.
    pub fn start(&mut self) -> Result<()> {
        if self.running {
            warn!("server already running");
            return Ok(());
        }
        self.state.registry.reset();
        self.state.uploads.clear();
        self.peer
            .transport_mut()
            .start()
            .context("Failed to start server transport")?;
        self.running = true;
        self.tick = SimTick::ZERO;
        info!(
            name = %self.state.settings.name,
            addr = ?self.peer.transport().local_addr(),
            world = %self.state.grid.dimensions(),
            "server started"
        );
        Ok(())
    }

    /// Disconnect everyone and stop.
    pub fn shutdown(&mut self, reason: &str) {
        if !self.running {
            warn!("server is not running");
            return;
        }
        self.peer.transport_mut().shutdown(reason);
        self.state.registry.reset();
        self.state.uploads.clear();
        self.running = false;
        info!(reason, "server stopped");
    }

    /// Process inbound packets, then advance world uploads.
    #[instrument(skip(self), fields(peer = self.peer.tag(), tick = self.tick.0))]
    pub fn update(&mut self) -> ServerTickStats {
        if !self.running {
            return ServerTickStats::default();
        }
        let pumped = self.peer.pump(&mut self.state);
        let chunks_sent = self
            .state
            .uploads
            .tick(&self.state.grid, self.peer.transport_mut());
        self.tick = self.tick.advance(1);
        if chunks_sent > 0 {
            debug!(chunks_sent, uploads = self.state.uploads.active_count(), "uploads advanced");
        }
        ServerTickStats {
            packets: pumped.packets,
            chunks_sent,
        }
    }

    /// Add a server-controlled player.
    pub fn add_bot(&mut self, name: impl Into<String>) -> u32 {
        self.state.registry.add_bot(name)
    }

    /// Remove a player, disconnecting them if human.
    pub fn kick(&mut self, id: u32, reason: &str) {
        let connection = self
            .state
            .registry
            .get(id)
            .and_then(|p| p.connection().map(Connection::id));
        match connection {
            Some(connection) => {
                if let Err(err) = self.peer.transport_mut().disconnect(connection, reason) {
                    warn!(player = id, "disconnect failed: {err}");
                }
                self.state.uploads.cancel(connection);
                self.state.registry.remove(id);
            }
            None => {
                self.state.registry.remove(id);
            }
        }
    }

    /// Whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Ticks processed since start.
    pub fn current_tick(&self) -> SimTick {
        self.tick
    }

    /// Player by id.
    pub fn player(&self, id: u32) -> Option<&Player> {
        self.state.registry.get(id)
    }

    /// Player behind a connection.
    pub fn player_by_connection(&self, connection: ConnectionId) -> Option<&Player> {
        self.state.registry.get_by_connection(connection)
    }

    /// All players in id order.
    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.state.registry.iter()
    }

    /// Take queued join/leave events.
    pub fn drain_player_events(&mut self) -> Vec<PlayerEvent> {
        self.state.registry.drain_events()
    }

    /// World being hosted.
    pub fn grid(&self) -> &TileGrid {
        &self.state.grid
    }

    /// Upload scheduler state.
    pub fn uploads(&self) -> &UploadScheduler {
        &self.state.uploads
    }

    /// Description sent to clients asking for server info.
    pub fn world_info(&self) -> WorldInfo {
        self.state.world_info()
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.peer.transport().local_addr()
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        self.peer.transport()
    }

    /// Underlying transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        self.peer.transport_mut()
    }
}

fn handle_approval<T: ServerTransport>(
    state: &mut ServerState,
    transport: &mut T,
    packet: &IncomingPacket,
) {
    let Some(connection) = packet.connection.clone() else {
        warn!("approval request without connection");
        return;
    };
    let verdict = match Hail::decode(&packet.payload) {
        Ok(hail) => state.admit(&hail).map_err(|err| err.to_string()),
        Err(err) => {
            warn!(%connection, "unreadable hail: {err}");
            Err("Malformed hail".to_string())
        }
    };

    match verdict {
        Ok(name) => {
            let Some(id) = state.registry.add(Player::human(name, connection.clone())) else {
                if let Err(err) = transport.deny(connection.id(), "Already joined") {
                    warn!(%connection, "deny failed: {err}");
                }
                return;
            };
            if let Err(err) = transport.approve(connection.id()) {
                warn!(%connection, "approval failed: {err}");
                state.registry.remove(id);
            }
        }
        Err(reason) => {
            info!(%connection, %reason, "connection denied");
            if let Err(err) = transport.deny(connection.id(), &reason) {
                warn!(%connection, "deny failed: {err}");
            }
        }
    }
}

fn handle_status_change<T: ServerTransport>(
    state: &mut ServerState,
    _transport: &mut T,
    change: &StatusChange,
) {
    if change.status != ConnectionStatus::Disconnected {
        return;
    }
    let connection = change.connection.id();
    state.uploads.cancel(connection);
    let player = state.registry.get_by_connection(connection).map(|p| p.id);
    if let Some(id) = player {
        info!(player = id, reason = %change.reason, "player disconnected");
        state.registry.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isoworld_net::{
        decode_status, decode_world_info, split_message, MemoryTransport, PacketKind, Verdict,
    };
    use isoworld_world::GridDims;

    fn server(settings: ServerSettings) -> GameServer<MemoryTransport> {
        let grid = TileGrid::new(GridDims::new(100, 100, 3).unwrap());
        let mut server = GameServer::new(settings, grid, MemoryTransport::server()).unwrap();
        server.start().unwrap();
        server
    }

    fn join(server: &mut GameServer<MemoryTransport>, credential: &str, name: &str) -> Connection {
        let conn = server.transport_mut().connect_peer(credential, name);
        server.update();
        conn
    }

    #[test]
    fn wrong_password_is_denied() {
        let mut server = server(ServerSettings {
            password: Some("secret".into()),
            ..ServerSettings::default()
        });
        let conn = join(&mut server, "guess", "ann");

        assert_eq!(server.players().count(), 0);
        assert_eq!(
            server.transport().verdicts(),
            &[(conn.id(), Verdict::Denied("Incorrect password".into()))]
        );
    }

    #[test]
    fn blank_name_is_denied() {
        let mut server = server(ServerSettings::default());
        let conn = join(&mut server, "", "  ");
        assert_eq!(
            server.transport().verdicts(),
            &[(conn.id(), Verdict::Denied("Invalid name".into()))]
        );
    }

    #[test]
    fn players_get_sequential_ids_and_leave_on_disconnect() {
        let mut server = server(ServerSettings {
            password: Some("secret".into()),
            ..ServerSettings::default()
        });
        let first = join(&mut server, " secret ", "ann");
        let second = join(&mut server, "secret", "bob");

        assert_eq!(server.player_by_connection(first.id()).unwrap().id, 0);
        assert_eq!(server.player_by_connection(second.id()).unwrap().id, 1);

        server.transport_mut().drop_peer(&first, "quit");
        server.update();
        let ids: Vec<u32> = server.players().map(|p| p.id).collect();
        assert_eq!(ids, vec![1]);

        let events = server.drain_player_events();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[2], PlayerEvent::Left(p) if p.name == "ann"));
    }

    #[test]
    fn full_server_refuses_newcomers() {
        let mut server = server(ServerSettings {
            max_connections: 1,
            ..ServerSettings::default()
        });
        join(&mut server, "", "ann");
        let late = join(&mut server, "", "bob");
        assert_eq!(server.players().count(), 1);
        assert!(server
            .transport()
            .verdicts()
            .contains(&(late.id(), Verdict::Denied("Server is full".into()))));
    }

    #[test]
    fn server_info_describes_world() {
        let mut server = server(ServerSettings::default());
        let conn = join(&mut server, "", "ann");
        server.transport_mut().take_sent();

        server
            .transport_mut()
            .inject_data(&conn, vec![MessageType::RequestServerInfo.as_u8()]);
        server.update();

        let sent = server.transport_mut().take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].delivery, DeliveryMethod::ReliableOrdered);
        let (tag, payload) = split_message(&sent[0].bytes).unwrap();
        assert_eq!(tag, MessageType::ServerInfo.as_u8());
        let info = decode_world_info(payload).unwrap();
        assert_eq!((info.width, info.depth, info.height), (100, 100, 3));
        assert_eq!(info.total_chunks, 59);
        assert_eq!(info.player_count, 1);
    }

    #[test]
    fn world_request_streams_chunks_each_tick() {
        let mut server = server(ServerSettings::default());
        let conn = join(&mut server, "", "ann");
        server
            .transport_mut()
            .inject_data(&conn, vec![MessageType::RequestWorldChunks.as_u8()]);

        let stats = server.update();
        assert_eq!(stats.chunks_sent, 4);
        assert!(server.uploads().has_session(conn.id()));

        server
            .transport_mut()
            .inject_data(&conn, vec![MessageType::RequestWorldChunks.as_u8()]);
        server.update();
        assert_eq!(server.uploads().active_count(), 1);

        server.transport_mut().drop_peer(&conn, "lost");
        let stats = server.update();
        assert_eq!(stats.chunks_sent, 0);
        assert_eq!(server.uploads().active_count(), 0);
    }

    #[test]
    fn shutdown_resets_state() {
        let mut server = server(ServerSettings::default());
        join(&mut server, "", "ann");
        server.add_bot("bot");
        server.shutdown("maintenance");
        assert!(!server.is_running());
        assert_eq!(server.players().count(), 0);
        assert!(!server.transport().is_running());

        server.start().unwrap();
        assert_eq!(server.add_bot("bot"), 0);
    }

    #[test]
    fn kick_disconnects_human() {
        let mut server = server(ServerSettings::default());
        let conn = join(&mut server, "", "ann");
        server.kick(0, "bye");
        assert!(server.player(0).is_none());
        assert_eq!(
            server.transport().status(conn.id()),
            ConnectionStatus::Disconnected
        );
        let status = server.transport_mut().poll().unwrap();
        assert_eq!(
            status.kind,
            PacketKind::System(SystemEventKind::StatusChanged)
        );
        assert_eq!(decode_status(&status.payload).unwrap().1, "bye");
    }
}
