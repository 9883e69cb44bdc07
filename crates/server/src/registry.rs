//! Players known to the server.

use isoworld_net::{Connection, ConnectionId};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

/// What controls a player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerKind {
    /// A remote human behind a connection.
    Human {
        /// The player's connection.
        connection: Connection,
    },
    /// A server-side automated player.
    Bot,
}

/// A participant in the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    /// Registry-assigned id; sequential from 0 and never reused in a run.
    pub id: u32,
    /// Display name.
    pub name: String,
    /// Controller.
    pub kind: PlayerKind,
}

impl Player {
    /// A human player; the id is assigned on registration.
    pub fn human(name: impl Into<String>, connection: Connection) -> Self {
        Self {
            id: 0,
            name: name.into(),
            kind: PlayerKind::Human { connection },
        }
    }

    /// A bot; the id is assigned on registration.
    pub fn bot(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            kind: PlayerKind::Bot,
        }
    }

    /// Whether a connection controls this player.
    pub fn is_human(&self) -> bool {
        matches!(self.kind, PlayerKind::Human { .. })
    }

    /// The controlling connection, for humans.
    pub fn connection(&self) -> Option<&Connection> {
        match &self.kind {
            PlayerKind::Human { connection } => Some(connection),
            PlayerKind::Bot => None,
        }
    }
}

/// Join/leave notifications for presentation layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    /// A player was added.
    Joined(Player),
    /// A player was removed.
    Left(Player),
}

/// Players indexed by id and by connection.
///
/// Both indices are always updated together.
#[derive(Debug, Default)]
pub struct PlayerRegistry {
    players: BTreeMap<u32, Player>,
    by_connection: HashMap<ConnectionId, u32>,
    next_id: u32,
    events: Vec<PlayerEvent>,
}

impl PlayerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a player under the next id and return it.
    ///
    /// A human whose connection already controls a player is refused.
    pub fn add(&mut self, player: Player) -> Option<u32> {
        if let Some(connection) = player.connection() {
            if let Some(existing) = self.by_connection.get(&connection.id()) {
                warn!(
                    %connection,
                    player = *existing,
                    "connection already controls a player"
                );
                return None;
            }
        }
        Some(self.insert(player))
    }

    /// Register a server-controlled player.
    pub fn add_bot(&mut self, name: impl Into<String>) -> u32 {
        self.insert(Player::bot(name))
    }

    fn insert(&mut self, mut player: Player) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        player.id = id;

        if let Some(connection) = player.connection() {
            self.by_connection.insert(connection.id(), id);
        }
        info!(
            player = id,
            name = %player.name,
            human = player.is_human(),
            "player joined"
        );
        self.events.push(PlayerEvent::Joined(player.clone()));
        self.players.insert(id, player);
        id
    }

    /// Remove a player; unknown ids are logged and ignored.
    pub fn remove(&mut self, id: u32) -> Option<Player> {
        let Some(player) = self.players.remove(&id) else {
            warn!(player = id, "tried to remove unknown player");
            return None;
        };
        if let Some(connection) = player.connection() {
            self.by_connection.remove(&connection.id());
        }
        info!(player = id, name = %player.name, "player left");
        self.events.push(PlayerEvent::Left(player.clone()));
        Some(player)
    }

    /// Player by id.
    pub fn get(&self, id: u32) -> Option<&Player> {
        self.players.get(&id)
    }

    /// Player controlled by a connection.
    pub fn get_by_connection(&self, connection: ConnectionId) -> Option<&Player> {
        self.by_connection
            .get(&connection)
            .and_then(|id| self.players.get(id))
    }

    /// Forget everyone and restart ids at 0.
    pub fn reset(&mut self) {
        self.players.clear();
        self.by_connection.clear();
        self.events.clear();
        self.next_id = 0;
    }

    /// Take queued join/leave events.
    pub fn drain_events(&mut self) -> Vec<PlayerEvent> {
        std::mem::take(&mut self.events)
    }

    /// Number of players.
    pub fn len(&self) -> usize {
        self.players.len()
    }

    /// Whether no players are registered.
    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Players in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }
}
