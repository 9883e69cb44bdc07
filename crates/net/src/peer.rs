//! Message dispatch on top of a [`Transport`].
//!
//! A [`Peer`] drains its transport once per tick and routes every packet:
//! system packets go to the handler registered for their
//! [`SystemEventKind`] (with logging and status fan-out as defaults), data
//! packets go to the handler registered for their leading message tag.
//! Handlers receive the caller's context `C` and the transport, so state
//! lives with the caller instead of in globals.

use crate::codec::{decode_status, split_message, PacketReader};
use crate::error::NetError;
use crate::protocol::{
    Connection, ConnectionStatus, IncomingPacket, MessageType, PacketKind, SystemEventKind,
};
use crate::transport::Transport;
use std::collections::HashMap;
use tracing::{debug, error, trace, warn};

/// Handler for one class of system packet.
pub type SystemHandler<T, C> = Box<dyn FnMut(&mut C, &mut T, &IncomingPacket)>;

/// Handler for one application message type; receives the payload after the tag.
pub type MessageHandler<T, C> =
    Box<dyn FnMut(&mut C, &mut T, &Connection, &[u8]) -> Result<(), NetError>>;

/// Observer notified of every status change.
pub type StatusObserver<T, C> = Box<dyn FnMut(&mut C, &mut T, &StatusChange)>;

/// A decoded status packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    /// Affected connection.
    pub connection: Connection,
    /// New status.
    pub status: ConnectionStatus,
    /// Reason supplied by whoever caused the change; may be empty.
    pub reason: String,
}

impl StatusChange {
    /// Decode a status packet.
    pub fn from_packet(packet: &IncomingPacket) -> Result<Self, NetError> {
        let connection = packet
            .connection
            .clone()
            .ok_or_else(|| NetError::malformed("status packet without connection"))?;
        let (status, reason) = decode_status(&packet.payload)?;
        Ok(Self {
            connection,
            status,
            reason,
        })
    }
}

/// Counters from one [`Peer::pump`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    /// Packets taken from the transport.
    pub packets: usize,
    /// Packets handled.
    pub dispatched: usize,
    /// Packets dropped as unknown or malformed.
    pub dropped: usize,
}

/// Transport plus handler tables.
pub struct Peer<T, C> {
    tag: &'static str,
    transport: T,
    system_handlers: HashMap<SystemEventKind, SystemHandler<T, C>>,
    message_handlers: HashMap<u8, MessageHandler<T, C>>,
    status_observers: Vec<StatusObserver<T, C>>,
}

impl<T: Transport, C> Peer<T, C> {
    /// Wrap a transport. The log tag follows its role.
    pub fn new(transport: T) -> Self {
        Self {
            tag: transport.role().tag(),
            transport,
            system_handlers: HashMap::new(),
            message_handlers: HashMap::new(),
            status_observers: Vec::new(),
        }
    }

    /// Log tag (`"server"` or `"client"`).
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    /// Install the handler for a system packet kind, replacing any previous one.
    pub fn set_system_handler(
        &mut self,
        kind: SystemEventKind,
        handler: impl FnMut(&mut C, &mut T, &IncomingPacket) + 'static,
    ) {
        if self
            .system_handlers
            .insert(kind, Box::new(handler))
            .is_some()
        {
            debug!(peer = self.tag, ?kind, "replaced system handler");
        }
    }

    /// Register the handler for an application message tag.
    ///
    /// A tag can only be registered once; the first handler stays.
    pub fn register_handler(
        &mut self,
        message_type: u8,
        handler: impl FnMut(&mut C, &mut T, &Connection, &[u8]) -> Result<(), NetError> + 'static,
    ) -> Result<(), NetError> {
        if self.message_handlers.contains_key(&message_type) {
            error!(
                peer = self.tag,
                message_type, "handler already registered for message type"
            );
            return Err(NetError::DuplicateHandler(message_type));
        }
        self.message_handlers
            .insert(message_type, Box::new(handler));
        Ok(())
    }

    /// Add an observer for status changes.
    pub fn on_status_change(
        &mut self,
        observer: impl FnMut(&mut C, &mut T, &StatusChange) + 'static,
    ) {
        self.status_observers.push(Box::new(observer));
    }

    /// Drain every queued packet and dispatch it. Never blocks.
    pub fn pump(&mut self, ctx: &mut C) -> PumpStats {
        let mut stats = PumpStats::default();
        if !self.transport.is_running() {
            return stats;
        }
        while let Some(packet) = self.transport.poll() {
            stats.packets += 1;
            match self.dispatch(ctx, &packet) {
                Ok(()) => stats.dispatched += 1,
                Err(err) => {
                    stats.dropped += 1;
                    let from = packet.connection.as_ref().map(|c| c.to_string());
                    warn!(peer = self.tag, from = ?from, "dropped packet: {err}");
                }
            }
        }
        if stats.packets > 0 {
            trace!(peer = self.tag, ?stats, "pumped");
        }
        stats
    }

    fn dispatch(&mut self, ctx: &mut C, packet: &IncomingPacket) -> Result<(), NetError> {
        let Self {
            tag,
            transport,
            system_handlers,
            message_handlers,
            status_observers,
        } = self;

        let kind = match packet.kind {
            PacketKind::Data => {
                let connection = packet
                    .connection
                    .as_ref()
                    .ok_or_else(|| NetError::malformed("data packet without connection"))?;
                let (message_type, payload) = split_message(&packet.payload)?;
                let handler = message_handlers
                    .get_mut(&message_type)
                    .ok_or(NetError::UnknownMessageType(message_type))?;
                debug!(
                    peer = *tag,
                    %connection,
                    message = ?MessageType::from_u8(message_type),
                    bytes = payload.len(),
                    "message"
                );
                return handler(ctx, transport, connection, payload);
            }
            PacketKind::System(kind) => kind,
        };

        if let Some(handler) = system_handlers.get_mut(&kind) {
            handler(ctx, transport, packet);
            return Ok(());
        }

        match kind {
            SystemEventKind::StatusChanged => {
                let change = StatusChange::from_packet(packet)?;
                debug!(
                    peer = *tag,
                    connection = %change.connection,
                    status = %change.status,
                    reason = %change.reason,
                    "status changed"
                );
                for observer in status_observers.iter_mut() {
                    observer(&mut *ctx, &mut *transport, &change);
                }
            }
            SystemEventKind::ConnectionApproval => {
                let connection = packet
                    .connection
                    .as_ref()
                    .ok_or_else(|| NetError::malformed("approval without connection"))?;
                warn!(peer = *tag, %connection, "no approval handler, refusing connection");
                transport.deny(connection.id(), "Connection refused")?;
            }
            SystemEventKind::DebugMessage => {
                debug!(peer = *tag, "{}", diagnostic_text(packet));
            }
            SystemEventKind::WarningMessage => {
                warn!(peer = *tag, "{}", diagnostic_text(packet));
            }
            SystemEventKind::ErrorMessage => {
                error!(peer = *tag, "{}", diagnostic_text(packet));
            }
        }
        Ok(())
    }

    /// Shared access to the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the transport, for sending.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

fn diagnostic_text(packet: &IncomingPacket) -> String {
    PacketReader::new(&packet.payload)
        .read_str()
        .unwrap_or_else(|_| String::from_utf8_lossy(&packet.payload).into_owned())
}
