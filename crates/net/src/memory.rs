//! Scripted in-process transport.
//!
//! Nothing leaves the process: tests (and embedded single-player use) inject
//! inbound packets and inspect what the peer sent. Status changes caused by
//! `approve`, `deny`, `disconnect` and `connect` are queued as status packets
//! exactly as a network transport would report them.

use crate::error::NetError;
use crate::handshake::Hail;
use crate::protocol::{
    Connection, ConnectionId, ConnectionStatus, DeliveryMethod, IncomingPacket, PeerRole,
};
use crate::transport::{ClientTransport, ServerTransport, Transport};
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use tracing::warn;

/// A message handed to [`Transport::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Target connection.
    pub connection: ConnectionId,
    /// Requested delivery.
    pub delivery: DeliveryMethod,
    /// Message bytes, tag included.
    pub bytes: Vec<u8>,
}

/// Outcome of an approval decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Connection was approved.
    Approved,
    /// Connection was denied with a reason.
    Denied(String),
}

/// In-memory [`Transport`].
#[derive(Debug)]
pub struct MemoryTransport {
    role: PeerRole,
    running: bool,
    inbound: VecDeque<IncomingPacket>,
    connections: HashMap<ConnectionId, (Connection, ConnectionStatus)>,
    sent: Vec<SentMessage>,
    verdicts: Vec<(ConnectionId, Verdict)>,
    hails: Vec<(SocketAddr, Hail)>,
    server: Option<ConnectionId>,
    next_id: ConnectionId,
}

impl MemoryTransport {
    fn with_role(role: PeerRole, running: bool) -> Self {
        Self {
            role,
            running,
            inbound: VecDeque::new(),
            connections: HashMap::new(),
            sent: Vec::new(),
            verdicts: Vec::new(),
            hails: Vec::new(),
            server: None,
            next_id: 0,
        }
    }

    /// Server-role transport; call [`ServerTransport::start`] before use.
    pub fn server() -> Self {
        Self::with_role(PeerRole::Server, false)
    }

    /// Client-role transport, running immediately.
    pub fn client() -> Self {
        Self::with_role(PeerRole::Client, true)
    }

    /// Queue an arbitrary inbound packet.
    pub fn inject(&mut self, packet: IncomingPacket) {
        self.inbound.push_back(packet);
    }

    /// Queue an application message from `connection`.
    pub fn inject_data(&mut self, connection: &Connection, message: Vec<u8>) {
        self.inject(IncomingPacket::data(connection.clone(), message));
    }

    /// Simulate a remote client arriving with the given hail.
    ///
    /// The connection waits for approval; an approval packet is queued.
    pub fn connect_peer(&mut self, credential: &str, name: &str) -> Connection {
        let connection = self.allocate();
        self.connections.insert(
            connection.id(),
            (connection.clone(), ConnectionStatus::RespondedAwaitingApproval),
        );
        let hail = Hail::new(credential, name).encode();
        self.inject(IncomingPacket::approval(connection.clone(), hail));
        connection
    }

    /// Simulate the remote side dropping a connection.
    pub fn drop_peer(&mut self, connection: &Connection, reason: &str) {
        self.set_status(connection.id(), ConnectionStatus::Disconnected, reason);
    }

    /// Client role: the server accepted our hail.
    pub fn accept_connection(&mut self) {
        if let Some(id) = self.server {
            self.set_status(id, ConnectionStatus::Connected, "");
        }
    }

    /// Client role: the server refused our hail.
    pub fn reject_connection(&mut self, reason: &str) {
        if let Some(id) = self.server {
            self.set_status(id, ConnectionStatus::Disconnected, reason);
        }
    }

    /// Take every message sent so far.
    pub fn take_sent(&mut self) -> Vec<SentMessage> {
        std::mem::take(&mut self.sent)
    }

    /// Approval decisions in the order they were made.
    pub fn verdicts(&self) -> &[(ConnectionId, Verdict)] {
        &self.verdicts
    }

    /// Hails presented through [`ClientTransport::connect`].
    pub fn hails(&self) -> &[(SocketAddr, Hail)] {
        &self.hails
    }

    /// Packets waiting to be polled.
    pub fn pending(&self) -> usize {
        self.inbound.len()
    }

    fn allocate(&mut self) -> Connection {
        let id = self.next_id;
        self.next_id += 1;
        let port = 40_000u16.wrapping_add(id as u16);
        Connection::new(id, SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    fn set_status(&mut self, id: ConnectionId, status: ConnectionStatus, reason: &str) {
        if let Some((connection, current)) = self.connections.get_mut(&id) {
            if !current.can_transition_to(status) {
                warn!(%connection, from = %current, to = %status, "ignoring illegal status change");
                return;
            }
            *current = status;
            let packet = IncomingPacket::status(connection.clone(), status, reason);
            self.inbound.push_back(packet);
        }
    }
}

impl Transport for MemoryTransport {
    fn role(&self) -> PeerRole {
        self.role
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn poll(&mut self) -> Option<IncomingPacket> {
        self.inbound.pop_front()
    }

    fn send(
        &mut self,
        connection: ConnectionId,
        message: Vec<u8>,
        delivery: DeliveryMethod,
    ) -> Result<(), NetError> {
        if self.status(connection) != ConnectionStatus::Connected {
            return Err(NetError::NotConnected(connection));
        }
        self.sent.push(SentMessage {
            connection,
            delivery,
            bytes: message,
        });
        Ok(())
    }

    fn approve(&mut self, connection: ConnectionId) -> Result<(), NetError> {
        if self.status(connection) != ConnectionStatus::RespondedAwaitingApproval {
            return Err(NetError::NotConnected(connection));
        }
        self.verdicts.push((connection, Verdict::Approved));
        self.set_status(connection, ConnectionStatus::Connected, "");
        Ok(())
    }

    fn deny(&mut self, connection: ConnectionId, reason: &str) -> Result<(), NetError> {
        if self.status(connection) != ConnectionStatus::RespondedAwaitingApproval {
            return Err(NetError::NotConnected(connection));
        }
        self.verdicts
            .push((connection, Verdict::Denied(reason.to_string())));
        self.set_status(connection, ConnectionStatus::Disconnected, reason);
        Ok(())
    }

    fn disconnect(&mut self, connection: ConnectionId, reason: &str) -> Result<(), NetError> {
        match self.status(connection) {
            ConnectionStatus::None | ConnectionStatus::Disconnected => {
                Err(NetError::NotConnected(connection))
            }
            _ => {
                self.set_status(connection, ConnectionStatus::Disconnected, reason);
                Ok(())
            }
        }
    }

    fn status(&self, connection: ConnectionId) -> ConnectionStatus {
        self.connections
            .get(&connection)
            .map_or(ConnectionStatus::None, |(_, status)| *status)
    }

    fn shutdown(&mut self, reason: &str) {
        let live: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, (_, status))| *status != ConnectionStatus::Disconnected)
            .map(|(id, _)| *id)
            .collect();
        for id in live {
            self.set_status(id, ConnectionStatus::Disconnected, reason);
        }
        self.running = self.role == PeerRole::Client;
        self.server = None;
    }
}

impl ServerTransport for MemoryTransport {
    fn start(&mut self) -> Result<(), NetError> {
        if self.running {
            return Err(NetError::Transport("transport already running".into()));
        }
        self.running = true;
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .then(|| SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
    }
}

impl ClientTransport for MemoryTransport {
    fn connect(&mut self, addr: SocketAddr, hail: &Hail) -> Result<(), NetError> {
        if let Some(id) = self.server {
            let status = self.status(id);
            if status != ConnectionStatus::Disconnected {
                return Err(NetError::Transport(format!(
                    "cannot connect while connection is {status}"
                )));
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        let connection = Connection::new(id, addr);
        self.connections
            .insert(id, (connection, ConnectionStatus::None));
        self.server = Some(id);
        self.hails.push((addr, hail.clone()));
        self.set_status(id, ConnectionStatus::InitiatedConnect, "");
        Ok(())
    }

    fn server_connection(&self) -> Option<ConnectionId> {
        self.server
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_status;
    use crate::protocol::{PacketKind, SystemEventKind};

    #[test]
    fn approval_queues_connected_status() {
        let mut transport = MemoryTransport::server();
        transport.start().unwrap();
        let peer = transport.connect_peer("", "ann");

        let approval = transport.poll().unwrap();
        assert_eq!(
            approval.kind,
            PacketKind::System(SystemEventKind::ConnectionApproval)
        );
        transport.approve(peer.id()).unwrap();
        let status = transport.poll().unwrap();
        assert_eq!(
            decode_status(&status.payload).unwrap().0,
            ConnectionStatus::Connected
        );
        assert_eq!(transport.verdicts(), &[(peer.id(), Verdict::Approved)]);
    }

    #[test]
    fn send_requires_connected_peer() {
        let mut transport = MemoryTransport::server();
        transport.start().unwrap();
        let peer = transport.connect_peer("", "ann");
        assert!(transport
            .send(peer.id(), vec![1], DeliveryMethod::ReliableOrdered)
            .is_err());
        transport.approve(peer.id()).unwrap();
        transport
            .send(peer.id(), vec![1], DeliveryMethod::ReliableOrdered)
            .unwrap();
        transport.drop_peer(&peer, "gone");
        assert!(transport
            .send(peer.id(), vec![1], DeliveryMethod::ReliableOrdered)
            .is_err());
        assert_eq!(transport.take_sent().len(), 1);
    }

    #[test]
    fn client_connect_is_single_shot() {
        let mut transport = MemoryTransport::client();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        transport.connect(addr, &Hail::new("", "ann")).unwrap();
        assert!(transport.connect(addr, &Hail::new("", "ann")).is_err());
        transport.reject_connection("Server is full");
        transport.connect(addr, &Hail::new("", "ann")).unwrap();
        assert_eq!(transport.hails().len(), 2);
    }

    #[test]
    fn dropping_a_closed_peer_queues_nothing() {
        let mut transport = MemoryTransport::server();
        transport.start().unwrap();
        let peer = transport.connect_peer("", "ann");
        transport.deny(peer.id(), "no").unwrap();
        while transport.poll().is_some() {}

        transport.drop_peer(&peer, "gone");
        assert_eq!(transport.pending(), 0);
        assert_eq!(transport.status(peer.id()), ConnectionStatus::Disconnected);
    }

    #[test]
    fn shutdown_disconnects_everyone() {
        let mut transport = MemoryTransport::server();
        transport.start().unwrap();
        let a = transport.connect_peer("", "a");
        let b = transport.connect_peer("", "b");
        transport.approve(a.id()).unwrap();
        transport.shutdown("stopping");
        assert_eq!(transport.status(a.id()), ConnectionStatus::Disconnected);
        assert_eq!(transport.status(b.id()), ConnectionStatus::Disconnected);
        assert!(!transport.is_running());
    }
}
