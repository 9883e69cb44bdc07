//! QUIC transports backed by a private tokio runtime.
//!
//! Network I/O runs on the runtime's worker; the tick thread only exchanges
//! messages with it through unbounded channels, so `poll` and `send` never
//! block. Each connection is driven by one task:
//!
//! - the client opens the first uni stream and writes its hail frame;
//! - the server surfaces the hail as an approval packet and waits for
//!   [`Transport::approve`] or [`Transport::deny`];
//! - approval is answered with a verdict frame on the server's first uni
//!   stream, denial by closing the connection with the reason.
//!
//! After that, ordered messages share one long-lived uni stream per
//! direction, unordered messages get a fresh uni stream each, and unreliable
//! messages travel as datagrams when they fit.

use crate::channel::{read_frame, write_frame};
use crate::codec::truncate_utf8;
use crate::error::NetError;
use crate::handshake::Hail;
use crate::protocol::{
    Connection, ConnectionId, ConnectionStatus, DeliveryMethod, IncomingPacket, PeerRole,
    SystemEventKind, MAX_REASON_LEN,
};
use crate::transport::{
    bind_server_endpoint, client_endpoint, ClientTransport, ServerTransport, Transport,
};
use anyhow::{Context, Result};
use quinn::{ConnectionError, Endpoint, RecvStream, SendStream, VarInt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const CLOSE_NORMAL: u32 = 0;
const CLOSE_DENIED: u32 = 1;
const VERDICT_APPROVED: u8 = 1;
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

enum Verdict {
    Approve,
    Deny(String),
}

enum Outbound {
    Frame {
        bytes: Vec<u8>,
        delivery: DeliveryMethod,
    },
    Close(String),
}

enum Event {
    Packet(IncomingPacket),
    AwaitingApproval {
        connection: Connection,
        hail: Vec<u8>,
        verdict: oneshot::Sender<Verdict>,
        outbound: mpsc::UnboundedSender<Outbound>,
        quic: quinn::Connection,
    },
    Established {
        id: ConnectionId,
        quic: quinn::Connection,
    },
    Status {
        connection: Connection,
        status: ConnectionStatus,
        reason: String,
    },
}

struct Link {
    status: ConnectionStatus,
    outbound: mpsc::UnboundedSender<Outbound>,
    verdict: Option<oneshot::Sender<Verdict>>,
    quic: Option<quinn::Connection>,
}

/// Connection bookkeeping shared by both transports; only touched from the
/// tick thread.
#[derive(Default)]
struct Links {
    links: HashMap<ConnectionId, Link>,
}

impl Links {
    /// Fold one runtime event into the table, returning the packet it
    /// produces for the peer, if any.
    fn apply(&mut self, event: Event) -> Option<IncomingPacket> {
        match event {
            Event::Packet(packet) => Some(packet),
            Event::AwaitingApproval {
                connection,
                hail,
                verdict,
                outbound,
                quic,
            } => {
                self.links.insert(
                    connection.id(),
                    Link {
                        status: ConnectionStatus::RespondedAwaitingApproval,
                        outbound,
                        verdict: Some(verdict),
                        quic: Some(quic),
                    },
                );
                Some(IncomingPacket::approval(connection, hail))
            }
            Event::Established { id, quic } => {
                if let Some(link) = self.links.get_mut(&id) {
                    link.quic = Some(quic);
                }
                None
            }
            Event::Status {
                connection,
                status,
                reason,
            } => {
                if status == ConnectionStatus::Disconnected {
                    self.links.remove(&connection.id());
                } else if let Some(link) = self.links.get_mut(&connection.id()) {
                    if link.status != status && !link.status.can_transition_to(status) {
                        warn!(
                            %connection,
                            from = %link.status,
                            to = %status,
                            "ignoring illegal status change"
                        );
                        return None;
                    }
                    link.status = status;
                }
                Some(IncomingPacket::status(connection, status, &reason))
            }
        }
    }

    fn status(&self, id: ConnectionId) -> ConnectionStatus {
        self.links
            .get(&id)
            .map_or(ConnectionStatus::None, |link| link.status)
    }

    fn send(
        &mut self,
        id: ConnectionId,
        bytes: Vec<u8>,
        delivery: DeliveryMethod,
    ) -> Result<(), NetError> {
        let link = self
            .links
            .get(&id)
            .filter(|link| link.status == ConnectionStatus::Connected)
            .ok_or(NetError::NotConnected(id))?;
        link.outbound
            .send(Outbound::Frame { bytes, delivery })
            .map_err(|_| NetError::NotConnected(id))
    }

    fn close(&mut self, id: ConnectionId, reason: &str) -> Result<(), NetError> {
        let reason = truncate_utf8(reason, MAX_REASON_LEN);
        let link = self.links.get_mut(&id).ok_or(NetError::NotConnected(id))?;
        if !link.status.can_transition_to(ConnectionStatus::Disconnecting) {
            return Err(NetError::NotConnected(id));
        }
        if let Some(verdict) = link.verdict.take() {
            let _ = verdict.send(Verdict::Deny(reason.to_string()));
        } else {
            let _ = link.outbound.send(Outbound::Close(reason.to_string()));
        }
        link.status = ConnectionStatus::Disconnecting;
        Ok(())
    }

    fn close_all(&mut self, reason: &str) {
        let reason = truncate_utf8(reason, MAX_REASON_LEN);
        for (_, link) in self.links.drain() {
            match link.quic {
                Some(quic) => quic.close(VarInt::from_u32(CLOSE_NORMAL), reason.as_bytes()),
                None => {
                    let _ = link.outbound.send(Outbound::Close(reason.to_string()));
                }
            }
        }
    }
}

fn build_runtime() -> Result<Runtime, NetError> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("isoworld-net")
        .enable_all()
        .build()
        .map_err(|err| NetError::Transport(format!("failed to start network runtime: {err}")))
}

fn stop_runtime(runtime: Runtime, endpoint: Option<Endpoint>, reason: &str) {
    if let Some(endpoint) = endpoint {
        let reason = truncate_utf8(reason, MAX_REASON_LEN);
        endpoint.close(VarInt::from_u32(CLOSE_NORMAL), reason.as_bytes());
        runtime.block_on(async {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, endpoint.wait_idle()).await;
        });
    }
    runtime.shutdown_background();
}

/// Human-readable reason for a closed connection.
fn describe_close(err: &ConnectionError) -> String {
    match err {
        ConnectionError::ApplicationClosed(close) => {
            String::from_utf8_lossy(&close.reason).into_owned()
        }
        ConnectionError::LocallyClosed => "Closed locally".to_string(),
        ConnectionError::TimedOut => "Timed out".to_string(),
        other => other.to_string(),
    }
}

fn failure_reason(quic: &quinn::Connection, err: &anyhow::Error) -> String {
    match quic.close_reason() {
        Some(close) => describe_close(&close),
        None => err.to_string(),
    }
}

fn emit_status(
    events: &mpsc::UnboundedSender<Event>,
    connection: &Connection,
    status: ConnectionStatus,
    reason: impl Into<String>,
) {
    let _ = events.send(Event::Status {
        connection: connection.clone(),
        status,
        reason: reason.into(),
    });
}

fn emit_diagnostic(events: &mpsc::UnboundedSender<Event>, kind: SystemEventKind, text: &str) {
    let _ = events.send(Event::Packet(IncomingPacket::diagnostic(kind, text)));
}

async fn send_message(
    quic: &quinn::Connection,
    ordered: &mut Option<SendStream>,
    bytes: Vec<u8>,
    delivery: DeliveryMethod,
) -> Result<()> {
    match delivery {
        DeliveryMethod::Unreliable
            if quic
                .max_datagram_size()
                .is_some_and(|max| bytes.len() <= max) =>
        {
            quic.send_datagram(bytes.into())
                .context("Failed to send datagram")?;
        }
        DeliveryMethod::Unreliable | DeliveryMethod::ReliableUnordered => {
            let mut stream = quic.open_uni().await.context("Failed to open stream")?;
            write_frame(&mut stream, &bytes).await?;
            stream.finish().context("Failed to finish stream")?;
        }
        DeliveryMethod::ReliableOrdered => {
            let stream = match ordered.take() {
                Some(stream) => stream,
                None => quic
                    .open_uni()
                    .await
                    .context("Failed to open ordered stream")?,
            };
            write_frame(ordered.insert(stream), &bytes).await?;
        }
    }
    Ok(())
}

async fn read_stream(
    mut stream: RecvStream,
    connection: Connection,
    events: mpsc::UnboundedSender<Event>,
) {
    loop {
        match read_frame(&mut stream).await {
            Ok(Some(bytes)) => {
                if events
                    .send(Event::Packet(IncomingPacket::data(connection.clone(), bytes)))
                    .is_err()
                {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                debug!(%connection, "stream ended: {err:#}");
                return;
            }
        }
    }
}

/// Pump one established connection until it closes.
async fn drive_connection(
    quic: quinn::Connection,
    connection: Connection,
    events: mpsc::UnboundedSender<Event>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut ordered: Option<SendStream> = None;
    let reason = loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Frame { bytes, delivery }) => {
                    if let Err(err) = send_message(&quic, &mut ordered, bytes, delivery).await {
                        debug!(%connection, "send failed: {err:#}");
                    }
                }
                Some(Outbound::Close(reason)) => {
                    if let Some(stream) = ordered.as_mut() {
                        let _ = stream.finish();
                    }
                    quic.close(VarInt::from_u32(CLOSE_NORMAL), reason.as_bytes());
                    break reason;
                }
                None => {
                    quic.close(VarInt::from_u32(CLOSE_NORMAL), b"Transport dropped");
                    break "Transport dropped".to_string();
                }
            },
            stream = quic.accept_uni() => match stream {
                Ok(stream) => {
                    tokio::spawn(read_stream(stream, connection.clone(), events.clone()));
                }
                Err(err) => break describe_close(&err),
            },
            datagram = quic.read_datagram() => match datagram {
                Ok(bytes) => {
                    let _ = events.send(Event::Packet(IncomingPacket::data(
                        connection.clone(),
                        bytes.to_vec(),
                    )));
                }
                Err(err) => break describe_close(&err),
            },
        }
    };
    emit_status(&events, &connection, ConnectionStatus::Disconnected, reason);
}

async fn accept_loop(endpoint: Endpoint, events: mpsc::UnboundedSender<Event>) {
    let mut next_id: ConnectionId = 0;
    while let Some(incoming) = endpoint.accept().await {
        let connection = Connection::new(next_id, incoming.remote_address());
        next_id += 1;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        if events
            .send(Event::Packet(IncomingPacket::diagnostic(
                SystemEventKind::DebugMessage,
                &format!("incoming connection from {connection}"),
            )))
            .is_err()
        {
            return;
        }
        tokio::spawn(serve_connection(
            incoming,
            connection,
            events.clone(),
            outbound_tx,
            outbound_rx,
        ));
    }
}

async fn serve_connection(
    incoming: quinn::Incoming,
    connection: Connection,
    events: mpsc::UnboundedSender<Event>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let quic = match incoming.await {
        Ok(quic) => quic,
        Err(err) => {
            emit_diagnostic(
                &events,
                SystemEventKind::WarningMessage,
                &format!("handshake with {connection} failed: {}", describe_close(&err)),
            );
            return;
        }
    };

    let hail = match receive_hail(&quic).await {
        Ok(hail) => hail,
        Err(err) => {
            emit_diagnostic(
                &events,
                SystemEventKind::WarningMessage,
                &format!("no hail from {connection}: {}", failure_reason(&quic, &err)),
            );
            quic.close(VarInt::from_u32(CLOSE_DENIED), b"Missing hail");
            return;
        }
    };

    let (verdict_tx, verdict_rx) = oneshot::channel();
    let _ = events.send(Event::AwaitingApproval {
        connection: connection.clone(),
        hail,
        verdict: verdict_tx,
        outbound: outbound_tx,
        quic: quic.clone(),
    });

    let verdict = verdict_rx
        .await
        .unwrap_or_else(|_| Verdict::Deny("Server shutting down".to_string()));
    match verdict {
        Verdict::Approve => {
            if let Err(err) = send_verdict(&quic).await {
                let reason = failure_reason(&quic, &err);
                emit_status(&events, &connection, ConnectionStatus::Disconnected, reason);
                return;
            }
            emit_status(&events, &connection, ConnectionStatus::Connected, "");
            drive_connection(quic, connection, events, outbound_rx).await;
        }
        Verdict::Deny(reason) => {
            quic.close(VarInt::from_u32(CLOSE_DENIED), reason.as_bytes());
            emit_status(&events, &connection, ConnectionStatus::Disconnected, reason);
        }
    }
}

async fn receive_hail(quic: &quinn::Connection) -> Result<Vec<u8>> {
    let mut stream = quic.accept_uni().await.context("No hail stream")?;
    read_frame(&mut stream)
        .await?
        .context("Hail stream closed without a frame")
}

async fn send_verdict(quic: &quinn::Connection) -> Result<()> {
    let mut stream = quic.open_uni().await.context("Failed to open verdict stream")?;
    write_frame(&mut stream, &[VERDICT_APPROVED]).await?;
    stream.finish().context("Failed to finish verdict stream")?;
    Ok(())
}

async fn client_session(
    connecting: quinn::Connecting,
    connection: Connection,
    hail: Vec<u8>,
    events: mpsc::UnboundedSender<Event>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let quic = match connecting.await {
        Ok(quic) => quic,
        Err(err) => {
            emit_status(
                &events,
                &connection,
                ConnectionStatus::Disconnected,
                describe_close(&err),
            );
            return;
        }
    };
    let _ = events.send(Event::Established {
        id: connection.id(),
        quic: quic.clone(),
    });

    if let Err(err) = present_hail(&quic, &hail).await {
        let reason = failure_reason(&quic, &err);
        emit_status(&events, &connection, ConnectionStatus::Disconnected, reason);
        return;
    }
    emit_status(&events, &connection, ConnectionStatus::Connected, "");
    drive_connection(quic, connection, events, outbound).await;
}

async fn present_hail(quic: &quinn::Connection, hail: &[u8]) -> Result<()> {
    let mut send = quic.open_uni().await.context("Failed to open hail stream")?;
    write_frame(&mut send, hail).await?;
    send.finish().context("Failed to finish hail stream")?;

    let mut recv = quic.accept_uni().await.context("No verdict")?;
    let verdict = read_frame(&mut recv)
        .await?
        .context("Verdict stream closed without a frame")?;
    if verdict.first() != Some(&VERDICT_APPROVED) {
        anyhow::bail!("Connection refused");
    }
    Ok(())
}

/// Server transport accepting QUIC connections.
pub struct QuicServerTransport {
    bind_addr: SocketAddr,
    runtime: Option<Runtime>,
    endpoint: Option<Endpoint>,
    events: Option<mpsc::UnboundedReceiver<Event>>,
    links: Links,
}

impl QuicServerTransport {
    /// Transport that will listen on `bind_addr` once started.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            runtime: None,
            endpoint: None,
            events: None,
            links: Links::default(),
        }
    }
}

impl Transport for QuicServerTransport {
    fn role(&self) -> PeerRole {
        PeerRole::Server
    }

    fn is_running(&self) -> bool {
        self.runtime.is_some()
    }

    fn poll(&mut self) -> Option<IncomingPacket> {
        let events = self.events.as_mut()?;
        loop {
            let event = events.try_recv().ok()?;
            if let Some(packet) = self.links.apply(event) {
                return Some(packet);
            }
        }
    }

    fn send(
        &mut self,
        connection: ConnectionId,
        message: Vec<u8>,
        delivery: DeliveryMethod,
    ) -> Result<(), NetError> {
        self.links.send(connection, message, delivery)
    }

    fn approve(&mut self, connection: ConnectionId) -> Result<(), NetError> {
        let link = self
            .links
            .links
            .get_mut(&connection)
            .ok_or(NetError::NotConnected(connection))?;
        let verdict = link
            .verdict
            .take()
            .ok_or(NetError::NotConnected(connection))?;
        verdict
            .send(Verdict::Approve)
            .map_err(|_| NetError::NotConnected(connection))?;
        // Sends queue behind the verdict until the driver starts.
        link.status = ConnectionStatus::Connected;
        Ok(())
    }

    fn deny(&mut self, connection: ConnectionId, reason: &str) -> Result<(), NetError> {
        self.links.close(connection, reason)
    }

    fn disconnect(&mut self, connection: ConnectionId, reason: &str) -> Result<(), NetError> {
        self.links.close(connection, reason)
    }

    fn status(&self, connection: ConnectionId) -> ConnectionStatus {
        self.links.status(connection)
    }

    fn shutdown(&mut self, reason: &str) {
        self.links.close_all(reason);
        self.events = None;
        if let Some(runtime) = self.runtime.take() {
            info!(reason, "stopping server transport");
            stop_runtime(runtime, self.endpoint.take(), reason);
        }
    }
}

impl ServerTransport for QuicServerTransport {
    fn start(&mut self) -> Result<(), NetError> {
        if self.is_running() {
            return Err(NetError::Transport("server transport already running".into()));
        }
        let runtime = build_runtime()?;
        let endpoint = {
            let _guard = runtime.enter();
            bind_server_endpoint(self.bind_addr)
                .map_err(|err| NetError::Transport(format!("{err:#}")))?
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        runtime.spawn(accept_loop(endpoint.clone(), events_tx));

        self.endpoint = Some(endpoint);
        self.events = Some(events_rx);
        self.runtime = Some(runtime);
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref()?.local_addr().ok()
    }
}

impl Drop for QuicServerTransport {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Client transport holding at most one server connection.
pub struct QuicClientTransport {
    runtime: Option<Runtime>,
    endpoint: Option<Endpoint>,
    events_tx: mpsc::UnboundedSender<Event>,
    events: mpsc::UnboundedReceiver<Event>,
    links: Links,
    server: Option<ConnectionId>,
    next_id: ConnectionId,
}

impl QuicClientTransport {
    /// Start the client runtime and bind an ephemeral local endpoint.
    pub fn new() -> Result<Self, NetError> {
        let runtime = build_runtime()?;
        let endpoint = {
            let _guard = runtime.enter();
            client_endpoint().map_err(|err| NetError::Transport(format!("{err:#}")))?
        };
        let (events_tx, events) = mpsc::unbounded_channel();
        Ok(Self {
            runtime: Some(runtime),
            endpoint: Some(endpoint),
            events_tx,
            events,
            links: Links::default(),
            server: None,
            next_id: 0,
        })
    }
}

impl Transport for QuicClientTransport {
    fn role(&self) -> PeerRole {
        PeerRole::Client
    }

    fn is_running(&self) -> bool {
        self.runtime.is_some()
    }

    fn poll(&mut self) -> Option<IncomingPacket> {
        loop {
            let event = self.events.try_recv().ok()?;
            if let Some(packet) = self.links.apply(event) {
                return Some(packet);
            }
        }
    }

    fn send(
        &mut self,
        connection: ConnectionId,
        message: Vec<u8>,
        delivery: DeliveryMethod,
    ) -> Result<(), NetError> {
        self.links.send(connection, message, delivery)
    }

    fn approve(&mut self, _connection: ConnectionId) -> Result<(), NetError> {
        Err(NetError::Transport("clients do not approve connections".into()))
    }

    fn deny(&mut self, _connection: ConnectionId, _reason: &str) -> Result<(), NetError> {
        Err(NetError::Transport("clients do not approve connections".into()))
    }

    fn disconnect(&mut self, connection: ConnectionId, reason: &str) -> Result<(), NetError> {
        self.links.close(connection, reason)
    }

    fn status(&self, connection: ConnectionId) -> ConnectionStatus {
        self.links.status(connection)
    }

    fn shutdown(&mut self, reason: &str) {
        self.links.close_all(reason);
        self.server = None;
        if let Some(runtime) = self.runtime.take() {
            debug!(reason, "stopping client transport");
            stop_runtime(runtime, self.endpoint.take(), reason);
        }
    }
}

impl ClientTransport for QuicClientTransport {
    fn connect(&mut self, addr: SocketAddr, hail: &Hail) -> Result<(), NetError> {
        if let Some(id) = self.server {
            let status = self.links.status(id);
            if status != ConnectionStatus::None && status != ConnectionStatus::Disconnected {
                return Err(NetError::Transport(format!(
                    "cannot connect while connection is {status}"
                )));
            }
        }
        let (Some(runtime), Some(endpoint)) = (self.runtime.as_ref(), self.endpoint.as_ref())
        else {
            return Err(NetError::Transport("client transport is shut down".into()));
        };

        let connecting = {
            let _guard = runtime.enter();
            endpoint
                .connect(addr, "localhost")
                .map_err(|err| NetError::Transport(format!("failed to connect to {addr}: {err}")))?
        };

        let connection = Connection::new(self.next_id, addr);
        self.next_id += 1;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.links.links.insert(
            connection.id(),
            Link {
                status: ConnectionStatus::InitiatedConnect,
                outbound: outbound_tx,
                verdict: None,
                quic: None,
            },
        );
        self.server = Some(connection.id());
        emit_status(
            &self.events_tx,
            &connection,
            ConnectionStatus::InitiatedConnect,
            "",
        );
        info!(%addr, "connecting");
        runtime.spawn(client_session(
            connecting,
            connection,
            hail.encode(),
            self.events_tx.clone(),
            outbound_rx,
        ));
        Ok(())
    }

    fn server_connection(&self) -> Option<ConnectionId> {
        self.server
    }
}

impl Drop for QuicClientTransport {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
