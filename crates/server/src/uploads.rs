//! Flow-controlled world uploads.
//!
//! Each connection that asks for the world gets a session; every tick a
//! bounded number of sessions advance by a bounded number of chunks so a
//! burst of joins cannot stall the simulation.

use isoworld_net::{
    chunk_count, chunk_span, encode_chunk, ConnectionId, ConnectionStatus, DeliveryMethod,
    Transport, DEFAULT_CHUNK_SIZE, MAX_CHUNK_CELLS,
};
use isoworld_world::Grid;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default number of sessions serviced per tick.
pub const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 2;

/// Default number of chunks one session sends per tick.
pub const DEFAULT_MAX_CHUNKS_PER_TICK: usize = 4;

/// Upload request failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    /// The connection already has a session in progress.
    #[error("connection {0} already has an upload in progress")]
    DuplicateRequest(ConnectionId),
}

/// Limits applied by [`UploadScheduler::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
    /// Sessions serviced per tick.
    pub max_concurrent_uploads: usize,
    /// Chunks sent per serviced session per tick.
    pub max_chunks_per_tick: usize,
    /// Cells per chunk.
    pub chunk_size: usize,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: DEFAULT_MAX_CONCURRENT_UPLOADS,
            max_chunks_per_tick: DEFAULT_MAX_CHUNKS_PER_TICK,
            chunk_size: DEFAULT_CHUNK_SIZE as usize,
        }
    }
}

/// Progress of one world transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    /// Receiving connection.
    pub connection: ConnectionId,
    /// Chunks in the full transfer.
    pub total_chunks: usize,
    /// Cells per chunk.
    pub chunk_size: usize,
    /// Next chunk to send.
    pub next_chunk_index: usize,
    /// Sequence id stamped on the next chunk.
    pub next_sequence_id: u16,
}

impl UploadSession {
    /// Whether every chunk has been sent.
    pub fn is_complete(&self) -> bool {
        self.next_chunk_index >= self.total_chunks
    }
}

/// Sessions in request order.
#[derive(Debug, Default)]
pub struct UploadScheduler {
    limits: UploadLimits,
    sessions: Vec<UploadSession>,
}

impl UploadScheduler {
    /// Scheduler with the given limits; zero limits are raised to 1 and the
    /// chunk size is capped so one chunk always fits in a frame.
    pub fn new(limits: UploadLimits) -> Self {
        if limits.chunk_size > MAX_CHUNK_CELLS {
            warn!(
                requested = limits.chunk_size,
                max = MAX_CHUNK_CELLS,
                "chunk size too large for one frame, clamping"
            );
        }
        Self {
            limits: UploadLimits {
                max_concurrent_uploads: limits.max_concurrent_uploads.max(1),
                max_chunks_per_tick: limits.max_chunks_per_tick.max(1),
                chunk_size: limits.chunk_size.clamp(1, MAX_CHUNK_CELLS),
            },
            sessions: Vec::new(),
        }
    }

    /// Active limits.
    pub fn limits(&self) -> UploadLimits {
        self.limits
    }

    /// Open a session streaming `volume` cells to `connection`.
    pub fn on_world_data_request(
        &mut self,
        connection: ConnectionId,
        volume: usize,
    ) -> Result<(), UploadError> {
        if self.has_session(connection) {
            return Err(UploadError::DuplicateRequest(connection));
        }
        let total_chunks = chunk_count(volume, self.limits.chunk_size);
        info!(connection, total_chunks, "world upload queued");
        self.sessions.push(UploadSession {
            connection,
            total_chunks,
            chunk_size: self.limits.chunk_size,
            next_chunk_index: 0,
            next_sequence_id: 0,
        });
        Ok(())
    }

    /// Drop the session for a connection, if any.
    pub fn cancel(&mut self, connection: ConnectionId) {
        let before = self.sessions.len();
        self.sessions.retain(|s| s.connection != connection);
        if self.sessions.len() != before {
            debug!(connection, "world upload cancelled");
        }
    }

    /// Drop every session.
    pub fn clear(&mut self) {
        self.sessions.clear();
    }

    /// Send this tick's chunks and return how many went out.
    ///
    /// Sessions whose connection is no longer connected are dropped first.
    /// Then the first `max_concurrent_uploads` sessions in request order each
    /// send up to `max_chunks_per_tick` chunks; finished sessions are removed
    /// before returning.
    pub fn tick(&mut self, grid: &dyn Grid, transport: &mut dyn Transport) -> usize {
        self.sessions.retain(|session| {
            let status = transport.status(session.connection);
            if status != ConnectionStatus::Connected {
                debug!(connection = session.connection, %status, "dropping upload");
                return false;
            }
            true
        });

        let volume = grid.dimensions().volume();
        let mut sent = 0;
        let mut failed = Vec::new();
        for session in self
            .sessions
            .iter_mut()
            .take(self.limits.max_concurrent_uploads)
        {
            for _ in 0..self.limits.max_chunks_per_tick {
                if session.is_complete() {
                    break;
                }
                match send_next_chunk(session, volume, grid, transport) {
                    Ok(()) => sent += 1,
                    Err(err) => {
                        warn!(connection = session.connection, "upload aborted: {err}");
                        failed.push(session.connection);
                        break;
                    }
                }
            }
        }

        self.sessions.retain(|session| {
            if failed.contains(&session.connection) {
                return false;
            }
            if session.is_complete() {
                info!(
                    connection = session.connection,
                    chunks = session.total_chunks,
                    "world upload complete"
                );
                return false;
            }
            true
        });
        sent
    }

    /// Number of open sessions.
    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether a connection has an open session.
    pub fn has_session(&self, connection: ConnectionId) -> bool {
        self.sessions.iter().any(|s| s.connection == connection)
    }

    /// Open sessions in request order.
    pub fn sessions(&self) -> &[UploadSession] {
        &self.sessions
    }
}

fn send_next_chunk(
    session: &mut UploadSession,
    volume: usize,
    grid: &dyn Grid,
    transport: &mut dyn Transport,
) -> anyhow::Result<()> {
    let span = chunk_span(volume, session.chunk_size, session.next_chunk_index)
        .ok_or_else(|| anyhow::anyhow!("chunk {} outside world", session.next_chunk_index))?;
    let start = span.start;
    let cells = grid.snapshot(span)?;
    let message = encode_chunk(&cells, start, session.next_sequence_id)?;
    transport.send(
        session.connection,
        message,
        DeliveryMethod::ReliableUnordered,
    )?;
    session.next_chunk_index += 1;
    session.next_sequence_id = session.next_sequence_id.wrapping_add(1);
    Ok(())
}
