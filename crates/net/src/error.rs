//! Error types for the networking layer.

use crate::protocol::ConnectionId;
use thiserror::Error;

/// Failures surfaced by codecs, dispatch and transports.
#[derive(Debug, Error)]
pub enum NetError {
    /// A packet did not match its declared layout; it is dropped.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// No application handler exists for this message type.
    #[error("no handler registered for message type {0}")]
    UnknownMessageType(u8),

    /// A second handler was registered for a message type.
    #[error("a handler for message type {0} is already registered")]
    DuplicateHandler(u8),

    /// The transport could not carry out the request.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The target connection is not (or no longer) usable.
    #[error("connection {0} is not connected")]
    NotConnected(ConnectionId),

    /// A join attempt was refused.
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl NetError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }
}

/// Reasons a connection attempt is denied.
///
/// The display strings are sent verbatim to the remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Credential did not match the configured server password.
    #[error("Incorrect password")]
    IncorrectPassword,
    /// Display name was empty or whitespace.
    #[error("Invalid name")]
    InvalidName,
    /// Player limit reached.
    #[error("Server is full")]
    ServerFull,
}
