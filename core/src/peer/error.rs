//! Peer errors

use crate::network::TransportError;

/// Errors surfaced by the peer façade.
#[derive(Debug)]
pub enum PeerError {
    /// Failed to start the peer (bind, state database, bootstrap).
    StartFailed(String),
    /// State database error.
    Store(String),
    /// Network error.
    Network(String),
    /// The peer has not found any other ring member yet.
    NotBootstrapped,
    /// Resource not found.
    NotFound(String),
    /// IO error.
    Io(String),
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerError::StartFailed(e) => write!(f, "failed to start peer: {}", e),
            PeerError::Store(e) => write!(f, "state database error: {}", e),
            PeerError::Network(e) => write!(f, "network error: {}", e),
            PeerError::NotBootstrapped => write!(f, "peer has not joined a ring with other peers"),
            PeerError::NotFound(e) => write!(f, "not found: {}", e),
            PeerError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for PeerError {}

impl From<rusqlite::Error> for PeerError {
    fn from(e: rusqlite::Error) -> Self {
        PeerError::Store(e.to_string())
    }
}

impl From<std::io::Error> for PeerError {
    fn from(e: std::io::Error) -> Self {
        PeerError::Io(e.to_string())
    }
}

impl From<TransportError> for PeerError {
    fn from(e: TransportError) -> Self {
        PeerError::Network(e.to_string())
    }
}
