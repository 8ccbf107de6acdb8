use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::node::RejectReason;
use crate::registry::SlotId;

/// Errors surfaced by the mesh networking core.
///
/// Dedup decisions are not errors; they come back as [`RejectReason`]
/// values. Only startup failures, transport failures and handshake
/// bookkeeping problems end up here.
#[derive(thiserror::Error, Debug)]
pub enum MeshError {
    #[error("Failed to enumerate network interfaces: {0}")]
    InterfaceEnumeration(String),
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("No listening address could be bound on port {0}")]
    NoListeners(u16),
    #[error("Dial to {addr} failed: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Dial to {addr} timed out after {timeout:?}")]
    DialTimeout { addr: SocketAddr, timeout: Duration },
    #[error("Dial task ended without reporting a result")]
    DialAborted,
    #[error("Unknown connection {0}")]
    UnknownConnection(SlotId),
    #[error("Peer name {0} is already bound to another connection")]
    NameCollision(String),
    #[error("Peer name {name} rejected: {reason}")]
    NameRejected { name: String, reason: RejectReason },
    #[error("Connection {0} is closed")]
    ConnectionClosed(SlotId),
    #[error("Node is shut down")]
    ShutDown,
    #[error("Stats map cannot be encoded: {0}")]
    StatsEncode(String),
    #[error("Malformed stats map: {0}")]
    StatsDecode(String),
}

pub type Result<T, E = MeshError> = std::result::Result<T, E>;
