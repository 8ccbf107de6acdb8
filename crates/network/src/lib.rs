//! meshd Network Core
//!
//! Mesh endpoints that accept and dial TCP peers while guaranteeing at most
//! one connection per peer, a process-wide blocklist, and an exactly-once
//! shutdown shared between the application and the process exit hook.
//!
//! ## Modules
//! - `node`: the mesh node and its peering dedup protocol
//! - `registry`: connection registry and in-flight dial bookkeeping
//! - `transport`: listeners, dialing and per-connection socket tasks
//! - `handshake`: pluggable identity exchange after connect
//! - `context`: process-wide state shared by every node
//! - `group`: nodes living in the same process, plus stats snapshots
//! - `blocklist`: identifiers this process refuses to peer with
//! - `local_net`: local interface catalog for self and segment checks
//! - `vfs`: message and local file systems
//! - `control`: stats and ban paths served through the message file system
//! - `stats`: wire encoding of stats payloads
//! - `shutdown`: exactly-once teardown coordination

pub mod blocklist;
pub mod config;
pub mod context;
pub mod control;
pub mod error;
pub mod group;
pub mod handshake;
pub mod local_net;
pub mod node;
pub mod registry;
pub mod shutdown;
pub mod stats;
pub mod transport;
pub mod vfs;

// ------------------------------------------------------------
// Re-exports for workspace-wide use
// ------------------------------------------------------------

pub use config::{MeshConfig, DEFAULT_NAMESPACE};
pub use error::{MeshError, Result};

pub use node::{DialHandle, ExitSignal, MeshNode, MeshNodeBuilder, PeeringDecision, RejectReason};
pub use registry::{ConnectionState, Direction, SlotId};
pub use transport::ConnectionHandle;
pub use handshake::{HelloHandshake, NoopHandshake, PeerHandshake};

pub use context::MeshContext;
pub use group::NodeGroup;
pub use blocklist::Blocklist;
pub use local_net::{InterfaceEntry, LocalNetworkCatalog};

pub use vfs::{FileSystems, LocalFileSystem, MessageFileSystem, PathOptions, VirtualFileSystem};
pub use stats::{decode_stats_map, encode_stats_lines, encode_stats_map};
