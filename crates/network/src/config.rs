//! Node configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default namespace under which control paths are registered.
pub const DEFAULT_NAMESPACE: &str = "mesh";

/// Configuration for a single [`MeshNode`](crate::MeshNode).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Overrides the process base identifier in this node's id.
    pub base_id: Option<String>,
    /// Listening port. `0` lets the OS pick one; the chosen port becomes the
    /// node's port for identity and self-detection.
    pub port: u16,
    /// Root directory exposed through the local file system.
    pub root_dir: Option<PathBuf>,
    /// Interface names to bind. Empty binds the IPv4 wildcard address.
    pub interfaces: Vec<String>,
    /// Permit peering with addresses on this host's own network segment.
    pub allow_peer_local: bool,
    pub connect_timeout_ms: u64,
    /// First component of every control path.
    pub namespace: String,
    /// Close the node when the process receives ctrl-c.
    pub install_exit_hook: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            base_id: None,
            port: 0,
            root_dir: None,
            interfaces: Vec::new(),
            allow_peer_local: true,
            connect_timeout_ms: 30_000,
            namespace: DEFAULT_NAMESPACE.to_string(),
            install_exit_hook: true,
        }
    }
}

impl MeshConfig {
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
