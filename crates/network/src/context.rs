//! Process-wide mesh state.
//!
//! A [`MeshContext`] holds the state every node in a process shares: the
//! base identifier, the local network catalog, the blocklist, the message
//! file system, the cache of loaded file systems and the nodes started on
//! it. Nodes normally use
//! [`MeshContext::global`]; tests build their own contexts or call
//! [`MeshContext::reset`] between cases.

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use crate::blocklist::Blocklist;
use crate::error::Result;
use crate::local_net::LocalNetworkCatalog;
use crate::node::MeshNode;
use crate::vfs::{FileSystems, LocalFileSystem, MessageFileSystem, VirtualFileSystem};

static GLOBAL: Lazy<Arc<MeshContext>> = Lazy::new(|| Arc::new(MeshContext::new(random_base_id())));

pub struct MeshContext {
    base_id: String,
    /// Enumerated on first use, then reused until [`MeshContext::reset`].
    local_net: RwLock<Option<Arc<LocalNetworkCatalog>>>,
    blocklist: Blocklist,
    message_fs: Arc<MessageFileSystem>,
    fs_cache: Mutex<HashMap<Option<PathBuf>, FileSystems>>,
    next_session: AtomicU64,
    nodes: RwLock<Vec<Weak<MeshNode>>>,
}

impl MeshContext {
    pub fn new(base_id: impl Into<String>) -> Self {
        Self {
            base_id: base_id.into(),
            local_net: RwLock::new(None),
            blocklist: Blocklist::new(),
            message_fs: Arc::new(MessageFileSystem::new()),
            fs_cache: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(0),
            nodes: RwLock::new(Vec::new()),
        }
    }

    /// Context with a fixed catalog instead of live interface enumeration.
    pub fn with_local_network(base_id: impl Into<String>, catalog: LocalNetworkCatalog) -> Self {
        let context = Self::new(base_id);
        context.install_local_network(catalog);
        context
    }

    /// The shared context of this process.
    pub fn global() -> Arc<MeshContext> {
        Arc::clone(&GLOBAL)
    }

    pub fn base_id(&self) -> &str {
        &self.base_id
    }

    /// The local network catalog, enumerating interfaces on first call.
    pub fn local_network(&self) -> Result<Arc<LocalNetworkCatalog>> {
        if let Some(catalog) = self.local_net.read().as_ref() {
            return Ok(Arc::clone(catalog));
        }
        let mut slot = self.local_net.write();
        if let Some(catalog) = slot.as_ref() {
            return Ok(Arc::clone(catalog));
        }
        let catalog = Arc::new(LocalNetworkCatalog::discover()?);
        *slot = Some(Arc::clone(&catalog));
        Ok(catalog)
    }

    pub fn install_local_network(&self, catalog: LocalNetworkCatalog) {
        *self.local_net.write() = Some(Arc::new(catalog));
    }

    pub fn blocklist(&self) -> &Blocklist {
        &self.blocklist
    }

    pub fn message_fs(&self) -> &Arc<MessageFileSystem> {
        &self.message_fs
    }

    /// File systems for `root`, shared by every node rooted at the same place.
    pub fn load_file_systems(&self, root: Option<&Path>) -> FileSystems {
        let key = root.map(absolute_root);
        let mut cache = self.fs_cache.lock();
        if let Some(cached) = cache.get(&key) {
            return Arc::clone(cached);
        }

        let mut load: Vec<Arc<dyn VirtualFileSystem>> = Vec::with_capacity(2);
        load.push(Arc::clone(&self.message_fs) as Arc<dyn VirtualFileSystem>);
        if let Some(root) = &key {
            load.push(Arc::new(LocalFileSystem::new(root.clone())));
        }
        let filesystems: FileSystems = load.into();
        debug!("loaded {} file systems for {:?}", filesystems.len(), key);
        cache.insert(key, Arc::clone(&filesystems));
        filesystems
    }

    /// Placeholder name for a connection whose peer is not yet identified.
    pub(crate) fn next_temp_name(&self) -> String {
        format!("temp-uuid-{}", self.next_session.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub(crate) fn register_node(&self, node: &Arc<MeshNode>) {
        let mut nodes = self.nodes.write();
        nodes.retain(|weak| weak.strong_count() > 0);
        nodes.push(Arc::downgrade(node));
    }

    pub(crate) fn deregister_node(&self, node: &MeshNode) {
        self.nodes
            .write()
            .retain(|weak| weak.strong_count() > 0 && !std::ptr::eq(weak.as_ptr(), node));
    }

    /// Open nodes sharing this context, in start order.
    pub fn nodes(&self) -> Vec<Arc<MeshNode>> {
        self.nodes
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|node| !node.is_closed())
            .collect()
    }

    /// Drop the live connection to `peer` on every node of this context.
    /// Returns whether any node had one.
    pub fn drop_peer_everywhere(&self, peer: &str) -> bool {
        let mut dropped = false;
        for node in self.nodes() {
            dropped |= node.drop_peer(peer);
        }
        dropped
    }

    /// Add `peer` to the blocklist and drop it on every node. Returns whether
    /// a live connection was found.
    pub fn block_peer(&self, peer: &str) -> bool {
        if self.blocklist.insert(peer) {
            info!("blocked peer {}", peer);
        }
        self.drop_peer_everywhere(peer)
    }

    /// Drop all cached and accumulated state so the next node starts clean.
    /// Nodes already running stay registered.
    pub fn reset(&self) {
        self.fs_cache.lock().clear();
        self.blocklist.clear();
        self.message_fs.clear();
        *self.local_net.write() = None;
    }
}

fn random_base_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn absolute_root(root: &Path) -> PathBuf {
    if root.is_absolute() {
        return root.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(root))
        .unwrap_or_else(|_| root.to_path_buf())
}
