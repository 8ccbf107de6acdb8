use parking_lot::RwLock;
use std::collections::BTreeSet;

/// Peer identifiers barred from connecting or being connected to.
///
/// Entries are only ever added; there is no unblock operation.
#[derive(Debug, Default)]
pub struct Blocklist {
    peers: RwLock<BTreeSet<String>>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `peer`. Returns `false` if it was already blocked.
    pub fn insert(&self, peer: &str) -> bool {
        self.peers.write().insert(peer.to_string())
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.peers.read().contains(peer)
    }

    /// Blocked identifiers in sorted order.
    pub fn list(&self) -> Vec<String> {
        self.peers.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub(crate) fn clear(&self) {
        self.peers.write().clear();
    }
}
