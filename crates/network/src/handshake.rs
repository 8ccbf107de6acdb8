//! Handshake collaborators.
//!
//! The handshake turns a freshly connected socket into an identified
//! peering: it ends by calling [`MeshNode::identify_peer`] with the remote
//! node's identifier. Only the dialing side starts it.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::node::MeshNode;
use crate::registry::SlotId;

pub trait PeerHandshake: Send + Sync + 'static {
    /// Called once the socket is up on a connection this node dialed.
    fn start_handshake(&self, node: &Arc<MeshNode>, slot: SlotId);

    /// Raw bytes received on `slot`.
    fn on_bytes(&self, node: &Arc<MeshNode>, slot: SlotId, bytes: &[u8]) {
        let _ = (node, slot, bytes);
    }

    fn on_closed(&self, slot: SlotId) {
        let _ = slot;
    }
}

/// Leaves every connection unidentified.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandshake;

impl PeerHandshake for NoopHandshake {
    fn start_handshake(&self, node: &Arc<MeshNode>, slot: SlotId) {
        trace!("{} has no handshake for {}", node, slot);
    }
}

const HELLO_PREFIX: &str = "HELLO ";
const MAX_HELLO_LEN: usize = 1024;

/// Line-based identity exchange.
///
/// The dialer sends `HELLO <node id>\n`; the acceptor identifies it, then
/// answers with its own hello line, which the dialer uses to identify the
/// acceptor.
#[derive(Debug, Default)]
pub struct HelloHandshake {
    state: Mutex<HelloState>,
}

#[derive(Debug, Default)]
struct HelloState {
    buffers: HashMap<SlotId, Vec<u8>>,
    initiated: HashSet<SlotId>,
    done: HashSet<SlotId>,
}

impl HelloHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    fn hello(node: &MeshNode) -> Vec<u8> {
        format!("{}{}\n", HELLO_PREFIX, node.id()).into_bytes()
    }
}

/// Peer identifier carried by a hello line, if the line is one.
fn parse_hello(line: &str) -> Option<&str> {
    let peer = line.strip_prefix(HELLO_PREFIX)?.trim();
    (!peer.is_empty()).then_some(peer)
}

impl PeerHandshake for HelloHandshake {
    fn start_handshake(&self, node: &Arc<MeshNode>, slot: SlotId) {
        self.state.lock().initiated.insert(slot);
        if let Err(err) = node.send(slot, Self::hello(node)) {
            debug!("{} hello to {} failed: {}", node, slot, err);
        }
    }

    fn on_bytes(&self, node: &Arc<MeshNode>, slot: SlotId, bytes: &[u8]) {
        let (line, initiated) = {
            let mut state = self.state.lock();
            if state.done.contains(&slot) {
                return;
            }
            let buffer = state.buffers.entry(slot).or_default();
            buffer.extend_from_slice(bytes);
            let Some(end) = buffer.iter().position(|b| *b == b'\n') else {
                if buffer.len() > MAX_HELLO_LEN {
                    warn!("{} oversized hello on {}", node, slot);
                    state.buffers.remove(&slot);
                    state.done.insert(slot);
                }
                return;
            };
            let line = String::from_utf8_lossy(&buffer[..end]).trim().to_string();
            state.buffers.remove(&slot);
            state.done.insert(slot);
            (line, state.initiated.remove(&slot))
        };

        let Some(peer) = parse_hello(&line) else {
            warn!("{} unexpected hello on {}: {:?}", node, slot, line);
            return;
        };
        match node.identify_peer(slot, peer) {
            Ok(()) => {
                if !initiated {
                    if let Err(err) = node.send(slot, Self::hello(node)) {
                        debug!("{} hello reply to {} failed: {}", node, slot, err);
                    }
                }
            }
            Err(err) => debug!("{} could not identify {} as {}: {}", node, slot, peer, err),
        }
    }

    fn on_closed(&self, slot: SlotId) {
        let mut state = self.state.lock();
        state.buffers.remove(&slot);
        state.initiated.remove(&slot);
        state.done.remove(&slot);
    }
}
