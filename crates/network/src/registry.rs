//! Connection registry and in-flight peering sets.
//!
//! Connections live in an arena keyed by [`SlotId`]. The peer name is a
//! mutable field with a secondary index, so a placeholder name can be
//! replaced by the real identifier after the handshake without moving the
//! entry. The registry together with [`InFlightPeering`] forms the
//! [`PeerTable`], which a node guards with a single lock.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;

use crate::transport::ConnectionHandle;

/// Stable key of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u64);

impl SlotId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side opened the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// One live socket relationship.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub slot: SlotId,
    /// Placeholder until the handshake supplies the peer identifier.
    pub name: String,
    pub identified: bool,
    pub remote: SocketAddr,
    pub direction: Direction,
    /// Identifier this node was dialing when it opened the connection.
    pub dialed_as: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub handle: ConnectionHandle,
}

/// Parameters for a new registry entry.
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub name: String,
    pub remote: SocketAddr,
    pub direction: Direction,
    pub dialed_as: Option<String>,
    pub handle: ConnectionHandle,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_slot: u64,
    entries: HashMap<SlotId, ConnectionState>,
    by_name: HashMap<String, SlotId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, new: NewConnection) -> SlotId {
        self.next_slot += 1;
        let slot = SlotId(self.next_slot);
        let now = Utc::now();
        self.by_name.entry(new.name.clone()).or_insert(slot);
        self.entries.insert(
            slot,
            ConnectionState {
                slot,
                name: new.name,
                identified: false,
                remote: new.remote,
                direction: new.direction,
                dialed_as: new.dialed_as,
                connected_at: now,
                last_activity: now,
                handle: new.handle,
            },
        );
        slot
    }

    pub fn get(&self, slot: SlotId) -> Option<&ConnectionState> {
        self.entries.get(&slot)
    }

    pub fn slot_for_name(&self, name: &str) -> Option<SlotId> {
        self.by_name.get(name).copied()
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn contains_addr(&self, addr: &SocketAddr) -> bool {
        self.entries.values().any(|state| state.remote == *addr)
    }

    /// Rebind `slot` to `name`. Fails with the holder's slot if another
    /// entry already owns the name.
    pub fn rename(&mut self, slot: SlotId, name: &str) -> Result<(), SlotId> {
        if let Some(holder) = self.slot_for_name(name) {
            if holder != slot {
                return Err(holder);
            }
        }
        let Some(state) = self.entries.get_mut(&slot) else {
            return Ok(());
        };
        if self.by_name.get(&state.name) == Some(&slot) {
            self.by_name.remove(&state.name);
        }
        state.name = name.to_string();
        state.identified = true;
        self.by_name.insert(name.to_string(), slot);
        Ok(())
    }

    pub fn touch(&mut self, slot: SlotId) {
        if let Some(state) = self.entries.get_mut(&slot) {
            state.last_activity = Utc::now();
        }
    }

    pub fn remove(&mut self, slot: SlotId) -> Option<ConnectionState> {
        let state = self.entries.remove(&slot)?;
        if self.by_name.get(&state.name) == Some(&slot) {
            self.by_name.remove(&state.name);
        }
        Some(state)
    }

    /// Remove the entry named `name` if its connection is still open.
    pub fn remove_open_named(&mut self, name: &str) -> Option<ConnectionState> {
        let slot = self.slot_for_name(name)?;
        if !self.entries.get(&slot)?.handle.is_open() {
            return None;
        }
        self.remove(slot)
    }

    pub fn drain(&mut self) -> Vec<ConnectionState> {
        self.by_name.clear();
        let mut drained: Vec<ConnectionState> = self.entries.drain().map(|(_, state)| state).collect();
        drained.sort_by_key(|state| state.slot);
        drained
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn identified_count(&self) -> usize {
        self.entries.values().filter(|state| state.identified).count()
    }

    /// Copy of every entry, ordered by slot.
    pub fn snapshot(&self) -> Vec<ConnectionState> {
        let mut states: Vec<ConnectionState> = self.entries.values().cloned().collect();
        states.sort_by_key(|state| state.slot);
        states
    }
}

/// Peers being dialed and addresses whose handshake this node must start.
#[derive(Debug, Default)]
pub struct InFlightPeering {
    dialing: HashSet<String>,
    pending_handshake: HashSet<SocketAddr>,
}

impl InFlightPeering {
    pub fn is_dialing(&self, peer: &str) -> bool {
        self.dialing.contains(peer)
    }

    pub fn has_pending_handshake(&self, addr: &SocketAddr) -> bool {
        self.pending_handshake.contains(addr)
    }

    /// Mark a dial as started.
    pub fn begin(&mut self, peer: Option<&str>, addr: SocketAddr) {
        if let Some(peer) = peer {
            self.dialing.insert(peer.to_string());
        }
        self.pending_handshake.insert(addr);
    }

    /// Consume the pending-handshake marker for `addr`.
    pub fn take_pending(&mut self, addr: &SocketAddr) -> bool {
        self.pending_handshake.remove(addr)
    }

    pub fn finish_dialing(&mut self, peer: &str) -> bool {
        self.dialing.remove(peer)
    }

    /// Undo [`InFlightPeering::begin`] after a failed dial.
    pub fn release(&mut self, peer: Option<&str>, addr: &SocketAddr) {
        if let Some(peer) = peer {
            self.dialing.remove(peer);
        }
        self.pending_handshake.remove(addr);
    }

    pub fn dialing_count(&self) -> usize {
        self.dialing.len()
    }

    pub fn clear(&mut self) {
        self.dialing.clear();
        self.pending_handshake.clear();
    }
}

/// Everything the dedup protocol decides on, behind one lock.
#[derive(Debug, Default)]
pub struct PeerTable {
    pub connections: ConnectionRegistry,
    pub in_flight: InFlightPeering,
    /// Set once teardown starts; no new entries are admitted afterwards.
    pub closed: bool,
}
