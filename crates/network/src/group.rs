//! Process-local node groups
//!
//! Nodes started in one process join a shared group. The group is how a
//! node recognises that a peer identifier is really one of its siblings,
//! and it holds the last stats snapshot served by the control paths.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::node::MeshNode;

struct GroupMember {
    id: String,
    node: Weak<MeshNode>,
}

/// Append-only membership plus the most recent stats snapshot.
#[derive(Default)]
pub struct NodeGroup {
    members: RwLock<Vec<GroupMember>>,
    last_stats: RwLock<Vec<String>>,
    last_stats_map: RwLock<BTreeMap<String, i32>>,
}

impl NodeGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, node: &Arc<MeshNode>) {
        self.members.write().push(GroupMember {
            id: node.id().to_string(),
            node: Arc::downgrade(node),
        });
    }

    pub fn has_identifier(&self, id: &str) -> bool {
        self.members.read().iter().any(|member| member.id == id)
    }

    pub fn member_ids(&self) -> Vec<String> {
        self.members.read().iter().map(|member| member.id.clone()).collect()
    }

    /// Members still alive, in join order.
    pub fn members(&self) -> Vec<Arc<MeshNode>> {
        self.members
            .read()
            .iter()
            .filter_map(|member| member.node.upgrade())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    pub fn last_stats(&self) -> Vec<String> {
        self.last_stats.read().clone()
    }

    pub fn last_stats_map(&self) -> BTreeMap<String, i32> {
        self.last_stats_map.read().clone()
    }

    /// Replace both snapshots.
    pub fn update_stats(&self, lines: Vec<String>, map: BTreeMap<String, i32>) {
        *self.last_stats.write() = lines;
        *self.last_stats_map.write() = map;
    }

    /// Recompute the snapshots from the live members: one summary line per
    /// member and counters summed across the group.
    pub fn refresh_stats(&self) {
        let members = self.members();
        let mut lines = Vec::with_capacity(members.len());
        let mut map = BTreeMap::new();
        let mut blocked = 0;
        for node in &members {
            lines.push(node.to_string());
            *map.entry("connections".to_string()).or_insert(0) += count(node.connection_count());
            *map.entry("peered".to_string()).or_insert(0) += count(node.peered_count());
            *map.entry("dialing".to_string()).or_insert(0) += count(node.dialing_count());
            blocked = blocked.max(count(node.context().blocklist().len()));
        }
        map.insert("nodes".to_string(), count(members.len()));
        map.insert("blocked".to_string(), blocked);
        self.update_stats(lines, map);
    }
}

fn count(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

impl fmt::Debug for NodeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeGroup")
            .field("members", &self.member_ids())
            .finish()
    }
}
