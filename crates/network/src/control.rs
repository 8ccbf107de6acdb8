//! Control-plane paths served through the message file system.
//!
//! - `/<ns>/<node id>/stats`: last stats lines of the node's group
//! - `/<ns>/statsMap`: aggregated counters, see [`crate::stats`]
//! - `/<ns>/host/ban`: list the blocklist, or block `host` and drop its
//!   connection

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::warn;

use crate::context::MeshContext;
use crate::group::NodeGroup;
use crate::node::MeshNode;
use crate::stats::{encode_stats_lines, encode_stats_map};
use crate::vfs::PathOptions;

pub const BAN_HOST_OPTION: &str = "host";

pub fn stats_path(namespace: &str, node_id: &str) -> String {
    format!("/{}/{}/stats", namespace, node_id)
}

pub fn stats_map_path(namespace: &str) -> String {
    format!("/{}/statsMap", namespace)
}

pub fn ban_path(namespace: &str) -> String {
    format!("/{}/host/ban", namespace)
}

/// Register the control paths for `node`. The shared paths resolve through
/// the context on every read, so they keep working after the node that
/// registered them is gone.
pub(crate) fn register_node_paths(node: &Arc<MeshNode>) {
    let fs = node.context().message_fs();
    let namespace = node.namespace();

    let group = Arc::downgrade(node.group());
    fs.add_path(stats_path(namespace, node.id()), move |_, _| {
        group
            .upgrade()
            .map(|group| encode_stats_lines(&group.last_stats()))
            .unwrap_or_default()
    });

    let context = Arc::downgrade(node.context());
    let fallback = Arc::downgrade(node.group());
    let ns = namespace.to_string();
    fs.add_path(stats_map_path(namespace), move |_, _| {
        let group = context
            .upgrade()
            .and_then(|context| namespace_group(&context, &ns))
            .or_else(|| fallback.upgrade());
        let Some(group) = group else {
            return Vec::new();
        };
        encode_stats_map(&group.last_stats_map()).unwrap_or_else(|err| {
            warn!("{}", err);
            Vec::new()
        })
    });

    let context = Arc::downgrade(node.context());
    fs.add_path(ban_path(namespace), move |_, options: &PathOptions| {
        context
            .upgrade()
            .map(|context| ban_report(&context, options.get(BAN_HOST_OPTION).map(String::as_str)))
            .unwrap_or_default()
            .into_bytes()
    });
}

pub(crate) fn deregister_node_paths(node: &MeshNode) {
    node.context()
        .message_fs()
        .remove_path(&stats_path(node.namespace(), node.id()));
}

/// Group of the newest open node serving `namespace`.
fn namespace_group(context: &MeshContext, namespace: &str) -> Option<Arc<NodeGroup>> {
    context
        .nodes()
        .into_iter()
        .rev()
        .find(|node| node.namespace() == namespace)
        .map(|node| Arc::clone(node.group()))
}

/// Body of the ban path. Without `host` it lists blocked peers, one per
/// line; with `host` it blocks that peer and drops its connections on every
/// node of the context.
pub fn ban_report(context: &MeshContext, host: Option<&str>) -> String {
    let mut out = String::new();
    let Some(host) = host else {
        for peer in context.blocklist().list() {
            let _ = writeln!(out, "{}", peer);
        }
        return out;
    };

    if context.blocklist().insert(host) {
        let _ = writeln!(out, "{} added to blocked peers", host);
    } else {
        let _ = writeln!(out, "{} already in blocked peers", host);
    }
    if context.drop_peer_everywhere(host) {
        let _ = writeln!(out, "{} connection closed (async)", host);
    } else {
        let _ = writeln!(out, "{} connection not found", host);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_namespaced() {
        assert_eq!(stats_path("mesh", "abc-5000"), "/mesh/abc-5000/stats");
        assert_eq!(stats_map_path("mesh"), "/mesh/statsMap");
        assert_eq!(ban_path("ops"), "/ops/host/ban");
    }
}
