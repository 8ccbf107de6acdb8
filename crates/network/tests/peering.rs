//! Loopback peering tests
//!
//! Real nodes on 127.0.0.1 exchanging hello lines, checking that every pair
//! of nodes settles on exactly one identified connection.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use meshd_network::control::{ban_path, stats_map_path, BAN_HOST_OPTION};
use meshd_network::{
    decode_stats_map, HelloHandshake, InterfaceEntry, LocalNetworkCatalog, MeshConfig, MeshContext, MeshNode,
    NodeGroup, PathOptions, RejectReason, VirtualFileSystem,
};
use tokio::time::{sleep, Instant};

// ----------------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------------

fn context(base: &str) -> Arc<MeshContext> {
    let catalog = LocalNetworkCatalog::from_interfaces([InterfaceEntry::new("lo", IpAddr::from([127, 0, 0, 1]))]);
    Arc::new(MeshContext::with_local_network(base, catalog))
}

async fn start(context: &Arc<MeshContext>, group: Arc<NodeGroup>) -> Arc<MeshNode> {
    let config = MeshConfig {
        connect_timeout_ms: 2_000,
        install_exit_hook: false,
        ..MeshConfig::default()
    };
    MeshNode::builder(config)
        .context(Arc::clone(context))
        .group(group)
        .handshake(Arc::new(HelloHandshake::new()))
        .start()
        .await
        .expect("node starts")
}

fn addr_of(node: &MeshNode) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], node.port()))
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(10)).await;
    }
}

fn settled(a: &MeshNode, b: &MeshNode) -> bool {
    a.connection_count() == 1
        && b.connection_count() == 1
        && a.is_connected_to(b.id())
        && b.is_connected_to(a.id())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hello_exchange_identifies_both_ends() {
    let a = start(&context("alpha"), Arc::new(NodeGroup::new())).await;
    let b = start(&context("beta"), Arc::new(NodeGroup::new())).await;

    let dial = a.request_peering(Some(b.id()), addr_of(&b)).into_dial().unwrap();
    dial.wait().await.unwrap();
    wait_until("both ends identified", || settled(&a, &b)).await;

    assert_eq!(a.peered_count(), 1);
    assert_eq!(b.peered_count(), 1);
    assert!(!a.is_dialing(b.id()));
    assert_eq!(
        a.request_peering(Some(b.id()), addr_of(&b)).rejection(),
        Some(RejectReason::AlreadyConnected)
    );
    assert_eq!(
        b.request_peering(Some(a.id()), addr_of(&a)).rejection(),
        Some(RejectReason::AlreadyConnected)
    );

    a.close().await;
    wait_until("peer notices close", || b.connection_count() == 0).await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crossing_dials_collapse_to_one_connection() {
    let a = start(&context("alpha"), Arc::new(NodeGroup::new())).await;
    let b = start(&context("beta"), Arc::new(NodeGroup::new())).await;

    let from_a = a.request_peering(Some(b.id()), addr_of(&b));
    let from_b = b.request_peering(Some(a.id()), addr_of(&a));
    for decision in [from_a, from_b] {
        if let Some(dial) = decision.into_dial() {
            let _ = dial.wait().await;
        }
    }

    wait_until("one connection per side", || settled(&a, &b)).await;
    sleep(Duration::from_millis(100)).await;
    assert!(settled(&a, &b));
    assert_eq!(a.dialing_count(), 0);
    assert_eq!(b.dialing_count(), 0);

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocked_identity_is_refused_after_hello() {
    let a = start(&context("alpha"), Arc::new(NodeGroup::new())).await;
    let b_context = context("beta");
    let b = start(&b_context, Arc::new(NodeGroup::new())).await;
    b_context.blocklist().insert(a.id());

    let dial = a.request_peering(Some(b.id()), addr_of(&b)).into_dial().unwrap();
    dial.wait().await.unwrap();

    wait_until("both ends closed", || a.connection_count() == 0 && b.connection_count() == 0).await;
    assert!(!a.is_dialing(b.id()));

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ban_path_drops_live_peer() {
    let a = start(&context("alpha"), Arc::new(NodeGroup::new())).await;
    let b_context = context("beta");
    let b = start(&b_context, Arc::new(NodeGroup::new())).await;

    a.request_peering(Some(b.id()), addr_of(&b))
        .into_dial()
        .unwrap()
        .wait()
        .await
        .unwrap();
    wait_until("peering", || settled(&a, &b)).await;

    let mut options = PathOptions::new();
    options.insert(BAN_HOST_OPTION.to_string(), a.id().to_string());
    let report = b_context
        .message_fs()
        .read(&ban_path(b.namespace()), &options)
        .unwrap();
    let report = String::from_utf8(report).unwrap();
    assert_eq!(
        report,
        format!(
            "{id} added to blocked peers\n{id} connection closed (async)\n",
            id = a.id()
        )
    );

    wait_until("banned peer dropped", || a.connection_count() == 0).await;
    assert_eq!(b.connection_count(), 0);
    assert_eq!(
        b.request_peering(Some(a.id()), addr_of(&a)).rejection(),
        Some(RejectReason::Blocked)
    );

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn group_stats_are_served_as_stats_map() {
    let shared = context("alpha");
    let group = Arc::new(NodeGroup::new());
    let a = start(&shared, Arc::clone(&group)).await;
    let b = start(&shared, Arc::clone(&group)).await;

    // A listener that never answers the hello keeps the connection unidentified.
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    a.request_peering(None, silent.local_addr().unwrap())
        .into_dial()
        .unwrap()
        .wait()
        .await
        .unwrap();

    group.refresh_stats();
    let map = group.last_stats_map();
    assert_eq!(map.get("nodes"), Some(&2));
    assert_eq!(map.get("connections"), Some(&1));
    assert_eq!(map.get("peered"), Some(&0));
    assert_eq!(group.last_stats().len(), 2);

    let bytes = shared
        .message_fs()
        .read(&stats_map_path(a.namespace()), &PathOptions::new())
        .unwrap();
    assert_eq!(decode_stats_map(&bytes).unwrap(), map);

    a.close().await;
    b.close().await;
}
