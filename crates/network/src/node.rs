//! Mesh node
//!
//! A [`MeshNode`] owns its listeners and connection registry and runs the
//! dedup protocol that decides whether a candidate address is worth dialing.
//! Every check-then-act sequence against the registry happens under the
//! node's single [`PeerTable`] lock, so concurrent dials, blocks, drops and
//! handshake completions never observe a duplicate peer.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::MeshConfig;
use crate::context::MeshContext;
use crate::control;
use crate::error::{MeshError, Result};
use crate::group::NodeGroup;
use crate::handshake::{NoopHandshake, PeerHandshake};
use crate::local_net::LocalNetworkCatalog;
use crate::registry::{ConnectionState, Direction, NewConnection, PeerTable, SlotId};
use crate::shutdown::ShutdownCoordinator;
use crate::transport::{self, ConnectionHandle};
use crate::vfs::FileSystems;

/// Why the dedup protocol declined to dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Blocked,
    /// The identifier belongs to a node in this process.
    SelfPeer,
    /// The address is this node's own listening endpoint.
    SelfAddress,
    LocalSegment,
    AlreadyConnected,
    AlreadyDialing,
    ShutDown,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            RejectReason::Blocked => "blocked",
            RejectReason::SelfPeer => "same process",
            RejectReason::SelfAddress => "own address",
            RejectReason::LocalSegment => "local segment",
            RejectReason::AlreadyConnected => "already connected",
            RejectReason::AlreadyDialing => "already dialing",
            RejectReason::ShutDown => "shut down",
        };
        f.write_str(reason)
    }
}

/// Outcome of [`MeshNode::request_peering`].
#[derive(Debug)]
pub enum PeeringDecision {
    Dialing(DialHandle),
    Rejected(RejectReason),
}

impl PeeringDecision {
    pub fn is_dialing(&self) -> bool {
        matches!(self, PeeringDecision::Dialing(_))
    }

    pub fn rejection(&self) -> Option<RejectReason> {
        match self {
            PeeringDecision::Rejected(reason) => Some(*reason),
            PeeringDecision::Dialing(_) => None,
        }
    }

    pub fn into_dial(self) -> Option<DialHandle> {
        match self {
            PeeringDecision::Dialing(handle) => Some(handle),
            PeeringDecision::Rejected(_) => None,
        }
    }
}

/// Pending outbound connect.
#[derive(Debug)]
pub struct DialHandle {
    addr: SocketAddr,
    result: oneshot::Receiver<Result<SlotId>>,
}

impl DialHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the socket to connect. Yields the registry slot on success.
    pub async fn wait(self) -> Result<SlotId> {
        self.result.await.unwrap_or(Err(MeshError::DialAborted))
    }
}

/// Future whose completion triggers the exit hook.
pub type ExitSignal = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseOrigin {
    Application,
    ExitHook,
}

/// Assembles a [`MeshNode`] from its collaborators.
pub struct MeshNodeBuilder {
    config: MeshConfig,
    context: Option<Arc<MeshContext>>,
    group: Option<Arc<NodeGroup>>,
    handshake: Option<Arc<dyn PeerHandshake>>,
    exit_signal: Option<ExitSignal>,
}

impl MeshNodeBuilder {
    pub fn new(config: MeshConfig) -> Self {
        Self {
            config,
            context: None,
            group: None,
            handshake: None,
            exit_signal: None,
        }
    }

    /// Process context; defaults to [`MeshContext::global`].
    pub fn context(mut self, context: Arc<MeshContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Group to join; defaults to a fresh group of one.
    pub fn group(mut self, group: Arc<NodeGroup>) -> Self {
        self.group = Some(group);
        self
    }

    pub fn handshake(mut self, handshake: Arc<dyn PeerHandshake>) -> Self {
        self.handshake = Some(handshake);
        self
    }

    /// Replace ctrl-c as the exit hook trigger. Has no effect unless
    /// `install_exit_hook` is set.
    pub fn exit_signal<F>(mut self, signal: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.exit_signal = Some(Box::pin(signal));
        self
    }

    /// Bind the listeners and bring the node up.
    ///
    /// Fails if interfaces cannot be enumerated or a requested address
    /// cannot be bound.
    pub async fn start(self) -> Result<Arc<MeshNode>> {
        let context = self.context.unwrap_or_else(MeshContext::global);
        let group = self.group.unwrap_or_default();
        let handshake = self
            .handshake
            .unwrap_or_else(|| Arc::new(NoopHandshake) as Arc<dyn PeerHandshake>);
        let exit_signal = self.exit_signal.unwrap_or_else(|| Box::pin(ctrl_c_signal()));
        let config = self.config;
        let local_net = context.local_network()?;

        let mut port = config.port;
        let mut interface = None;
        let mut listeners = Vec::new();
        if config.interfaces.is_empty() {
            let listener =
                transport::bind_listener(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))?;
            if port == 0 {
                port = listener_port(&listener)?;
            }
            listeners.push(listener);
        } else {
            for name in &config.interfaces {
                let Some(addrs) = local_net.interface_addresses(name) else {
                    warn!("missing specified NIC: {}", name);
                    continue;
                };
                for ip in addrs {
                    let listener = transport::bind_listener(SocketAddr::new(IpAddr::V4(ip), port))?;
                    if port == 0 {
                        port = listener_port(&listener)?;
                    }
                    listeners.push(listener);
                }
                interface = Some(name.clone());
            }
        }
        if listeners.is_empty() {
            return Err(MeshError::NoListeners(port));
        }

        let local_addrs = listeners
            .iter()
            .filter_map(|listener| listener.local_addr().ok())
            .collect::<Vec<_>>();
        let base = config.base_id.as_deref().unwrap_or_else(|| context.base_id());
        let id = match &interface {
            Some(name) => format!("{}-{}-{}", base, port, name),
            None => format!("{}-{}", base, port),
        };
        let file_systems = context.load_file_systems(config.root_dir.as_deref());
        let (listener_shutdown, _) = watch::channel(false);
        let (closed, _) = watch::channel(false);

        let node = Arc::new(MeshNode {
            id,
            port,
            interface,
            local_addrs,
            root_dir: config.root_dir.clone(),
            namespace: config.namespace.clone(),
            allow_peer_local: config.allow_peer_local,
            connect_timeout: config.connect_timeout(),
            context,
            local_net,
            group,
            file_systems,
            handshake,
            runtime: Handle::current(),
            table: Mutex::new(PeerTable::default()),
            last_event_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            listeners: Mutex::new(Vec::new()),
            listener_shutdown,
            exit_hook: Mutex::new(None),
            shutdown: ShutdownCoordinator::new(),
            closed,
        });

        {
            let mut accept_loops = node.listeners.lock();
            for listener in listeners {
                accept_loops.push(transport::spawn_accept_loop(
                    Arc::clone(&node),
                    listener,
                    node.listener_shutdown.subscribe(),
                ));
            }
        }
        if config.install_exit_hook {
            *node.exit_hook.lock() = Some(spawn_exit_hook(&node, exit_signal));
        }
        node.context.register_node(&node);
        control::register_node_paths(&node);
        node.group.join(&node);

        info!("server [{}] on {} @ {:?}", node.id, node.port, node.root_dir);
        Ok(node)
    }
}

fn listener_port(listener: &tokio::net::TcpListener) -> Result<u16> {
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|source| MeshError::Bind {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            source,
        })
}

async fn ctrl_c_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("exit hook could not listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
}

fn spawn_exit_hook(node: &Arc<MeshNode>, signal: ExitSignal) -> JoinHandle<()> {
    let weak = Arc::downgrade(node);
    tokio::spawn(async move {
        signal.await;
        let Some(node) = weak.upgrade() else {
            return;
        };
        info!("Running mesh shutdown hook..");
        node.close_from(CloseOrigin::ExitHook).await;
        info!("Shutdown hook for mesh complete.");
    })
}

/// One mesh endpoint.
pub struct MeshNode {
    id: String,
    port: u16,
    interface: Option<String>,
    local_addrs: Vec<SocketAddr>,
    root_dir: Option<PathBuf>,
    namespace: String,
    allow_peer_local: bool,
    connect_timeout: Duration,
    context: Arc<MeshContext>,
    local_net: Arc<LocalNetworkCatalog>,
    group: Arc<NodeGroup>,
    file_systems: FileSystems,
    handshake: Arc<dyn PeerHandshake>,
    runtime: Handle,
    table: Mutex<PeerTable>,
    last_event_ms: AtomicI64,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    listener_shutdown: watch::Sender<bool>,
    exit_hook: Mutex<Option<JoinHandle<()>>>,
    shutdown: ShutdownCoordinator,
    closed: watch::Sender<bool>,
}

impl MeshNode {
    pub fn builder(config: MeshConfig) -> MeshNodeBuilder {
        MeshNodeBuilder::new(config)
    }

    /// Start a node on the global context in a group of its own.
    pub async fn start(config: MeshConfig) -> Result<Arc<MeshNode>> {
        MeshNodeBuilder::new(config).start().await
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Last interface name that was bound, if binding was per interface.
    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn root_dir(&self) -> Option<&Path> {
        self.root_dir.as_deref()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn context(&self) -> &Arc<MeshContext> {
        &self.context
    }

    pub fn group(&self) -> &Arc<NodeGroup> {
        &self.group
    }

    pub fn file_systems(&self) -> &FileSystems {
        &self.file_systems
    }

    /// Time of the last dial request or connection event.
    pub fn last_activity(&self) -> DateTime<Utc> {
        let millis = self.last_event_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
    }

    fn touch(&self) {
        self.last_event_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn connection_count(&self) -> usize {
        self.table.lock().connections.len()
    }

    /// Connections whose peer has been identified.
    pub fn peered_count(&self) -> usize {
        self.table.lock().connections.identified_count()
    }

    pub fn dialing_count(&self) -> usize {
        self.table.lock().in_flight.dialing_count()
    }

    pub fn connections(&self) -> Vec<ConnectionState> {
        self.table.lock().connections.snapshot()
    }

    pub fn connection(&self, slot: SlotId) -> Option<ConnectionState> {
        self.table.lock().connections.get(slot).cloned()
    }

    pub fn is_connected_to(&self, peer: &str) -> bool {
        self.table.lock().connections.contains_name(peer)
    }

    pub fn is_dialing(&self, peer: &str) -> bool {
        self.table.lock().in_flight.is_dialing(peer)
    }

    pub fn has_pending_handshake(&self, addr: &SocketAddr) -> bool {
        self.table.lock().in_flight.has_pending_handshake(addr)
    }

    fn is_own_address(&self, addr: &SocketAddr) -> bool {
        if addr.port() != self.port {
            return false;
        }
        let ip = addr.ip();
        ip.is_unspecified()
            || ip.is_loopback()
            || self.local_net.is_host_address(ip)
            || self.local_addrs.iter().any(|local| local.ip() == ip)
    }

    /// Decide whether to dial `addr`, known as `peer` if the caller has an
    /// identifier for it, and start the dial if so.
    ///
    /// Rejections are ordinary outcomes; callers may simply retry later.
    pub fn request_peering(self: &Arc<Self>, peer: Option<&str>, addr: SocketAddr) -> PeeringDecision {
        if let Some(peer) = peer {
            if self.context.blocklist().contains(peer) {
                debug!("{} skipping blocked peer {}", self, peer);
                return PeeringDecision::Rejected(RejectReason::Blocked);
            }
        }
        self.touch();
        debug!("{} request connect to {:?} @ {}", self, peer, addr);

        if let Some(peer) = peer {
            if self.group.has_identifier(peer) {
                debug!("{} skipping {} .. it's me", self, peer);
                return PeeringDecision::Rejected(RejectReason::SelfPeer);
            }
        }
        if self.is_own_address(&addr) {
            debug!("{} skipping myself {}", self, addr);
            return PeeringDecision::Rejected(RejectReason::SelfAddress);
        }
        if !self.allow_peer_local && self.local_net.is_local_address(addr.ip()) {
            info!("peer reject local {}", addr);
            return PeeringDecision::Rejected(RejectReason::LocalSegment);
        }

        {
            let mut table = self.table.lock();
            if table.closed {
                return PeeringDecision::Rejected(RejectReason::ShutDown);
            }
            if let Some(peer) = peer {
                if table.connections.contains_name(peer) {
                    trace!("{} peer {} already connected", self.id, peer);
                    return PeeringDecision::Rejected(RejectReason::AlreadyConnected);
                }
            }
            if table.connections.contains_addr(&addr) {
                trace!("{} peer addr {} already connected", self.id, addr);
                return PeeringDecision::Rejected(RejectReason::AlreadyConnected);
            }
            if let Some(peer) = peer {
                if table.in_flight.is_dialing(peer) {
                    trace!("{} skip already peering {}", self.id, peer);
                    return PeeringDecision::Rejected(RejectReason::AlreadyDialing);
                }
            }
            if table.in_flight.has_pending_handshake(&addr) {
                trace!("{} skip already dialing addr {}", self.id, addr);
                return PeeringDecision::Rejected(RejectReason::AlreadyDialing);
            }
            table.in_flight.begin(peer, addr);
        }

        debug!("{} connecting to {:?} @ {}", self, peer, addr);
        PeeringDecision::Dialing(self.spawn_dial(peer.map(str::to_string), addr))
    }

    fn spawn_dial(self: &Arc<Self>, peer: Option<String>, addr: SocketAddr) -> DialHandle {
        let (tx, rx) = oneshot::channel();
        let node = Arc::clone(self);
        self.runtime.spawn(async move {
            let result = match transport::dial(addr, node.connect_timeout).await {
                Ok(stream) => node.on_connected(stream, addr, Direction::Outbound, peer),
                Err(err) => {
                    node.on_dial_failed(peer.as_deref(), addr, &err);
                    Err(err)
                }
            };
            let _ = tx.send(result);
        });
        DialHandle { addr, result: rx }
    }

    fn on_dial_failed(&self, peer: Option<&str>, addr: SocketAddr, err: &MeshError) {
        self.table.lock().in_flight.release(peer, &addr);
        debug!("{} dial {:?} @ {} failed: {}", self, peer, addr, err);
    }

    /// Register a connected socket and start the handshake if this node
    /// dialed it.
    pub(crate) fn on_connected(
        self: &Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
        direction: Direction,
        dialed_as: Option<String>,
    ) -> Result<SlotId> {
        let (handle, outbound) = ConnectionHandle::new();
        let name = self.context.next_temp_name();
        let (slot, initiator) = {
            let mut table = self.table.lock();
            if table.closed {
                if direction == Direction::Outbound {
                    table.in_flight.release(dialed_as.as_deref(), &remote);
                }
                return Err(MeshError::ShutDown);
            }
            let slot = table.connections.insert(NewConnection {
                name,
                remote,
                direction,
                dialed_as,
                handle: handle.clone(),
            });
            (slot, table.in_flight.take_pending(&remote))
        };
        self.touch();
        debug!("{} connected {} {:?} {}", self, slot, direction, remote);

        transport::spawn_connection(Arc::clone(self), stream, slot, handle, outbound);
        if initiator {
            debug!("{} >>> starting peering with {}", self, remote);
            self.handshake.start_handshake(self, slot);
        }
        Ok(slot)
    }

    pub(crate) fn on_bytes(self: &Arc<Self>, slot: SlotId, bytes: &[u8]) {
        self.table.lock().connections.touch(slot);
        trace!("{} received {} bytes on {}", self, bytes.len(), slot);
        self.handshake.on_bytes(self, slot, bytes);
    }

    pub(crate) fn on_closed(&self, slot: SlotId) {
        {
            let mut table = self.table.lock();
            if let Some(state) = table.connections.remove(slot) {
                if !state.identified {
                    if let Some(peer) = &state.dialed_as {
                        table.in_flight.finish_dialing(peer);
                    }
                }
                debug!("{} connection {} to {} ({}) closed", self.id, slot, state.remote, state.name);
            }
        }
        self.handshake.on_closed(slot);
    }

    /// Bind the real identifier learned by the handshake to `slot`.
    ///
    /// The connection is closed, and an error returned, when the name is
    /// blocked, belongs to this process's group, or loses a collision with
    /// another connection to the same peer. When both connections of a
    /// collision were opened in opposite directions, the one dialed by the
    /// node with the smaller identifier survives, so both ends keep the same
    /// socket.
    pub fn identify_peer(&self, slot: SlotId, name: &str) -> Result<()> {
        let mut table = self.table.lock();
        let state = table
            .connections
            .get(slot)
            .ok_or(MeshError::UnknownConnection(slot))?;
        let direction = state.direction;

        let rejected = if self.context.blocklist().contains(name) {
            Some(RejectReason::Blocked)
        } else if self.group.has_identifier(name) {
            Some(RejectReason::SelfPeer)
        } else {
            None
        };
        if let Some(reason) = rejected {
            if let Some(state) = table.connections.remove(slot) {
                state.handle.close();
                if let Some(peer) = &state.dialed_as {
                    table.in_flight.finish_dialing(peer);
                }
            }
            info!("{} closing {}: peer {} is {}", self.id, slot, name, reason);
            return Err(MeshError::NameRejected {
                name: name.to_string(),
                reason,
            });
        }

        if let Err(holder) = table.connections.rename(slot, name) {
            let holder_direction = table.connections.get(holder).map(|held| held.direction);
            let keep_new = match holder_direction {
                Some(existing) if existing != direction => {
                    let preferred = if self.id.as_str() < name {
                        Direction::Outbound
                    } else {
                        Direction::Inbound
                    };
                    direction == preferred
                }
                _ => false,
            };
            let loser = if keep_new { holder } else { slot };
            if let Some(state) = table.connections.remove(loser) {
                state.handle.close();
                if !state.identified {
                    if let Some(peer) = &state.dialed_as {
                        table.in_flight.finish_dialing(peer);
                    }
                }
            }
            debug!("{} duplicate peering with {}, closed {}", self.id, name, loser);
            if !keep_new {
                return Err(MeshError::NameCollision(name.to_string()));
            }
            if table.connections.rename(slot, name).is_err() {
                return Err(MeshError::NameCollision(name.to_string()));
            }
        }

        let dialed_as = table
            .connections
            .get(slot)
            .and_then(|state| state.dialed_as.clone());
        if let Some(peer) = dialed_as {
            table.in_flight.finish_dialing(&peer);
        }
        table.in_flight.finish_dialing(name);
        debug!("{} identified {} as {}", self.id, slot, name);
        Ok(())
    }

    /// Queue bytes on a connection's socket.
    pub fn send(&self, slot: SlotId, bytes: Vec<u8>) -> Result<()> {
        let handle = self
            .table
            .lock()
            .connections
            .get(slot)
            .map(|state| state.handle.clone())
            .ok_or(MeshError::UnknownConnection(slot))?;
        if handle.send(bytes) {
            Ok(())
        } else {
            Err(MeshError::ConnectionClosed(slot))
        }
    }

    /// Operator-forced connect. Waits for the socket; failures are only
    /// logged.
    pub async fn connect_peer(self: &Arc<Self>, addr: SocketAddr) -> bool {
        let handle = match self.request_peering(None, addr) {
            PeeringDecision::Dialing(handle) => handle,
            PeeringDecision::Rejected(reason) => {
                info!("{} peer connect to {} not attempted: {}", self, addr, reason);
                return false;
            }
        };
        match handle.wait().await {
            Ok(_) => true,
            Err(err) => {
                warn!("{} peer connect fail to {}: {}", self, addr, err);
                false
            }
        }
    }

    /// Block `peer` for the whole context and drop its connection on every
    /// node sharing it. Returns whether a live connection was found.
    pub fn block_peer(&self, peer: &str) -> bool {
        self.context.block_peer(peer)
    }

    /// Close the live connection identified as `peer`, if any.
    pub fn drop_peer(&self, peer: &str) -> bool {
        let dropped = self.table.lock().connections.remove_open_named(peer);
        match dropped {
            Some(state) => {
                state.handle.close();
                info!("{} dropped peer {} on {}", self, peer, state.slot);
                true
            }
            None => false,
        }
    }

    /// Close this node. Runs the teardown once; concurrent or later callers
    /// wait for it and get `false`.
    pub async fn close(&self) -> bool {
        self.close_from(CloseOrigin::Application).await
    }

    async fn close_from(&self, origin: CloseOrigin) -> bool {
        self.shutdown
            .run_once(|| async move {
                debug!("{} exiting", self);
                self.listener_shutdown.send_replace(true);
                let accept_loops: Vec<JoinHandle<()>> = self.listeners.lock().drain(..).collect();
                for result in futures::future::join_all(accept_loops).await {
                    if let Err(err) = result {
                        warn!("{} listener task failed: {}", self, err);
                    }
                }

                let drained = {
                    let mut table = self.table.lock();
                    table.closed = true;
                    table.in_flight.clear();
                    table.connections.drain()
                };
                for state in drained {
                    state.handle.close();
                }
                self.context.deregister_node(self);
                control::deregister_node_paths(self);

                if let Some(hook) = self.exit_hook.lock().take() {
                    if origin == CloseOrigin::Application {
                        hook.abort();
                    }
                }
                self.closed.send_replace(true);
            })
            .await
    }

    /// True while the exit hook is installed and has not fired.
    pub fn has_exit_hook(&self) -> bool {
        self.exit_hook.lock().is_some()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the node has been torn down.
    pub async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        loop {
            if *closed.borrow_and_update() {
                return;
            }
            if closed.changed().await.is_err() {
                return;
            }
        }
    }
}

impl fmt::Display for MeshNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (all, peered) = {
            let table = self.table.lock();
            (table.connections.len(), table.connections.identified_count())
        };
        write!(f, "MS:{{{},{},all={},sm={}}}", self.port, self.id, all, peered)
    }
}

impl fmt::Debug for MeshNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshNode")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("local_addrs", &self.local_addrs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ban_path, ban_report, stats_map_path, BAN_HOST_OPTION};
    use crate::local_net::InterfaceEntry;
    use crate::stats::decode_stats_map;
    use crate::vfs::{PathOptions, VirtualFileSystem};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::{mpsc, oneshot};

    fn test_context(base: &str) -> Arc<MeshContext> {
        let catalog = LocalNetworkCatalog::from_interfaces([
            InterfaceEntry::new("lo", IpAddr::from([127, 0, 0, 1])),
            InterfaceEntry::new("eth0", IpAddr::from([10, 1, 2, 3])),
        ]);
        Arc::new(MeshContext::with_local_network(base, catalog))
    }

    fn test_config(allow_peer_local: bool) -> MeshConfig {
        MeshConfig {
            allow_peer_local,
            connect_timeout_ms: 500,
            install_exit_hook: false,
            ..MeshConfig::default()
        }
    }

    async fn start_node(context: &Arc<MeshContext>, group: &Arc<NodeGroup>, allow_peer_local: bool) -> Arc<MeshNode> {
        MeshNode::builder(test_config(allow_peer_local))
            .context(Arc::clone(context))
            .group(Arc::clone(group))
            .start()
            .await
            .unwrap()
    }

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn policy_checks_run_before_dialing() {
        let context = test_context("base");
        let group = Arc::new(NodeGroup::new());
        let a = start_node(&context, &group, false).await;
        let b = start_node(&context, &group, false).await;

        let sibling = SocketAddr::from(([10, 9, 9, 9], b.port()));
        assert_eq!(
            a.request_peering(Some(b.id()), sibling).rejection(),
            Some(RejectReason::SelfPeer)
        );
        assert_eq!(
            a.request_peering(None, SocketAddr::from(([10, 1, 2, 3], 4000))).rejection(),
            Some(RejectReason::LocalSegment)
        );

        let remote = SocketAddr::from(([192, 0, 2, 10], 5000));
        assert!(a.request_peering(Some("remote-1"), remote).is_dialing());
        assert!(a.is_dialing("remote-1"));
        assert!(a.has_pending_handshake(&remote));
        assert_eq!(
            a.request_peering(Some("remote-1"), remote).rejection(),
            Some(RejectReason::AlreadyDialing)
        );

        a.close().await;
        b.close().await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn anonymous_dials_to_one_address_are_deduplicated() {
        let context = test_context("base");
        let node = start_node(&context, &Arc::new(NodeGroup::new()), true).await;
        let remote = SocketAddr::from(([192, 0, 2, 11], 5000));

        assert!(node.request_peering(None, remote).is_dialing());
        assert_eq!(
            node.request_peering(None, remote).rejection(),
            Some(RejectReason::AlreadyDialing)
        );
        assert_eq!(
            node.request_peering(Some("remote-2"), remote).rejection(),
            Some(RejectReason::AlreadyDialing)
        );
        assert!(!node.is_dialing("remote-2"));
        node.close().await;
    }

    #[tokio::test]
    async fn own_address_is_rejected() {
        let context = test_context("base");
        let node = start_node(&context, &Arc::new(NodeGroup::new()), true).await;

        for ip in [[127, 0, 0, 1], [10, 1, 2, 3], [0, 0, 0, 0]] {
            let own = SocketAddr::from((ip, node.port()));
            assert_eq!(
                node.request_peering(None, own).rejection(),
                Some(RejectReason::SelfAddress)
            );
        }
        node.close().await;
    }

    #[tokio::test]
    async fn failed_dial_releases_in_flight_state() {
        let context = test_context("base");
        let node = start_node(&context, &Arc::new(NodeGroup::new()), true).await;

        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = unused.local_addr().unwrap();
        drop(unused);

        let dial = node.request_peering(Some("gone"), target).into_dial().unwrap();
        assert!(dial.wait().await.is_err());
        assert!(!node.is_dialing("gone"));
        assert!(!node.has_pending_handshake(&target));
        assert!(node.request_peering(Some("gone"), target).is_dialing());
        node.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_start_one_dial() {
        let context = test_context("base");
        let node = start_node(&context, &Arc::new(NodeGroup::new()), true).await;
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = target.local_addr().unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let node = Arc::clone(&node);
            tasks.push(tokio::spawn(async move {
                node.request_peering(Some("peer-x"), addr).rejection()
            }));
        }

        let mut dials = 0;
        for task in tasks {
            match task.await.unwrap() {
                None => dials += 1,
                Some(reason) => assert!(matches!(
                    reason,
                    RejectReason::AlreadyDialing | RejectReason::AlreadyConnected
                )),
            }
        }
        assert_eq!(dials, 1);
        node.close().await;
    }

    #[tokio::test]
    async fn connected_peer_is_deduplicated_by_name_and_address() {
        let a = start_node(&test_context("a"), &Arc::new(NodeGroup::new()), true).await;
        let b = start_node(&test_context("b"), &Arc::new(NodeGroup::new()), true).await;
        let addr = loopback(b.port());

        let slot = a
            .request_peering(Some(b.id()), addr)
            .into_dial()
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(a.is_dialing(b.id()));
        assert!(!a.has_pending_handshake(&addr));

        a.identify_peer(slot, b.id()).unwrap();
        assert!(!a.is_dialing(b.id()));
        assert!(a.is_connected_to(b.id()));
        assert_eq!(a.peered_count(), 1);

        assert_eq!(
            a.request_peering(Some(b.id()), loopback(1)).rejection(),
            Some(RejectReason::AlreadyConnected)
        );
        assert_eq!(
            a.request_peering(None, addr).rejection(),
            Some(RejectReason::AlreadyConnected)
        );

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn second_connection_under_one_name_is_closed() {
        let context = test_context("a");
        let a = start_node(&context, &Arc::new(NodeGroup::new()), true).await;
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let second = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let one = a
            .request_peering(None, first.local_addr().unwrap())
            .into_dial()
            .unwrap()
            .wait()
            .await
            .unwrap();
        let two = a
            .request_peering(None, second.local_addr().unwrap())
            .into_dial()
            .unwrap()
            .wait()
            .await
            .unwrap();

        a.identify_peer(one, "peer-x").unwrap();
        assert!(matches!(
            a.identify_peer(two, "peer-x"),
            Err(MeshError::NameCollision(_))
        ));
        assert_eq!(a.connection_count(), 1);
        assert!(a.connection(one).is_some());
        a.close().await;
    }

    #[tokio::test]
    async fn blocked_peer_is_dropped_and_stays_rejected() {
        let a = start_node(&test_context("a"), &Arc::new(NodeGroup::new()), true).await;
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = target.local_addr().unwrap();

        let slot = a.request_peering(None, addr).into_dial().unwrap().wait().await.unwrap();
        a.identify_peer(slot, "peer-x").unwrap();

        assert!(a.block_peer("peer-x"));
        assert_eq!(a.connection_count(), 0);
        assert!(!a.block_peer("peer-x"));
        assert_eq!(
            a.request_peering(Some("peer-x"), addr).rejection(),
            Some(RejectReason::Blocked)
        );
        a.close().await;
    }

    #[tokio::test]
    async fn blocked_name_cannot_be_identified() {
        let context = test_context("a");
        let a = start_node(&context, &Arc::new(NodeGroup::new()), true).await;
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();

        context.blocklist().insert("peer-x");
        let slot = a
            .request_peering(None, target.local_addr().unwrap())
            .into_dial()
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert!(matches!(
            a.identify_peer(slot, "peer-x"),
            Err(MeshError::NameRejected { reason: RejectReason::Blocked, .. })
        ));
        assert_eq!(a.connection_count(), 0);
        a.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_close_tears_down_once() {
        let context = test_context("a");
        let node = start_node(&context, &Arc::new(NodeGroup::new()), true).await;
        let stats = crate::control::stats_path(node.namespace(), node.id());
        assert!(context.message_fs().contains(&stats));

        let (first, second) = tokio::join!(node.close(), node.close());
        assert!(first ^ second);
        assert!(node.is_closed());
        assert!(!context.message_fs().contains(&stats));
        assert_eq!(
            node.request_peering(None, loopback(1)).rejection(),
            Some(RejectReason::ShutDown)
        );
        node.wait_closed().await;
    }

    #[tokio::test]
    async fn ban_path_blocks_and_lists_peers() {
        let context = test_context("a");
        let node = start_node(&context, &Arc::new(NodeGroup::new()), true).await;

        assert_eq!(
            ban_report(&context, Some("peer-x")),
            "peer-x added to blocked peers\npeer-x connection not found\n"
        );
        assert_eq!(
            ban_report(&context, Some("peer-x")),
            "peer-x already in blocked peers\npeer-x connection not found\n"
        );

        let mut options = PathOptions::new();
        options.insert(BAN_HOST_OPTION.to_string(), "peer-y".to_string());
        let path = ban_path(node.namespace());
        context.message_fs().read(&path, &options).unwrap();

        let listing = context.message_fs().read(&path, &PathOptions::new()).unwrap();
        assert_eq!(String::from_utf8(listing).unwrap(), "peer-x\npeer-y\n");
        node.close().await;
    }

    async fn identified_link(node: &Arc<MeshNode>, target: &TcpListener, peer: &str) {
        let slot = node
            .request_peering(None, target.local_addr().unwrap())
            .into_dial()
            .unwrap()
            .wait()
            .await
            .unwrap();
        node.identify_peer(slot, peer).unwrap();
    }

    #[tokio::test]
    async fn block_drops_peer_on_every_node_of_the_context() {
        let context = test_context("a");
        let group = Arc::new(NodeGroup::new());
        let a = start_node(&context, &group, true).await;
        let b = start_node(&context, &group, true).await;
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        identified_link(&a, &target, "peer-x").await;
        identified_link(&b, &target, "peer-x").await;

        assert!(a.block_peer("peer-x"));
        assert!(!a.is_connected_to("peer-x"));
        assert!(!b.is_connected_to("peer-x"));
        assert_eq!(b.connection_count(), 0);

        identified_link(&b, &target, "peer-y").await;
        let mut options = PathOptions::new();
        options.insert(BAN_HOST_OPTION.to_string(), "peer-y".to_string());
        let report = context.message_fs().read(&ban_path(a.namespace()), &options).unwrap();
        assert_eq!(
            String::from_utf8(report).unwrap(),
            "peer-y added to blocked peers\npeer-y connection closed (async)\n"
        );
        assert!(!b.is_connected_to("peer-y"));

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn shared_paths_outlive_the_node_that_registered_them() {
        let context = test_context("a");
        let group = Arc::new(NodeGroup::new());
        let a = start_node(&context, &group, true).await;
        let b = start_node(&context, &group, true).await;
        a.block_peer("peer-x");

        b.close().await;
        drop(b);

        let listing = context
            .message_fs()
            .read(&ban_path(a.namespace()), &PathOptions::new())
            .unwrap();
        assert_eq!(String::from_utf8(listing).unwrap(), "peer-x\n");

        group.refresh_stats();
        let bytes = context
            .message_fs()
            .read(&stats_map_path(a.namespace()), &PathOptions::new())
            .unwrap();
        assert_eq!(decode_stats_map(&bytes).unwrap(), group.last_stats_map());
        a.close().await;
    }

    async fn start_with_exit_signal<F>(context: &Arc<MeshContext>, signal: F) -> Arc<MeshNode>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let config = MeshConfig {
            install_exit_hook: true,
            ..test_config(true)
        };
        MeshNode::builder(config)
            .context(Arc::clone(context))
            .group(Arc::new(NodeGroup::new()))
            .exit_signal(signal)
            .start()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn exit_signal_tears_the_node_down() {
        let context = test_context("a");
        let (fire, fired) = oneshot::channel::<()>();
        let node = start_with_exit_signal(&context, async move {
            let _ = fired.await;
        })
        .await;
        let stats = crate::control::stats_path(node.namespace(), node.id());
        assert!(node.has_exit_hook());

        fire.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), node.wait_closed())
            .await
            .unwrap();

        assert!(node.is_closed());
        assert!(!node.has_exit_hook());
        assert!(!context.message_fs().contains(&stats));
        assert!(context.nodes().is_empty());
        assert!(!node.close().await);
    }

    #[tokio::test]
    async fn application_close_cancels_exit_hook() {
        let context = test_context("a");
        let (_fire, fired) = oneshot::channel::<()>();
        let (alive, mut hook_gone) = mpsc::channel::<()>(1);
        let node = start_with_exit_signal(&context, async move {
            let _alive = alive;
            let _ = fired.await;
        })
        .await;

        assert!(node.close().await);
        assert!(!node.has_exit_hook());
        // The signal future is dropped only when the hook task is aborted.
        let gone = tokio::time::timeout(Duration::from_secs(5), hook_gone.recv()).await;
        assert_eq!(gone, Ok(None));
    }

    #[tokio::test]
    async fn display_reports_port_id_and_counts() {
        let context = test_context("a");
        let node = start_node(&context, &Arc::new(NodeGroup::new()), true).await;
        assert_eq!(node.id(), format!("a-{}", node.port()));
        assert_eq!(node.to_string(), format!("MS:{{{},a-{},all=0,sm=0}}", node.port(), node.port()));
        node.close().await;
    }
}
