//! TCP transport
//!
//! Listener setup, accept loops, outbound dials and per-connection tasks.
//! Framing is not interpreted here: inbound bytes are handed to the node,
//! outbound bytes are written as queued.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, trace, warn};

use crate::error::{MeshError, Result};
use crate::node::MeshNode;
use crate::registry::{Direction, SlotId};

const LISTEN_BACKLOG: u32 = 1024;
const READ_BUFFER_SIZE: usize = 16 * 1024;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Close signal and write queue of one connection.
///
/// Cloning yields another handle to the same connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    closed: watch::Sender<bool>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl ConnectionHandle {
    /// New open handle plus the receiving end of its write queue.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (closed, _) = watch::channel(false);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let handle = Self {
            inner: Arc::new(HandleInner { closed, outbound }),
        };
        (handle, outbound_rx)
    }

    pub fn is_open(&self) -> bool {
        !*self.inner.closed.borrow()
    }

    /// Ask the connection task to shut the socket. Returns `false` if the
    /// connection was already closed.
    pub fn close(&self) -> bool {
        !self.inner.closed.send_replace(true)
    }

    /// Resolves once [`ConnectionHandle::close`] has been called.
    pub async fn closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        loop {
            if *closed.borrow_and_update() {
                return;
            }
            if closed.changed().await.is_err() {
                return;
            }
        }
    }

    /// Queue bytes for the socket. Returns `false` once the connection is closed.
    pub fn send(&self, bytes: Vec<u8>) -> bool {
        self.is_open() && self.inner.outbound.send(bytes).is_ok()
    }
}

/// Bind a listening socket with address reuse and the standard backlog.
pub(crate) fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let bind_err = |source| MeshError::Bind { addr, source };
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;
    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(addr).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)
}

/// Open an outbound stream, bounded by `connect_timeout`.
pub(crate) async fn dial(addr: SocketAddr, connect_timeout: Duration) -> Result<TcpStream> {
    match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            if let Err(err) = stream.set_nodelay(true) {
                trace!("set_nodelay on {} failed: {}", addr, err);
            }
            Ok(stream)
        }
        Ok(Err(source)) => Err(MeshError::Dial { addr, source }),
        Err(_) => Err(MeshError::DialTimeout {
            addr,
            timeout: connect_timeout,
        }),
    }
}

/// Accept inbound connections until `shutdown` flips to true. The listener
/// is dropped, and the socket closed, when the task returns.
pub(crate) fn spawn_accept_loop(
    node: Arc<MeshNode>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let local = listener.local_addr().ok();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        if let Err(err) = stream.set_nodelay(true) {
                            trace!("set_nodelay on {} failed: {}", remote, err);
                        }
                        if let Err(err) = node.on_connected(stream, remote, Direction::Inbound, None) {
                            debug!("{} dropped inbound {}: {}", node, remote, err);
                        }
                    }
                    Err(err) => {
                        warn!("accept on {:?} failed: {}", local, err);
                        sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }
        debug!("listener {:?} stopped", local);
    })
}

/// Pump a connected socket until either side closes it, then report the
/// close to the node.
pub(crate) fn spawn_connection(
    node: Arc<MeshNode>,
    stream: TcpStream,
    slot: SlotId,
    handle: ConnectionHandle,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (mut reader, mut writer) = stream.into_split();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = handle.closed() => {
                    trace!("{} closed locally", slot);
                    break;
                }
                Some(bytes) = outbound.recv() => {
                    if let Err(err) = writer.write_all(&bytes).await {
                        debug!("write to {} failed: {}", slot, err);
                        break;
                    }
                }
                read = reader.read(&mut buffer) => match read {
                    Ok(0) => {
                        debug!("{} closed by peer", slot);
                        break;
                    }
                    Ok(n) => node.on_bytes(slot, &buffer[..n]),
                    Err(err) => {
                        debug!("read from {} failed: {}", slot, err);
                        break;
                    }
                }
            }
        }
        let _ = writer.shutdown().await;
        handle.close();
        node.on_closed(slot);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_is_reported_once() {
        let (handle, _outbound) = ConnectionHandle::new();
        assert!(handle.is_open());
        assert!(handle.close());
        assert!(!handle.close());
        assert!(!handle.is_open());
        // Resolves immediately when already closed.
        handle.closed().await;
    }

    #[tokio::test]
    async fn closed_wakes_waiters() {
        let (handle, _outbound) = ConnectionHandle::new();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.closed().await })
        };
        tokio::task::yield_now().await;
        handle.close();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }

    #[tokio::test]
    async fn send_queues_until_closed() {
        let (handle, mut outbound) = ConnectionHandle::new();
        assert!(handle.send(b"ping".to_vec()));
        assert_eq!(outbound.recv().await, Some(b"ping".to_vec()));
        handle.close();
        assert!(!handle.send(b"late".to_vec()));
    }

    #[tokio::test]
    async fn dial_reports_refused_connections() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = dial(addr, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, MeshError::Dial { .. } | MeshError::DialTimeout { .. }));
    }

    #[tokio::test]
    async fn bind_listener_accepts_connections() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(dial(addr, Duration::from_secs(5)), listener.accept());
        assert!(client.is_ok());
        assert!(accepted.is_ok());
    }
}
