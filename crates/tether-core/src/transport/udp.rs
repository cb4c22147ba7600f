use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::{mpsc, watch};

use tether_wire::{Message, Protocol};

use crate::Error;

/// Largest datagram we will receive.
const MAX_DATAGRAM: usize = 65535;

type PeerMap = Mutex<HashMap<String, mpsc::Sender<Vec<u8>>>>;

/// UDP listener: one `UdpSocket` fanned out into per-peer pseudo-connections.
///
/// A background reader loop receives datagrams; the first datagram from an
/// unknown peer allocates a [`UdpConn`] with a bounded datagram channel and
/// publishes it on the accept channel. Overflow of either channel drops the
/// datagram (or the new peer); UDP here is best-effort by design.
pub struct UdpListener {
    inner: Arc<UdpListenerInner>,
}

struct UdpListenerInner {
    socket: Arc<UdpSocket>,
    peers: Arc<PeerMap>,
    accept_tx: mpsc::Sender<UdpConn>,
    accept_rx: AsyncMutex<mpsc::Receiver<UdpConn>>,
    closed: watch::Sender<bool>,
    local: Option<SocketAddr>,
    msg_chan_size: usize,
    protocol: Arc<Protocol>,
}

impl UdpListener {
    pub async fn bind(
        target: &str,
        protocol: Arc<Protocol>,
        conn_chan_size: usize,
        msg_chan_size: usize,
    ) -> Result<Self, Error> {
        let socket = Arc::new(UdpSocket::bind(target).await?);
        let (accept_tx, accept_rx) = mpsc::channel(conn_chan_size.max(1));
        let (closed, _) = watch::channel(false);
        let inner = Arc::new(UdpListenerInner {
            local: socket.local_addr().ok(),
            socket,
            peers: Arc::new(Mutex::new(HashMap::new())),
            accept_tx,
            accept_rx: AsyncMutex::new(accept_rx),
            closed,
            msg_chan_size: msg_chan_size.max(1),
            protocol,
        });
        tokio::spawn(read_loop(inner.clone()));
        Ok(UdpListener { inner })
    }

    pub async fn accept(&self) -> Result<crate::Conn, Error> {
        let mut closed = self.inner.closed.subscribe();
        let mut rx = self.inner.accept_rx.lock().await;
        tokio::select! {
            _ = closed.changed() => Err(Error::ListenerClosed),
            conn = rx.recv() => conn.map(crate::Conn::Udp).ok_or(Error::ListenerClosed),
        }
    }

    pub fn close(&self) {
        let _ = self.inner.closed.send(true);
        self.inner.peers.lock().clear();
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local
    }
}

async fn read_loop(inner: Arc<UdpListenerInner>) {
    let mut closed = inner.closed.subscribe();
    let mut buffer = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, peer) = tokio::select! {
            _ = closed.changed() => break,
            received = inner.socket.recv_from(&mut buffer) => match received {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::debug!(%err, "udp read loop terminated");
                    break;
                }
            },
        };
        if len == 0 {
            continue;
        }
        let datagram = buffer[..len].to_vec();
        let key = peer.to_string();
        let sender = inner.peers.lock().get(&key).cloned();
        match sender {
            Some(tx) => {
                if tx.try_send(datagram).is_err() {
                    tracing::warn!(peer = %key, "udp peer channel full, datagram dropped");
                }
            }
            None => accept_peer(&inner, peer, key, datagram),
        }
    }
}

/// First datagram from a new peer: allocate its conn, queue the datagram,
/// publish the conn for accept.
fn accept_peer(inner: &Arc<UdpListenerInner>, peer: SocketAddr, key: String, datagram: Vec<u8>) {
    let (tx, rx) = mpsc::channel(inner.msg_chan_size);
    let conn = UdpConn {
        inner: Arc::new(UdpConnInner {
            socket: inner.socket.clone(),
            peer,
            key: key.clone(),
            peers: inner.peers.clone(),
            rx: AsyncMutex::new(rx),
            scratch: AsyncMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            protocol: inner.protocol.clone(),
        }),
    };
    // The first datagram always fits a fresh channel.
    let _ = tx.try_send(datagram);
    if inner.accept_tx.try_send(conn).is_err() {
        tracing::warn!(peer = %key, "udp accept channel full, peer dropped");
        return;
    }
    inner.peers.lock().insert(key, tx);
}

/// Pseudo-connection for one UDP peer.
#[derive(Clone)]
pub struct UdpConn {
    inner: Arc<UdpConnInner>,
}

struct UdpConnInner {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    key: String,
    peers: Arc<PeerMap>,
    rx: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
    scratch: AsyncMutex<Vec<u8>>,
    closed: AtomicBool,
    protocol: Arc<Protocol>,
}

impl UdpConn {
    /// Pop the next datagram and fill the message from it whole.
    pub async fn read_message(&self, msg: &mut Message) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ClosedNetwork);
        }
        let datagram = {
            let mut rx = self.inner.rx.lock().await;
            rx.recv().await.ok_or(Error::ClosedNetwork)?
        };
        msg.reset(&datagram, &self.inner.protocol)?;
        Ok(())
    }

    /// Serialize head+body and send one datagram to the peer.
    pub async fn write_message(&self, msg: &Message) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ClosedNetwork);
        }
        let mut scratch = self.inner.scratch.lock().await;
        scratch.clear();
        msg.to_bytes(&mut scratch, true, &self.inner.protocol)?;
        self.inner.socket.send_to(&scratch, self.inner.peer).await?;
        Ok(())
    }

    /// Remove the peer from the listener map; the dropped sender closes the
    /// datagram channel and wakes any pending read.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.peers.lock().remove(&self.inner.key);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.socket.local_addr().ok()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.inner.peer)
    }
}
