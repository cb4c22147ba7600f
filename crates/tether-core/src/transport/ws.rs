use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsFrame;

use tether_wire::{Message, Protocol};

use crate::Error;

/// Byte stream underneath a WebSocket: plain TCP or a TLS session.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

type WsStream = WebSocketStream<Box<dyn RawStream>>;

/// Outcome of decoding one WebSocket frame.
pub enum Decoded {
    /// The message was filled and should be dispatched.
    Filled,
    /// Protocol-level frame, consumed by the transform.
    Skip,
    /// Protocol-level frame that wants a text reply on the wire.
    Reply(String),
    /// The peer asked to close.
    Closed,
}

/// Payload produced for an outgoing frame.
pub enum WsPayload {
    Binary(Vec<u8>),
    Text(String),
}

/// Converts WebSocket frame payloads to and from [`Message`]s.
///
/// The default [`BinaryTransform`] ships whole tether frames in binary
/// WebSocket messages; the SOCKET.IO adapter in
/// [`socketio`](crate::transport::socketio) is another implementation.
pub trait FrameTransform: Send + Sync {
    fn decode(
        &self,
        sid: u64,
        payload: &[u8],
        msg: &mut Message,
        protocol: &Protocol,
    ) -> Result<Decoded, Error>;

    fn encode(&self, msg: &Message, protocol: &Protocol) -> Result<WsPayload, Error>;
}

/// Default transform: the frame payload is a complete wire frame.
pub struct BinaryTransform;

impl FrameTransform for BinaryTransform {
    fn decode(
        &self,
        _sid: u64,
        payload: &[u8],
        msg: &mut Message,
        protocol: &Protocol,
    ) -> Result<Decoded, Error> {
        msg.reset(payload, protocol)?;
        Ok(Decoded::Filled)
    }

    fn encode(&self, msg: &Message, protocol: &Protocol) -> Result<WsPayload, Error> {
        let mut out = Vec::new();
        msg.to_bytes(&mut out, true, protocol)?;
        Ok(WsPayload::Binary(out))
    }
}

/// One upgraded WebSocket connection.
#[derive(Clone)]
pub struct WsConn {
    inner: Arc<WsConnInner>,
}

struct WsConnInner {
    sink: AsyncMutex<SplitSink<WsStream, WsFrame>>,
    stream: AsyncMutex<SplitStream<WsStream>>,
    transform: Arc<dyn FrameTransform>,
    closed: AtomicBool,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    protocol: Arc<Protocol>,
}

impl WsConn {
    pub fn new(
        ws: WsStream,
        local: Option<SocketAddr>,
        peer: Option<SocketAddr>,
        transform: Arc<dyn FrameTransform>,
        protocol: Arc<Protocol>,
    ) -> Self {
        let (sink, stream) = ws.split();
        WsConn {
            inner: Arc::new(WsConnInner {
                sink: AsyncMutex::new(sink),
                stream: AsyncMutex::new(stream),
                transform,
                closed: AtomicBool::new(false),
                local,
                peer,
                protocol,
            }),
        }
    }

    /// Read frames until the transform yields a dispatchable message.
    ///
    /// Pings are answered inline; close frames and clean EOF surface as
    /// [`Error::ClosedNetwork`].
    pub async fn read_message(&self, sid: u64, msg: &mut Message) -> Result<(), Error> {
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(Error::ClosedNetwork);
            }
            let frame = {
                let mut stream = self.inner.stream.lock().await;
                stream.next().await
            };
            let frame = match frame {
                None => return Err(Error::ClosedNetwork),
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(frame)) => frame,
            };
            let payload: &[u8] = match &frame {
                WsFrame::Close(_) => return Err(Error::ClosedNetwork),
                WsFrame::Ping(data) => {
                    let mut sink = self.inner.sink.lock().await;
                    let _ = sink.send(WsFrame::Pong(data.clone())).await;
                    continue;
                }
                WsFrame::Pong(_) | WsFrame::Frame(_) => continue,
                WsFrame::Binary(data) => data,
                WsFrame::Text(text) => text.as_bytes(),
            };
            if payload.is_empty() {
                return Err(Error::ClosedNetwork);
            }
            match self
                .inner
                .transform
                .decode(sid, payload, msg, &self.inner.protocol)?
            {
                Decoded::Filled => return Ok(()),
                Decoded::Skip => continue,
                Decoded::Reply(text) => {
                    let mut sink = self.inner.sink.lock().await;
                    sink.send(WsFrame::text(text)).await?;
                    continue;
                }
                Decoded::Closed => return Err(Error::ClosedNetwork),
            }
        }
    }

    pub async fn write_message(&self, msg: &Message) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ClosedNetwork);
        }
        let frame = match self.inner.transform.encode(msg, &self.inner.protocol)? {
            WsPayload::Binary(bytes) => WsFrame::binary(bytes),
            WsPayload::Text(text) => WsFrame::text(text),
        };
        let mut sink = self.inner.sink.lock().await;
        sink.send(frame).await?;
        Ok(())
    }

    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut sink = self.inner.sink.lock().await;
        let _ = sink.send(WsFrame::Close(None)).await;
        let _ = sink.close().await;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }
}

/// WebSocket listener: accepts TCP, optionally wraps TLS, performs the
/// upgrade, and queues the resulting conns for `accept`.
pub struct WsListener {
    inner: Arc<WsListenerInner>,
}

struct WsListenerInner {
    accept_rx: AsyncMutex<mpsc::Receiver<WsConn>>,
    closed: watch::Sender<bool>,
    local: Option<SocketAddr>,
}

impl WsListener {
    pub async fn bind(
        target: &str,
        tls: Option<TlsAcceptor>,
        transform: Arc<dyn FrameTransform>,
        protocol: Arc<Protocol>,
        conn_chan_size: usize,
    ) -> Result<Self, Error> {
        let tcp = tokio::net::TcpListener::bind(target).await?;
        let local = tcp.local_addr().ok();
        let (accept_tx, accept_rx) = mpsc::channel(conn_chan_size.max(1));
        let (closed, _) = watch::channel(false);
        let inner = Arc::new(WsListenerInner {
            accept_rx: AsyncMutex::new(accept_rx),
            closed,
            local,
        });
        tokio::spawn(upgrade_loop(
            tcp,
            tls,
            transform,
            protocol,
            accept_tx,
            inner.closed.subscribe(),
            local,
        ));
        Ok(WsListener { inner })
    }

    pub async fn accept(&self) -> Result<crate::Conn, Error> {
        let mut closed = self.inner.closed.subscribe();
        let mut rx = self.inner.accept_rx.lock().await;
        tokio::select! {
            _ = closed.changed() => Err(Error::ListenerClosed),
            conn = rx.recv() => conn.map(crate::Conn::Ws).ok_or(Error::ListenerClosed),
        }
    }

    pub fn close(&self) {
        let _ = self.inner.closed.send(true);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local
    }
}

async fn upgrade_loop(
    tcp: tokio::net::TcpListener,
    tls: Option<TlsAcceptor>,
    transform: Arc<dyn FrameTransform>,
    protocol: Arc<Protocol>,
    accept_tx: mpsc::Sender<WsConn>,
    mut closed: watch::Receiver<bool>,
    local: Option<SocketAddr>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = closed.changed() => break,
            accepted = tcp.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::debug!(%err, "ws accept failed");
                    continue;
                }
            },
        };
        // Upgrades run detached so one slow handshake cannot stall accepts.
        let tls = tls.clone();
        let transform = transform.clone();
        let protocol = protocol.clone();
        let accept_tx = accept_tx.clone();
        tokio::spawn(async move {
            match upgrade(stream, tls).await {
                Ok(ws) => {
                    let conn = WsConn::new(ws, local, Some(peer), transform, protocol);
                    if accept_tx.try_send(conn).is_err() {
                        tracing::warn!(%peer, "ws accept channel full, connection dropped");
                    }
                }
                Err(err) => tracing::debug!(%peer, %err, "ws upgrade failed"),
            }
        });
    }
}

async fn upgrade(stream: TcpStream, tls: Option<TlsAcceptor>) -> Result<WsStream, Error> {
    let io: Box<dyn RawStream> = match tls {
        Some(acceptor) => Box::new(acceptor.accept(stream).await?),
        None => Box::new(stream),
    };
    Ok(tokio_tungstenite::accept_async(io).await?)
}
