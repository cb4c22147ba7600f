use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex as AsyncMutex;

use tether_wire::{Message, Protocol, HEAD_SIZE};

use crate::Error;

/// Framed TCP connection: a 10-byte head, then exactly `size` body bytes.
#[derive(Clone)]
pub struct TcpConn {
    inner: Arc<TcpInner>,
}

struct TcpInner {
    reader: AsyncMutex<OwnedReadHalf>,
    writer: AsyncMutex<WriteHalf>,
    closed: AtomicBool,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    protocol: Arc<Protocol>,
}

struct WriteHalf {
    half: OwnedWriteHalf,
    /// Serialization scratch, reset between writes so each message goes out
    /// in a single `write_all`.
    scratch: Vec<u8>,
}

impl TcpConn {
    pub fn new(stream: TcpStream, protocol: Arc<Protocol>) -> Self {
        let local = stream.local_addr().ok();
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        TcpConn {
            inner: Arc::new(TcpInner {
                reader: AsyncMutex::new(reader),
                writer: AsyncMutex::new(WriteHalf {
                    half: writer,
                    scratch: Vec::new(),
                }),
                closed: AtomicBool::new(false),
                local,
                peer,
                protocol,
            }),
        }
    }

    pub async fn read_message(&self, msg: &mut Message) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ClosedNetwork);
        }
        let protocol = &self.inner.protocol;
        let mut reader = self.inner.reader.lock().await;
        let mut head = [0u8; HEAD_SIZE];
        reader.read_exact(&mut head).await?;
        msg.parse_head(&head, protocol)?;
        msg.read_body(&mut *reader, protocol).await?;
        Ok(())
    }

    pub async fn write_message(&self, msg: &Message) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ClosedNetwork);
        }
        let protocol = &self.inner.protocol;
        let mut writer = self.inner.writer.lock().await;
        writer.scratch.clear();
        msg.to_bytes(&mut writer.scratch, true, protocol)?;
        let WriteHalf { half, scratch } = &mut *writer;
        half.write_all(scratch).await?;
        half.flush().await?;
        Ok(())
    }

    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.inner.writer.lock().await;
        let _ = writer.half.shutdown().await;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }
}

/// Thin wrapper so the listener enum can close and report its address.
pub struct TcpListener {
    inner: tokio::net::TcpListener,
    closed: AtomicBool,
    protocol: Arc<Protocol>,
}

impl TcpListener {
    pub async fn bind(target: &str, protocol: Arc<Protocol>) -> Result<Self, Error> {
        let inner = tokio::net::TcpListener::bind(target).await?;
        Ok(TcpListener {
            inner,
            closed: AtomicBool::new(false),
            protocol,
        })
    }

    pub async fn accept(&self) -> Result<crate::Conn, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ListenerClosed);
        }
        let (stream, _) = self.inner.accept().await?;
        Ok(crate::Conn::Tcp(TcpConn::new(stream, self.protocol.clone())))
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr().ok()
    }
}
