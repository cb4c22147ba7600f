use std::any::Any;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::{mpsc, watch};

use tether_wire::{Flags, Message, Protocol, MAGIC_PATH_JSON};

use crate::hub::dial_once;
use crate::status::{State, Status};
use crate::{Conn, Error, EventPayload, EventType, Hub, Options};

/// Whether the socket came from an accept (server) or a dial (client).
/// Client-role sockets redial on disconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// One live connection.
///
/// A socket exclusively owns its [`Conn`] and its bounded write channel.
/// Exactly two long-lived tasks run per connected socket, a read task and
/// a write task, supervised through an epoch counter: every disconnect
/// bumps the epoch, which both tasks watch, so tasks from an older
/// connection epoch can never outlive it.
pub struct Socket {
    id: u64,
    me: Weak<Socket>,
    hub: Weak<Hub>,
    role: Role,
    conn: RwLock<Conn>,
    status: Status,
    /// Wire flavor latched from the first frame received.
    magic: AtomicU8,
    /// Session data bound at authentication. None until then.
    data: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
    cwrite_tx: mpsc::Sender<Message>,
    cwrite_rx: AsyncMutex<mpsc::Receiver<Message>>,
    epoch: watch::Sender<u64>,
    /// Redial target for client-role sockets.
    address: RwLock<Option<String>>,
    options: Arc<Options>,
}

impl Socket {
    pub(crate) fn new(
        hub: Weak<Hub>,
        id: u64,
        conn: Conn,
        role: Role,
        address: Option<String>,
        options: Arc<Options>,
    ) -> Arc<Socket> {
        let (cwrite_tx, cwrite_rx) = mpsc::channel(options.write_chan_size.max(1));
        let (epoch, _) = watch::channel(0u64);
        Arc::new_cyclic(|me| Socket {
            id,
            me: me.clone(),
            hub,
            role,
            conn: RwLock::new(conn),
            status: Status::new(),
            magic: AtomicU8::new(0),
            data: RwLock::new(None),
            cwrite_tx,
            cwrite_rx: AsyncMutex::new(cwrite_rx),
            epoch,
            address: RwLock::new(address),
            options,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> State {
        self.status.state()
    }

    /// The wire flavor this socket speaks: the latched first magic, or the
    /// default path/JSON flavor before anything was received.
    pub fn magic(&self) -> u8 {
        match self.magic.load(Ordering::Acquire) {
            0 => MAGIC_PATH_JSON,
            magic => magic,
        }
    }

    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.options.protocol
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.conn.read().local_addr()
    }

    pub fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        self.conn.read().remote_addr()
    }

    /// Bound session data, None until authentication.
    pub fn data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.data.read().clone()
    }

    /// Whether session data has been bound.
    pub fn verified(&self) -> bool {
        self.data.read().is_some()
    }

    /// Reset the idle counter. Every successful read or write does this.
    pub fn keep_alive(&self) {
        self.status.keep_alive();
    }

    /// Marshal a typed body and enqueue it. Blocks while the write channel
    /// is full (backpressure).
    pub async fn send<T: Serialize>(
        &self,
        flags: Flags,
        index: u32,
        path: &str,
        body: &T,
    ) -> Result<(), Error> {
        let protocol = self.options.protocol.clone();
        let mut msg = protocol.acquire();
        if let Err(err) = msg.marshal(self.magic(), flags, index, path, body, &protocol) {
            protocol.release(msg);
            return Err(err.into());
        }
        self.write(msg).await
    }

    /// Like [`send`](Socket::send) with a pre-serialized body.
    pub async fn send_bytes(
        &self,
        flags: Flags,
        index: u32,
        path: &str,
        body: &[u8],
    ) -> Result<(), Error> {
        let protocol = self.options.protocol.clone();
        let mut msg = protocol.acquire();
        if let Err(err) = msg.marshal_bytes(self.magic(), flags, index, path, body, &protocol) {
            protocol.release(msg);
            return Err(err.into());
        }
        self.write(msg).await
    }

    /// Enqueue a message on the write channel, blocking while it is full.
    ///
    /// Rejected with [`Error::SocketClosed`] unless the socket is in the
    /// Connected state. The message is returned to the pool on rejection.
    pub async fn write(&self, msg: Message) -> Result<(), Error> {
        if !self.status.ready() {
            self.options.protocol.release(msg);
            return Err(Error::SocketClosed);
        }
        match self.cwrite_tx.send(msg).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(msg)) => {
                self.options.protocol.release(msg);
                Err(Error::SocketClosed)
            }
        }
    }

    /// Non-blocking enqueue; a full channel fails with
    /// [`Error::ChannelFull`].
    pub fn try_write(&self, msg: Message) -> Result<(), Error> {
        if !self.status.ready() {
            self.options.protocol.release(msg);
            return Err(Error::SocketClosed);
        }
        match self.cwrite_tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                self.options.protocol.release(msg);
                Err(Error::ChannelFull)
            }
            Err(mpsc::error::TrySendError::Closed(msg)) => {
                self.options.protocol.release(msg);
                Err(Error::SocketClosed)
            }
        }
    }

    /// Detached write: never blocks the caller, completes through the
    /// returned handle.
    pub fn write_async(&self, msg: Message) -> tokio::task::JoinHandle<Result<(), Error>> {
        match self.me.upgrade() {
            Some(me) => tokio::spawn(async move { me.write(msg).await }),
            None => {
                self.options.protocol.release(msg);
                tokio::spawn(async { Err(Error::SocketClosed) })
            }
        }
    }

    /// Graceful close: stop accepting writes, let the write channel drain,
    /// and let the heartbeat sweep force the disconnect after `delay`
    /// seconds by pre-aging the idle counter.
    pub fn close(&self, delay: u32) {
        if !self.status.cas(State::Connected, State::Closing) {
            return;
        }
        let connect_time = self.options.socket_connect_time;
        self.status.set_heartbeat(connect_time.saturating_sub(delay));
    }

    /// Bind session data and announce it. `reconnect` marks a known
    /// identity returning on a fresh socket and additionally emits
    /// `Reconnected`.
    pub fn authentication(&self, data: Arc<dyn Any + Send + Sync>, reconnect: bool) {
        *self.data.write() = Some(data);
        if let (Some(hub), Some(me)) = (self.hub.upgrade(), self.me.upgrade()) {
            hub.emit(
                EventType::Authentication,
                &me,
                Some(&EventPayload::Reconnect(reconnect)),
            );
            if reconnect {
                hub.emit(EventType::Reconnected, &me, None);
            }
        }
    }

    /// This identity logged in elsewhere: emit `Replaced`, drop the bound
    /// data (so teardown does not run the logout path), and schedule a
    /// close after the configured grace window.
    pub fn replaced(&self, ip: &str) {
        if let (Some(hub), Some(me)) = (self.hub.upgrade(), self.me.upgrade()) {
            hub.emit(EventType::Replaced, &me, Some(&EventPayload::Address(ip)));
        }
        *self.data.write() = None;
        self.close(self.options.socket_replaced_time);
    }

    /// Start (or restart after reconnect) the read/write tasks.
    pub(crate) fn connect(&self) -> bool {
        let entered = self.status.cas(State::None, State::Connected)
            || self.status.cas(State::Reconnecting, State::Connected);
        if !entered {
            return false;
        }
        self.status.keep_alive();
        let Some(me) = self.me.upgrade() else {
            return false;
        };
        let conn = self.conn.read().clone();
        tokio::spawn(read_task(me.clone(), conn.clone()));
        tokio::spawn(write_task(me, conn));
        true
    }

    /// Tear down the connection. Single-winner via CAS; the winner bumps
    /// the task epoch, closes the conn, and either finalizes (server role)
    /// or hands off to a one-shot redial (client role).
    pub(crate) async fn disconnect(&self) {
        let won = self.status.cas(State::Connected, State::Disconnect)
            || self.status.cas(State::Closing, State::Disconnect)
            || self.status.cas(State::None, State::Disconnect);
        if !won {
            return;
        }
        self.epoch.send_modify(|epoch| *epoch += 1);
        let conn = self.conn.read().clone();
        conn.close().await;
        let stopped = self
            .hub
            .upgrade()
            .map(|hub| hub.stopped())
            .unwrap_or(true);
        match self.role {
            Role::Client if !stopped => {
                self.status.set(State::Reconnecting);
                if let Some(me) = self.me.upgrade() {
                    tokio::spawn(reconnect_task(me));
                }
            }
            _ => self.finalize().await,
        }
    }

    /// Final teardown: remove from the hub, release queued messages, clear
    /// bound data, emit `Disconnect`, and rest in Released.
    pub(crate) async fn finalize(&self) {
        self.status.set(State::Disconnected);
        let hub = self.hub.upgrade();
        if let Some(hub) = &hub {
            hub.sessions().remove(self);
            hub.remove(self.id);
        }
        {
            let mut rx = self.cwrite_rx.lock().await;
            while let Ok(msg) = rx.try_recv() {
                self.options.protocol.release(msg);
            }
        }
        *self.data.write() = None;
        if let (Some(hub), Some(me)) = (hub, self.me.upgrade()) {
            hub.emit(EventType::Disconnect, &me, None);
        }
        self.status.set(State::Released);
    }

    /// One heartbeat sweep visit: age the idle counter, disconnect on
    /// timeout, otherwise announce the beat.
    pub(crate) async fn heartbeat(&self, delta: u32) {
        if !self.status.is_active() {
            return;
        }
        let idle = self.status.age(delta);
        if idle > self.options.socket_connect_time {
            self.disconnect().await;
        } else if let (Some(hub), Some(me)) = (self.hub.upgrade(), self.me.upgrade()) {
            hub.emit(EventType::Heartbeat, &me, Some(&EventPayload::Delta(delta)));
        }
    }

    pub(crate) fn latch_magic(&self, magic: u8) {
        let _ = self
            .magic
            .compare_exchange(0, magic, Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn replace_conn(&self, conn: Conn) {
        *self.conn.write() = conn;
    }

    fn errorf(&self, text: String) {
        if let (Some(hub), Some(me)) = (self.hub.upgrade(), self.me.upgrade()) {
            hub.errorf(&me, text);
        }
    }
}

/// Pulls frames off the conn and hands them to dispatch. EOF and
/// closed-network terminate silently; other errors are announced.
async fn read_task(socket: Arc<Socket>, conn: Conn) {
    let mut epoch = socket.epoch.subscribe();
    epoch.borrow_and_update();
    loop {
        let protocol = socket.options.protocol.clone();
        let mut msg = protocol.acquire();
        let mut aborted = false;
        let read = tokio::select! {
            _ = epoch.changed() => {
                aborted = true;
                Ok(())
            }
            read = conn.read_message(socket.id, &mut msg) => read,
        };
        if aborted {
            protocol.release(msg);
            break;
        }
        match read {
            Ok(()) => {
                let magic = msg.magic();
                if magic == 0 {
                    // Uninitialized frame, nothing to route.
                    protocol.release(msg);
                    continue;
                }
                socket.latch_magic(magic);
                socket.keep_alive();
                match socket.hub.upgrade() {
                    Some(hub) => hub.handle(&socket, msg).await,
                    None => {
                        protocol.release(msg);
                        break;
                    }
                }
            }
            Err(err) => {
                protocol.release(msg);
                if !err.is_closed() {
                    socket.errorf(format!("read: {err}"));
                }
                break;
            }
        }
    }
    socket.disconnect().await;
}

/// Drains the write channel onto the conn in enqueue order.
async fn write_task(socket: Arc<Socket>, conn: Conn) {
    let mut epoch = socket.epoch.subscribe();
    epoch.borrow_and_update();
    let mut rx = socket.cwrite_rx.lock().await;
    loop {
        // A closing socket is done once the channel has drained.
        if socket.status.state() == State::Closing && rx.is_empty() {
            break;
        }
        if !socket.status.is_active() {
            break;
        }
        let msg = tokio::select! {
            _ = epoch.changed() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        // The write itself also aborts on a new epoch so teardown never
        // waits behind a stalled peer.
        let mut aborted = false;
        let written = tokio::select! {
            _ = epoch.changed() => {
                aborted = true;
                Ok(())
            }
            written = conn.write_message(&msg) => written,
        };
        socket.options.protocol.release(msg);
        if aborted {
            break;
        }
        match written {
            Ok(()) => socket.keep_alive(),
            Err(err) => {
                if !err.is_closed() {
                    socket.errorf(format!("write: {err}"));
                }
                break;
            }
        }
    }
    drop(rx);
    socket.disconnect().await;
}

/// Client-role redial: exactly one attempt. Success re-enters Connected
/// with the same id and write channel; failure releases the socket.
async fn reconnect_task(socket: Arc<Socket>) {
    let target = socket.address.read().clone();
    let dialed = match target {
        Some(address) => dial_once(&address, socket.options.protocol.clone()).await,
        None => Err(Error::SocketClosed),
    };
    match dialed {
        Ok(conn) => {
            socket.replace_conn(conn);
            if socket.connect() {
                tracing::debug!(id = socket.id, "socket reconnected");
            }
        }
        Err(err) => {
            tracing::debug!(id = socket.id, %err, "reconnect failed, releasing socket");
            socket.finalize().await;
        }
    }
}
