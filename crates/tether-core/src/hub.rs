use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::watch;

use tether_wire::{Flags, Protocol};

use crate::events::{run_listener, EventFn, EventPayload, EventType};
use crate::registry::{Registry, Service};
use crate::sessions::Sessions;
use crate::socket::Role;
use crate::transport::tcp::{TcpConn, TcpListener};
use crate::transport::udp::UdpListener;
use crate::transport::ws::WsListener;
use crate::transport::{Address, Scheme};
use crate::{Conn, Error, Listener, Options, Socket};

/// Per-attempt dial timeout.
const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Process-local coordinator: owns the listeners, the live-socket map, the
/// handler registry, the event tables, and the heartbeat sweep.
///
/// Created inside a tokio runtime (the sweep and accept loops are tasks).
/// Event listeners and handlers are registered before the first `listen`/
/// `connect`; both tables are treated as read-only afterwards.
pub struct Hub {
    me: Weak<Hub>,
    index: AtomicU64,
    sockets: RwLock<HashMap<u64, Arc<Socket>>>,
    listeners: RwLock<HashMap<EventType, Vec<EventFn>>>,
    registry: Registry,
    sessions: Sessions,
    options: Arc<Options>,
    shutdown: watch::Sender<bool>,
}

impl Hub {
    pub fn new(options: Options) -> Arc<Hub> {
        let options = Arc::new(options);
        let (shutdown, _) = watch::channel(false);
        let hub = Arc::new_cyclic(|me| Hub {
            me: me.clone(),
            index: AtomicU64::new(1),
            sockets: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            registry: Registry::new(),
            sessions: Sessions::new(),
            options,
            shutdown,
        });
        if hub.options.heartbeat > 0 {
            tokio::spawn(heartbeat_loop(
                Arc::downgrade(&hub),
                hub.options.heartbeat,
                hub.shutdown.subscribe(),
            ));
        } else {
            tracing::debug!("heartbeat sweep disabled, host drives beats");
        }
        hub
    }

    pub fn options(&self) -> &Arc<Options> {
        &self.options
    }

    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.options.protocol
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn sessions(&self) -> &Sessions {
        &self.sessions
    }

    /// A named handler group on this hub's registry.
    pub fn service(&self, name: &str) -> Service<'_> {
        self.registry.service(name)
    }

    /// Bind a listener and run its accept loop. The scheme selects the
    /// transport: `tcp`/`udp`/`ws`/`wss` (empty defaults to tcp). Returns
    /// the bound local address.
    pub async fn listen(&self, address: &str) -> Result<SocketAddr, Error> {
        let parsed = Address::parse(address)?;
        let options = &self.options;
        let protocol = options.protocol.clone();
        let listener = match parsed.scheme {
            Scheme::Tcp => Listener::Tcp(TcpListener::bind(&parsed.target, protocol).await?),
            Scheme::Udp => Listener::Udp(
                UdpListener::bind(
                    &parsed.target,
                    protocol,
                    options.udp_conn_chan_size,
                    options.udp_msg_chan_size,
                )
                .await?,
            ),
            Scheme::Ws { tls } => {
                let acceptor = match (tls, options.tls.clone()) {
                    (true, None) => return Err(Error::TlsRequired),
                    (true, Some(acceptor)) => Some(acceptor),
                    (false, _) => None,
                };
                Listener::Ws(
                    WsListener::bind(
                        &parsed.target,
                        acceptor,
                        options.ws_transform.clone(),
                        protocol,
                        options.ws_conn_chan_size,
                    )
                    .await?,
                )
            }
        };
        let local = listener
            .local_addr()
            .ok_or_else(|| Error::Io(std::io::Error::other("listener has no local address")))?;
        tokio::spawn(accept_loop(
            self.me.clone(),
            listener,
            self.shutdown.subscribe(),
        ));
        Ok(local)
    }

    /// Dial a server over TCP with bounded retries, then install the socket
    /// as client-role so a later disconnect redials the same address.
    pub async fn connect(&self, address: &str) -> Result<Arc<Socket>, Error> {
        let parsed = Address::parse(address)?;
        if parsed.scheme != Scheme::Tcp {
            return Err(Error::SchemeUnknown(address.to_string()));
        }
        let attempts = self.options.client_reconnect_max.max(1);
        let pause = Duration::from_millis(self.options.client_reconnect_time);
        let mut last = String::new();
        for attempt in 0..attempts {
            match dial_target(&parsed.target, self.options.protocol.clone()).await {
                Ok(conn) => {
                    return Ok(self.install(conn, Role::Client, Some(address.to_string())));
                }
                Err(err) => {
                    tracing::debug!(attempt, %err, "dial failed");
                    last = err.to_string();
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(pause).await;
            }
        }
        Err(Error::DialFailed { attempts, last })
    }

    /// Register an event listener. Expected to complete before the hub
    /// starts accepting traffic; emission is best-effort ordered.
    pub fn on(
        &self,
        event: EventType,
        listener: impl Fn(&Arc<Socket>, Option<&EventPayload<'_>>) -> bool + Send + Sync + 'static,
    ) {
        self.listeners
            .write()
            .entry(event)
            .or_default()
            .push(Box::new(listener));
    }

    /// Run the listeners for an event in registration order. A listener
    /// returning `false` stops the chain; panics are recovered and logged.
    pub fn emit(
        &self,
        event: EventType,
        socket: &Arc<Socket>,
        payload: Option<&EventPayload<'_>>,
    ) -> bool {
        let listeners = self.listeners.read();
        if let Some(chain) = listeners.get(&event) {
            for listener in chain {
                if !run_listener(listener, socket, payload) {
                    return false;
                }
            }
        }
        true
    }

    /// Format and emit an `Error` event for a socket.
    pub fn errorf(&self, socket: &Arc<Socket>, text: impl Into<String>) {
        let text = text.into();
        tracing::debug!(id = socket.id(), %text, "socket error");
        self.emit(EventType::Error, socket, Some(&EventPayload::Error(text)));
    }

    pub fn get(&self, id: u64) -> Option<Arc<Socket>> {
        self.sockets.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sockets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.read().is_empty()
    }

    /// Visit every live socket over a read snapshot of the map. The visitor
    /// returning `false` stops the walk.
    pub fn each(&self, mut visit: impl FnMut(&Arc<Socket>) -> bool) {
        let snapshot: Vec<_> = self.sockets.read().values().cloned().collect();
        for socket in &snapshot {
            if !visit(socket) {
                break;
            }
        }
    }

    /// Fan a message out to every live socket passing the filter, via the
    /// non-blocking write. Full write channels are skipped with a log line.
    /// Returns how many sockets accepted the message.
    pub async fn broadcast<T: Serialize>(
        &self,
        path: &str,
        body: &T,
        filter: impl Fn(&Arc<Socket>) -> bool,
    ) -> usize {
        let protocol = self.options.protocol.clone();
        let snapshot: Vec<_> = self.sockets.read().values().cloned().collect();
        let mut delivered = 0;
        for socket in snapshot {
            if !filter(&socket) {
                continue;
            }
            let mut msg = protocol.acquire();
            if let Err(err) =
                msg.marshal(socket.magic(), Flags::BROADCAST, 0, path, body, &protocol)
            {
                tracing::debug!(id = socket.id(), %err, "broadcast marshal failed");
                protocol.release(msg);
                continue;
            }
            match socket.try_write(msg) {
                Ok(()) => delivered += 1,
                Err(Error::ChannelFull) => {
                    tracing::warn!(id = socket.id(), "broadcast skipped, write channel full");
                }
                Err(_) => {}
            }
        }
        delivered
    }

    /// One sweep over every socket, aging idle counters by `delta` seconds.
    /// Called by the sweep task, or by the host when the sweep is disabled.
    pub async fn heartbeat(&self, delta: u32) {
        let snapshot: Vec<_> = self.sockets.read().values().cloned().collect();
        for socket in snapshot {
            socket.heartbeat(delta).await;
        }
    }

    /// Shut down: stop accept loops and the sweep, disconnect every socket.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let snapshot: Vec<_> = self.sockets.read().values().cloned().collect();
        for socket in snapshot {
            socket.disconnect().await;
        }
    }

    pub(crate) fn remove(&self, id: u64) {
        self.sockets.write().remove(&id);
    }

    /// Whether `stop` has been called. Client sockets stop redialing once
    /// the hub is shutting down.
    pub(crate) fn stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Wrap a fresh conn in a socket, index it, announce it, start its
    /// tasks.
    fn install(&self, conn: Conn, role: Role, address: Option<String>) -> Arc<Socket> {
        let id = self.index.fetch_add(1, Ordering::AcqRel);
        let socket = Socket::new(self.me.clone(), id, conn, role, address, self.options.clone());
        self.sockets.write().insert(id, socket.clone());
        self.emit(EventType::Connected, &socket, None);
        socket.connect();
        socket
    }
}

/// One dial attempt with the fixed per-attempt timeout.
async fn dial_target(target: &str, protocol: Arc<Protocol>) -> Result<Conn, Error> {
    let connect = TcpStream::connect(target);
    let stream = tokio::time::timeout(DIAL_TIMEOUT, connect)
        .await
        .map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "dial timeout",
            ))
        })??;
    Ok(Conn::Tcp(TcpConn::new(stream, protocol)))
}

/// Single redial used by client-role sockets after a disconnect.
pub(crate) async fn dial_once(address: &str, protocol: Arc<Protocol>) -> Result<Conn, Error> {
    let parsed = Address::parse(address)?;
    if parsed.scheme != Scheme::Tcp {
        return Err(Error::SchemeUnknown(address.to_string()));
    }
    dial_target(&parsed.target, protocol).await
}

/// One accept loop per listener. Terminates on shutdown or a closed
/// listener; other accept errors are logged and the loop continues.
async fn accept_loop(hub: Weak<Hub>, listener: Listener, mut shutdown: watch::Receiver<bool>) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };
        let Some(hub) = hub.upgrade() else {
            break;
        };
        match accepted {
            Ok(conn) => {
                let cap = hub.options.connect_max_size;
                if cap > 0 && hub.len() >= cap {
                    tracing::debug!(cap, "admission cap reached, connection dropped");
                    conn.close().await;
                    continue;
                }
                hub.install(conn, Role::Server, None);
            }
            Err(err) if err.is_closed() => break,
            Err(err) => tracing::debug!(%err, "accept failed"),
        }
    }
    listener.close();
}

/// The heartbeat sweep: one task per hub, ticking every `secs` seconds.
async fn heartbeat_loop(hub: Weak<Hub>, secs: u32, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(u64::from(secs)));
    // The first tick completes immediately; swallow it so sweeps start one
    // full interval after the hub comes up.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let Some(hub) = hub.upgrade() else { break };
                hub.heartbeat(secs).await;
            }
        }
    }
}
