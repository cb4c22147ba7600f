use std::sync::Arc;

use tether_wire::Protocol;

use crate::transport::ws::{BinaryTransform, FrameTransform};

/// Hub and socket configuration.
///
/// Time knobs follow the convention fixed by the protocol: heartbeat and
/// idle/grace windows are in seconds, the dial retry pause is in
/// milliseconds.
pub struct Options {
    /// Heartbeat sweep interval in seconds. Zero disables the sweep; the
    /// host then drives [`Hub::heartbeat`](crate::Hub::heartbeat) itself.
    pub heartbeat: u32,
    /// Capacity of each socket's bounded write channel.
    pub write_chan_size: usize,
    /// Advisory accept admission cap. Zero means unlimited; connections
    /// over the cap are dropped at accept time.
    pub connect_max_size: usize,
    /// Seconds of idle before a socket is considered dead.
    pub socket_connect_time: u32,
    /// Grace seconds before closing a socket that was logged in elsewhere.
    pub socket_replaced_time: u32,
    /// Dial attempts for `connect` before giving up.
    pub client_reconnect_max: u32,
    /// Milliseconds to sleep between dial attempts.
    pub client_reconnect_time: u64,
    /// Path used for automatic ACK replies. Empty echoes the request path.
    pub s2c_confirm: String,
    /// Pending-connection backlog of the UDP listener.
    pub udp_conn_chan_size: usize,
    /// Per-peer datagram backlog; overflow drops datagrams.
    pub udp_msg_chan_size: usize,
    /// Pending-upgrade backlog of the WebSocket listener.
    pub ws_conn_chan_size: usize,
    /// TLS acceptor for `wss` listeners. `wss` without one is a config error.
    pub tls: Option<tokio_rustls::TlsAcceptor>,
    /// Frame transform for WebSocket listeners; the default ships whole
    /// wire frames in binary WebSocket messages.
    pub ws_transform: Arc<dyn FrameTransform>,
    /// Wire protocol: magic table, limits, transform, message pool.
    pub protocol: Arc<Protocol>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            heartbeat: 10,
            write_chan_size: 100,
            connect_max_size: 0,
            socket_connect_time: 60,
            socket_replaced_time: 5,
            client_reconnect_max: 10,
            client_reconnect_time: 5000,
            s2c_confirm: String::new(),
            udp_conn_chan_size: 100,
            udp_msg_chan_size: 100,
            ws_conn_chan_size: 100,
            tls: None,
            ws_transform: Arc::new(BinaryTransform),
            protocol: Arc::new(Protocol::default()),
        }
    }
}
