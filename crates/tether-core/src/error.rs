use thiserror::Error;

/// Errors surfaced by connections, sockets, and the hub.
///
/// Per-socket runtime failures are reported through the `Error` event and
/// degrade only the affected socket; the variants here also serve as the
/// synchronous results of `listen`/`connect`.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Wire(#[from] tether_wire::WireError),

    /// Write attempted while the socket is not in the Connected state.
    #[error("socket is not ready for writes")]
    SocketClosed,

    /// The bounded write channel refused a non-blocking enqueue.
    #[error("socket write channel full")]
    ChannelFull,

    /// The underlying connection is gone. Treated as normal termination
    /// inside read loops.
    #[error("connection closed")]
    ClosedNetwork,

    /// Dial attempts exhausted.
    #[error("dial failed after {attempts} attempts: {last}")]
    DialFailed { attempts: u32, last: String },

    /// `listen`/`connect` got an address scheme outside tcp/udp/ws/wss.
    #[error("address scheme unknown: {0}")]
    SchemeUnknown(String),

    /// A `wss` listener was requested without a TLS acceptor configured.
    #[error("wss listener requires a tls acceptor")]
    TlsRequired,

    /// The listener has shut down; no further accepts.
    #[error("listener closed")]
    ListenerClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Whether this error means the peer is simply gone (EOF, reset, or a
    /// close frame). Read loops terminate silently on these instead of
    /// emitting an `Error` event.
    pub fn is_closed(&self) -> bool {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match self {
            Error::ClosedNetwork | Error::ListenerClosed => true,
            Error::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
            ),
            Error::WebSocket(err) => matches!(
                err,
                WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Protocol(_)
            ),
            _ => false,
        }
    }
}
