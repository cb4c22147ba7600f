//! Transport adapters behind a uniform contract.
//!
//! [`Conn`] and [`Listener`] are clonable enums; each backend lives in its
//! own module under `transport/` with an `Arc`-held inner so clones share
//! one connection. The message contract is the same everywhere: a conn
//! reads whole [`Message`]s and writes whole [`Message`]s, however the
//! underlying transport frames them.

use std::net::SocketAddr;

use tether_wire::Message;

use crate::Error;

pub mod socketio;
pub mod tcp;
pub mod udp;
pub mod ws;

/// Transport family selected by the address scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Udp,
    Ws { tls: bool },
}

/// A parsed `scheme://host:port` address. An empty scheme defaults to tcp.
#[derive(Clone, Debug)]
pub struct Address {
    pub scheme: Scheme,
    pub target: String,
}

impl Address {
    pub fn parse(address: &str) -> Result<Address, Error> {
        let canonical = if address.contains("://") {
            address.to_string()
        } else {
            format!("tcp://{address}")
        };
        let url = url::Url::parse(&canonical)
            .map_err(|_| Error::SchemeUnknown(address.to_string()))?;
        let scheme = match url.scheme() {
            "tcp" | "tcp4" | "tcp6" => Scheme::Tcp,
            "udp" | "udp4" | "udp6" => Scheme::Udp,
            "ws" => Scheme::Ws { tls: false },
            "wss" => Scheme::Ws { tls: true },
            other => return Err(Error::SchemeUnknown(other.to_string())),
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::SchemeUnknown(address.to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::SchemeUnknown(address.to_string()))?;
        Ok(Address {
            scheme,
            target: format!("{host}:{port}"),
        })
    }
}

/// One accepted or dialed connection, exclusively owned by its socket.
#[derive(Clone)]
pub enum Conn {
    Tcp(tcp::TcpConn),
    Udp(udp::UdpConn),
    Ws(ws::WsConn),
}

impl Conn {
    /// Read one whole message. `sid` identifies the owning socket for
    /// transforms that need it (e.g. SOCKET.IO session descriptors).
    pub async fn read_message(&self, sid: u64, msg: &mut Message) -> Result<(), Error> {
        match self {
            Conn::Tcp(conn) => conn.read_message(msg).await,
            Conn::Udp(conn) => conn.read_message(msg).await,
            Conn::Ws(conn) => conn.read_message(sid, msg).await,
        }
    }

    /// Serialize and write one whole message.
    pub async fn write_message(&self, msg: &Message) -> Result<(), Error> {
        match self {
            Conn::Tcp(conn) => conn.write_message(msg).await,
            Conn::Udp(conn) => conn.write_message(msg).await,
            Conn::Ws(conn) => conn.write_message(msg).await,
        }
    }

    /// Tear the connection down. Idempotent.
    pub async fn close(&self) {
        match self {
            Conn::Tcp(conn) => conn.close().await,
            Conn::Udp(conn) => conn.close(),
            Conn::Ws(conn) => conn.close().await,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Conn::Tcp(conn) => conn.local_addr(),
            Conn::Udp(conn) => conn.local_addr(),
            Conn::Ws(conn) => conn.local_addr(),
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        match self {
            Conn::Tcp(conn) => conn.remote_addr(),
            Conn::Udp(conn) => conn.remote_addr(),
            Conn::Ws(conn) => conn.remote_addr(),
        }
    }
}

/// One bound listener. The hub runs one accept loop per listener.
pub enum Listener {
    Tcp(tcp::TcpListener),
    Udp(udp::UdpListener),
    Ws(ws::WsListener),
}

impl Listener {
    /// Wait for the next connection. Fails with [`Error::ListenerClosed`]
    /// once the listener shuts down.
    pub async fn accept(&self) -> Result<Conn, Error> {
        match self {
            Listener::Tcp(listener) => listener.accept().await,
            Listener::Udp(listener) => listener.accept().await,
            Listener::Ws(listener) => listener.accept().await,
        }
    }

    pub fn close(&self) {
        match self {
            Listener::Tcp(listener) => listener.close(),
            Listener::Udp(listener) => listener.close(),
            Listener::Ws(listener) => listener.close(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr(),
            Listener::Udp(listener) => listener.local_addr(),
            Listener::Ws(listener) => listener.local_addr(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_parsing() {
        assert_eq!(Address::parse("tcp://1.2.3.4:80").unwrap().scheme, Scheme::Tcp);
        assert_eq!(Address::parse("udp6://[::1]:90").unwrap().scheme, Scheme::Udp);
        assert_eq!(
            Address::parse("ws://1.2.3.4:80").unwrap().scheme,
            Scheme::Ws { tls: false }
        );
        assert_eq!(
            Address::parse("wss://1.2.3.4:443").unwrap().scheme,
            Scheme::Ws { tls: true }
        );
    }

    #[test]
    fn empty_scheme_defaults_to_tcp() {
        let address = Address::parse("127.0.0.1:8080").unwrap();
        assert_eq!(address.scheme, Scheme::Tcp);
        assert_eq!(address.target, "127.0.0.1:8080");
    }

    #[test]
    fn unknown_scheme_rejected() {
        assert!(matches!(
            Address::parse("quic://1.2.3.4:1"),
            Err(Error::SchemeUnknown(_))
        ));
    }
}
