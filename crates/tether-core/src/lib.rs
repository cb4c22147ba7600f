//! Multi-transport, message-oriented socket framework.
//!
//! The [`Hub`] accepts inbound connections over TCP, UDP, and WebSocket
//! (optionally behind TLS) and dials outbound connections over TCP. Every
//! connection becomes a [`Socket`] running one read task and one write task;
//! received frames are routed by path through the handler [`Registry`], and
//! requests flagged NEED_ACK get an automatic correlated reply. A heartbeat
//! sweep disconnects idle sockets; lifecycle transitions surface through the
//! [`EventType`] listener tables.
//!
//! The wire format lives in `tether-wire` and is re-exported here.

mod dispatch;
mod error;
mod events;
mod hub;
mod options;
mod registry;
mod sessions;
mod socket;
mod status;
pub mod transport;

pub use dispatch::Context;
pub use error::Error;
pub use events::{EventFn, EventPayload, EventType};
pub use hub::Hub;
pub use options::Options;
pub use registry::{Caller, CustomCaller, HandlerFn, Invoker, Registry, Reply, Service};
pub use sessions::{Session, Sessions};
pub use socket::{Role, Socket};
pub use status::{State, Status};
pub use transport::{Address, Conn, Listener, Scheme};

// Wire types, re-exported so most hosts depend on this crate alone.
pub use tether_wire::{
    ByteOrder, Encoding, Flags, Limits, MagicTable, MapTransform, Message, PathMode, Protocol,
    Transform, WireError, HEAD_SIZE, MAGIC_CODE_JSON, MAGIC_PATH_JSON,
};
