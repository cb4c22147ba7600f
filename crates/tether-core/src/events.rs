use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tether_wire::Message;

use crate::Socket;

/// The closed set of lifecycle events a hub emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Per-socket runtime error.
    Error,
    /// A message arrived with no registered handler.
    Message,
    /// Periodic liveness tick for a live socket.
    Heartbeat,
    /// A socket entered the Connected state.
    Connected,
    /// A socket finished teardown.
    Disconnect,
    /// A known identity re-authenticated on a new socket.
    Reconnected,
    /// Session data was bound to a socket.
    Authentication,
    /// The socket's identity logged in elsewhere.
    Replaced,
}

/// Typed attachment carried by an event.
pub enum EventPayload<'a> {
    /// Heartbeat: seconds added to the idle counter this sweep.
    Delta(u32),
    /// Error: formatted description.
    Error(String),
    /// Authentication: whether this was a reconnect.
    Reconnect(bool),
    /// Replaced: remote address of the socket that took over.
    Address(&'a str),
    /// Message: the unrouted message. Borrowed from the pool; listeners
    /// must not retain it past the callback.
    Message(&'a Message),
}

/// Event listener. Returning `false` stops the remaining listeners for this
/// emission, mirroring the dispatch short-circuit of the event chain.
pub type EventFn = Box<dyn Fn(&Arc<Socket>, Option<&EventPayload<'_>>) -> bool + Send + Sync>;

pub(crate) fn run_listener(
    listener: &EventFn,
    socket: &Arc<Socket>,
    payload: Option<&EventPayload<'_>>,
) -> bool {
    match catch_unwind(AssertUnwindSafe(|| listener(socket, payload))) {
        Ok(keep_going) => keep_going,
        Err(panic) => {
            tracing::error!(payload = panic_text(&panic), "event listener panicked");
            true
        }
    }
}

pub(crate) fn panic_text(panic: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(text) = panic.downcast_ref::<&str>() {
        text
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.as_str()
    } else {
        "non-string panic payload"
    }
}
