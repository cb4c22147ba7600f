use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::de::DeserializeOwned;

use tether_wire::{Flags, Message};

use crate::events::panic_text;
use crate::registry::Reply;
use crate::{Error, EventPayload, EventType, Hub, Socket};

/// Per-invocation view handed to handlers: the socket, the request message,
/// and its pre-split path and query.
pub struct Context<'a> {
    socket: &'a Arc<Socket>,
    message: &'a Message,
    path: &'a str,
    query: &'a str,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        socket: &'a Arc<Socket>,
        message: &'a Message,
        path: &'a str,
        query: &'a str,
    ) -> Self {
        Context {
            socket,
            message,
            path,
            query,
        }
    }

    pub fn socket(&self) -> &Arc<Socket> {
        self.socket
    }

    pub fn message(&self) -> &Message {
        self.message
    }

    pub fn path(&self) -> &str {
        self.path
    }

    pub fn query(&self) -> &str {
        self.query
    }

    pub fn index(&self) -> u32 {
        self.message.index()
    }

    pub fn flags(&self) -> Flags {
        self.message.flags()
    }

    /// Decode the request body with the encoding bound to its magic.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(self.message.unmarshal(self.socket.protocol())?)
    }

    /// Raw request body after the addressing prefix.
    pub fn body(&self) -> Result<&[u8], Error> {
        Ok(self.message.body(self.socket.protocol())?)
    }
}

impl Hub {
    /// Route one received message: resolve the path, run the handler (or
    /// emit `Message` for unrouted paths), and produce the automatic ACK
    /// reply when the request asks for one.
    ///
    /// Takes ownership of the message and releases it back to the pool on
    /// every path. Handler panics are recovered and surfaced as `Error`.
    pub(crate) async fn handle(self: &Arc<Self>, socket: &Arc<Socket>, msg: Message) {
        let protocol = self.options().protocol.clone();

        // Pure liveness traffic: the read task already refreshed the idle
        // counter, nothing to route.
        if msg.flags().contains(Flags::HEARTBEAT) {
            protocol.release(msg);
            return;
        }

        let (path, query) = match msg.path(&protocol) {
            Ok(pair) => pair,
            Err(err) => {
                self.errorf(socket, format!("message path: {err}"));
                protocol.release(msg);
                return;
            }
        };

        let Some(invoker) = self.registry().lookup(&path) else {
            self.emit(
                EventType::Message,
                socket,
                Some(&EventPayload::Message(&msg)),
            );
            protocol.release(msg);
            return;
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let mut ctx = Context::new(socket, &msg, &path, &query);
            self.registry().invoke(&invoker, &mut ctx)
        }));
        let reply = match outcome {
            Ok(reply) => reply,
            Err(panic) => {
                self.errorf(
                    socket,
                    format!("handler panic at {path}: {}", panic_text(&panic)),
                );
                protocol.release(msg);
                return;
            }
        };

        let Some(reply) = reply else {
            protocol.release(msg);
            return;
        };

        // Automatic ACK: only for correlated requests that asked for one.
        if !msg.flags().contains(Flags::NEED_ACK) || msg.index() == 0 {
            protocol.release(msg);
            return;
        }

        let confirm = if self.options().s2c_confirm.is_empty() {
            path.clone()
        } else {
            self.options().s2c_confirm.clone()
        };
        let body = match reply {
            Reply::Bytes(bytes) => Ok(bytes),
            Reply::Value(value) => self.registry().serialize_reply(&value, &msg, &protocol),
        };
        let body = match body {
            Ok(body) => body,
            Err(err) => {
                self.errorf(socket, format!("ack body: {err}"));
                protocol.release(msg);
                return;
            }
        };
        let magic = msg.magic();
        let index = msg.index();
        protocol.release(msg);

        let mut ack = protocol.acquire();
        if let Err(err) = ack.marshal_bytes(magic, Flags::IS_ACK, index, &confirm, &body, &protocol)
        {
            self.errorf(socket, format!("ack marshal: {err}"));
            protocol.release(ack);
            return;
        }
        if let Err(err) = socket.write(ack).await {
            if !err.is_closed() && !matches!(err, Error::SocketClosed) {
                self.errorf(socket, format!("ack write: {err}"));
            }
        }
    }
}
