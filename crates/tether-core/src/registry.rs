use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use tether_wire::{Message, Protocol};

use crate::dispatch::Context;
use crate::Error;

/// Value returned by a handler, destined for the automatic ACK reply.
///
/// `Bytes` passes through verbatim; `Value` is encoded with the request
/// magic's body encoding (or the custom serializer when one is installed).
pub enum Reply {
    Bytes(Vec<u8>),
    Value(serde_json::Value),
}

impl Reply {
    /// Wrap a serializable value.
    pub fn json<T: Serialize>(value: &T) -> Option<Reply> {
        match serde_json::to_value(value) {
            Ok(value) => Some(Reply::Value(value)),
            Err(err) => {
                tracing::warn!(%err, "reply not serializable, dropping");
                None
            }
        }
    }
}

impl From<Vec<u8>> for Reply {
    fn from(bytes: Vec<u8>) -> Reply {
        Reply::Bytes(bytes)
    }
}

impl From<serde_json::Value> for Reply {
    fn from(value: serde_json::Value) -> Reply {
        Reply::Value(value)
    }
}

/// A plain handler function.
pub type HandlerFn = dyn Fn(&mut Context<'_>) -> Option<Reply> + Send + Sync;

/// A bound object exposing a fixed set of named methods, the statically
/// typed replacement for reflection over handler shapes. Registration adds
/// one leaf per name in [`methods`](Caller::methods); dispatch calls back
/// with the matched name.
pub trait Caller: Send + Sync {
    fn methods(&self) -> &'static [&'static str];
    fn call(&self, method: &str, ctx: &mut Context<'_>) -> Option<Reply>;
}

/// A registered leaf: either a function or a method on a bound object.
pub enum Invoker {
    Func(Box<HandlerFn>),
    Bound {
        caller: Arc<dyn Caller>,
        method: &'static str,
    },
}

/// Registry-wide invocation override. Takes precedence over the leaf's own
/// shape when installed.
pub type CustomCaller = dyn Fn(&mut Context<'_>, &Invoker) -> Option<Reply> + Send + Sync;

/// Custom serializer for [`Reply::Value`] ACK bodies.
pub type ReplySerializer = dyn Fn(&serde_json::Value) -> Result<Vec<u8>, Error> + Send + Sync;

#[derive(Default)]
struct Node {
    children: HashMap<String, Node>,
    leaf: Option<Arc<Invoker>>,
}

impl Node {
    fn insert(&mut self, mut segments: std::str::Split<'_, char>, invoker: Arc<Invoker>) {
        match segments.find(|s| !s.is_empty()) {
            None => self.leaf = Some(invoker),
            Some(segment) => self
                .children
                .entry(segment.to_string())
                .or_default()
                .insert(segments, invoker),
        }
    }

    fn lookup(&self, mut segments: std::str::Split<'_, char>) -> Option<Arc<Invoker>> {
        match segments.find(|s| !s.is_empty()) {
            None => self.leaf.clone(),
            Some(segment) => self.children.get(segment)?.lookup(segments),
        }
    }
}

/// Handler registry: a tree keyed by path segments.
///
/// Registration happens before the hub starts; lookups run on every
/// dispatched message.
pub struct Registry {
    root: RwLock<Node>,
    custom: RwLock<Option<Arc<CustomCaller>>>,
    serializer: RwLock<Option<Arc<ReplySerializer>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Registry {
            root: RwLock::new(Node::default()),
            custom: RwLock::new(None),
            serializer: RwLock::new(None),
        }
    }

    /// Install an invocation override consulted before any leaf shape.
    pub fn set_caller(
        &self,
        caller: impl Fn(&mut Context<'_>, &Invoker) -> Option<Reply> + Send + Sync + 'static,
    ) {
        *self.custom.write() = Some(Arc::new(caller));
    }

    /// Install a custom serializer for structured ACK bodies.
    pub fn set_serializer(
        &self,
        serializer: impl Fn(&serde_json::Value) -> Result<Vec<u8>, Error> + Send + Sync + 'static,
    ) {
        *self.serializer.write() = Some(Arc::new(serializer));
    }

    /// Register a handler function at a path.
    pub fn register(
        &self,
        path: &str,
        handler: impl Fn(&mut Context<'_>) -> Option<Reply> + Send + Sync + 'static,
    ) {
        self.insert(path, Arc::new(Invoker::Func(Box::new(handler))));
    }

    /// Register every method of a bound object under a prefix.
    pub fn register_caller(&self, prefix: &str, caller: Arc<dyn Caller>) {
        for method in caller.methods() {
            let path = join_path(prefix, method);
            self.insert(
                &path,
                Arc::new(Invoker::Bound {
                    caller: caller.clone(),
                    method,
                }),
            );
        }
    }

    pub fn lookup(&self, path: &str) -> Option<Arc<Invoker>> {
        self.root.read().lookup(path.split('/'))
    }

    /// A service groups registrations under a name, tagged with the
    /// transport method the handlers answer on.
    pub fn service(&self, name: &str) -> Service<'_> {
        Service {
            registry: self,
            name: name.trim_matches('/').to_string(),
            method: "TCP",
        }
    }

    pub(crate) fn invoke(&self, invoker: &Invoker, ctx: &mut Context<'_>) -> Option<Reply> {
        let custom = self.custom.read().clone();
        if let Some(custom) = custom {
            return custom(ctx, invoker);
        }
        match invoker {
            Invoker::Func(handler) => handler(ctx),
            Invoker::Bound { caller, method } => caller.call(method, ctx),
        }
    }

    pub(crate) fn serialize_reply(
        &self,
        value: &serde_json::Value,
        request: &Message,
        protocol: &Protocol,
    ) -> Result<Vec<u8>, Error> {
        let serializer = self.serializer.read().clone();
        if let Some(serializer) = serializer {
            return serializer(value);
        }
        let magic = protocol.require_magic(request.magic())?;
        Ok(magic.encoding.encode(value)?)
    }

    fn insert(&self, path: &str, invoker: Arc<Invoker>) {
        tracing::debug!(path, "handler registered");
        self.root.write().insert(path.split('/'), invoker);
    }
}

/// Named group of handler registrations.
pub struct Service<'a> {
    registry: &'a Registry,
    name: String,
    method: &'static str,
}

impl Service<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transport method tag this service answers on.
    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn register(
        &self,
        path: &str,
        handler: impl Fn(&mut Context<'_>) -> Option<Reply> + Send + Sync + 'static,
    ) {
        self.registry.register(&join_path(&self.name, path), handler);
    }

    pub fn register_caller(&self, caller: Arc<dyn Caller>) {
        self.registry.register_caller(&self.name, caller);
    }
}

fn join_path(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let path = path.trim_matches('/');
    if prefix.is_empty() {
        format!("/{path}")
    } else {
        format!("/{prefix}/{path}")
    }
}
