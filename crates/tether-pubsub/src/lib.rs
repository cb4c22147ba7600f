//! Publish/subscribe overlay on top of the tether core.
//!
//! Subscriptions are kept per topic; publishing fans out to direct
//! subscribers plus any wildcard subscriptions whose pattern matches.
//! Patterns use `.`-separated segments with `*` matching exactly one
//! segment and `>` matching the remaining one-or-more. Queue groups
//! deliver each message to exactly one member of the group; ungrouped
//! subscribers each get their own copy.
//!
//! Delivery to a remote subscriber enqueues a frame under
//! [`PATH_MESSAGE`]; local subscribers registered with a handler are
//! called directly. Subscribe/unsubscribe records are forwarded over every
//! client-role socket so an upstream hub learns what this process wants.
//!
//! [`PubSub::request`] layers ask-one-reply on top of publish: the fan-out
//! carries a generated reply inbox and the caller waits (bounded by the
//! timeout) for the first publish addressed to that inbox.

mod handler;
mod wire;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tether_core::{Flags, Hub, Role, Socket};
use tokio::sync::oneshot;

pub use handler::attach;
pub use wire::{
    MessageData, PublishData, QueueSubscribeData, RequestData, ResponseData, SubscribeData,
    SubscribeListData, UnsubscribeData, PATH_MESSAGE, PATH_PUBLISH, PATH_QUEUE_SUBSCRIBE,
    PATH_REQUEST, PATH_SUBSCRIBE, PATH_SUBSCRIBE_LIST, PATH_UNSUBSCRIBE,
};

/// Topic prefix of generated reply inboxes.
const INBOX_PREFIX: &str = "_inbox.";

/// Callback for subscriptions served inside this process. The third
/// argument is the reply inbox when the delivery is a request.
pub type LocalHandler = Arc<dyn Fn(&str, &serde_json::Value, Option<&str>) + Send + Sync>;

#[derive(Clone)]
struct Subscriber {
    socket: Weak<Socket>,
    queue: Option<String>,
    handler: Option<LocalHandler>,
}

/// Topic subscription table bound to one hub.
pub struct PubSub {
    hub: Arc<Hub>,
    topics: RwLock<HashMap<String, HashMap<u64, Subscriber>>>,
    /// In-flight requests keyed by reply inbox topic.
    pending: Mutex<HashMap<String, oneshot::Sender<serde_json::Value>>>,
    rotation: AtomicUsize,
    request_seq: AtomicU64,
}

impl PubSub {
    pub fn new(hub: Arc<Hub>) -> Self {
        PubSub {
            hub,
            topics: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            rotation: AtomicUsize::new(0),
            request_seq: AtomicU64::new(0),
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Subscribe a socket to a topic. A `handler` makes delivery local;
    /// without one, published messages are written to the socket.
    pub fn subscribe(&self, socket: &Arc<Socket>, topic: &str, handler: Option<LocalHandler>) {
        self.add(socket, topic, None, handler);
    }

    /// Subscribe as a member of a queue group: each published message
    /// reaches exactly one member per group.
    pub fn queue_subscribe(
        &self,
        socket: &Arc<Socket>,
        topic: &str,
        queue: &str,
        handler: Option<LocalHandler>,
    ) {
        self.add(socket, topic, Some(queue.to_string()), handler);
    }

    pub fn unsubscribe(&self, socket_id: u64, topic: &str) {
        {
            let mut topics = self.topics.write();
            if let Some(subscribers) = topics.get_mut(topic) {
                subscribers.remove(&socket_id);
                if subscribers.is_empty() {
                    topics.remove(topic);
                }
            }
        }
        self.forward(
            wire::PATH_UNSUBSCRIBE,
            &wire::UnsubscribeData {
                topics: vec![topic.to_string()],
            },
        );
    }

    pub fn unsubscribe_all(&self, socket_id: u64) {
        let removed: Vec<String> = {
            let mut topics = self.topics.write();
            let mut removed = Vec::new();
            topics.retain(|topic, subscribers| {
                if subscribers.remove(&socket_id).is_some() {
                    removed.push(topic.clone());
                }
                !subscribers.is_empty()
            });
            removed
        };
        if !removed.is_empty() {
            self.forward(wire::PATH_UNSUBSCRIBE, &wire::UnsubscribeData { topics: removed });
        }
    }

    /// Fan a message out to every matching subscription. Returns the number
    /// of deliveries made.
    ///
    /// A publish addressed to a pending reply inbox completes that request
    /// instead of fanning out.
    pub fn publish(&self, topic: &str, message: &serde_json::Value) -> usize {
        if let Some(reply_tx) = self.pending.lock().remove(topic) {
            let _ = reply_tx.send(message.clone());
            return 1;
        }
        self.fan_out(topic, message, None)
    }

    /// Ask the topic's subscribers for exactly one answer.
    ///
    /// The fan-out carries a generated reply inbox; the first publish to
    /// that inbox resolves the call. Resolves empty after `timeout`
    /// milliseconds, or immediately when nothing is subscribed.
    pub async fn request(
        &self,
        topic: &str,
        message: &serde_json::Value,
        timeout: u64,
    ) -> Option<serde_json::Value> {
        let id = self.request_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let inbox = format!("{INBOX_PREFIX}{id}");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(inbox.clone(), reply_tx);
        if self.fan_out(topic, message, Some(&inbox)) == 0 {
            self.pending.lock().remove(&inbox);
            return None;
        }
        let reply = tokio::time::timeout(Duration::from_millis(timeout), reply_rx).await;
        self.pending.lock().remove(&inbox);
        match reply {
            Ok(Ok(value)) => Some(value),
            _ => None,
        }
    }

    fn fan_out(&self, topic: &str, message: &serde_json::Value, reply: Option<&str>) -> usize {
        let matched: Vec<Subscriber> = {
            let topics = self.topics.read();
            let mut matched: HashMap<u64, Subscriber> = HashMap::new();
            for (key, subscribers) in topics.iter() {
                let hit = key == topic
                    || (key.contains('*') || key.contains('>')) && topic_matches(key, topic);
                if hit {
                    for (id, subscriber) in subscribers {
                        matched.entry(*id).or_insert_with(|| subscriber.clone());
                    }
                }
            }
            matched.into_values().collect()
        };
        if matched.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        let mut groups: HashMap<String, Vec<Subscriber>> = HashMap::new();
        for subscriber in matched {
            match &subscriber.queue {
                Some(queue) => groups.entry(queue.clone()).or_default().push(subscriber),
                None => {
                    if self.deliver(&subscriber, topic, message, reply) {
                        delivered += 1;
                    }
                }
            }
        }
        for (_, members) in groups {
            let pick = self.rotation.fetch_add(1, Ordering::Relaxed) % members.len();
            if self.deliver(&members[pick], topic, message, reply) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Topics a socket is subscribed to.
    pub fn subscriptions(&self, socket_id: u64) -> Vec<String> {
        self.topics
            .read()
            .iter()
            .filter(|(_, subscribers)| subscribers.contains_key(&socket_id))
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    /// Deliver an inbound published message to the local handlers
    /// subscribed here. Remote sockets are not re-published to; the
    /// origin hub fans out to its own subscribers. An inbound delivery
    /// addressed to a pending reply inbox completes that request.
    pub(crate) fn dispatch_local(
        &self,
        topic: &str,
        message: &serde_json::Value,
        reply: Option<&str>,
    ) {
        if let Some(reply_tx) = self.pending.lock().remove(topic) {
            let _ = reply_tx.send(message.clone());
            return;
        }
        let handlers: Vec<LocalHandler> = {
            let topics = self.topics.read();
            let mut handlers = Vec::new();
            for (key, subscribers) in topics.iter() {
                let hit = key == topic
                    || (key.contains('*') || key.contains('>')) && topic_matches(key, topic);
                if hit {
                    handlers.extend(subscribers.values().filter_map(|s| s.handler.clone()));
                }
            }
            handlers
        };
        for handler in handlers {
            handler(topic, message, reply);
        }
    }

    fn add(
        &self,
        socket: &Arc<Socket>,
        topic: &str,
        queue: Option<String>,
        handler: Option<LocalHandler>,
    ) {
        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .insert(
                socket.id(),
                Subscriber {
                    socket: Arc::downgrade(socket),
                    queue,
                    handler,
                },
            );
        self.forward(
            wire::PATH_SUBSCRIBE,
            &wire::SubscribeData {
                topics: vec![topic.to_string()],
            },
        );
    }

    fn deliver(
        &self,
        subscriber: &Subscriber,
        topic: &str,
        message: &serde_json::Value,
        reply: Option<&str>,
    ) -> bool {
        if let Some(handler) = &subscriber.handler {
            handler(topic, message, reply);
            return true;
        }
        let Some(socket) = subscriber.socket.upgrade() else {
            return false;
        };
        let protocol = self.hub.protocol().clone();
        let body = wire::MessageData {
            topic: topic.to_string(),
            message: message.clone(),
            reply: reply.map(str::to_string),
        };
        let mut msg = protocol.acquire();
        match msg.marshal(
            socket.magic(),
            Flags::empty(),
            0,
            wire::PATH_MESSAGE,
            &body,
            &protocol,
        ) {
            Ok(()) => {
                socket.write_async(msg);
                true
            }
            Err(err) => {
                tracing::debug!(id = socket.id(), %err, "pubsub delivery marshal failed");
                protocol.release(msg);
                false
            }
        }
    }

    /// Forward a subscription record over every client-role socket so the
    /// upstream hub tracks this process's interests.
    fn forward<T: Serialize>(&self, path: &str, body: &T) {
        let protocol = self.hub.protocol().clone();
        self.hub.each(|socket| {
            if socket.role() == Role::Client {
                let mut msg = protocol.acquire();
                match msg.marshal(socket.magic(), Flags::empty(), 0, path, body, &protocol) {
                    Ok(()) => {
                        socket.write_async(msg);
                    }
                    Err(err) => {
                        tracing::debug!(id = socket.id(), %err, "pubsub forward marshal failed");
                        protocol.release(msg);
                    }
                }
            }
            true
        });
    }
}

/// `*` matches exactly one segment, `>` matches the remaining one or more.
fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern = pattern.split('.');
    let mut topic = topic.split('.');
    loop {
        match (pattern.next(), topic.next()) {
            (None, None) => return true,
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(want), Some(got)) if want == got => continue,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matching_table() {
        let cases = [
            ("orders.created", "orders.created", true),
            ("orders.created", "orders.deleted", false),
            ("orders.*", "orders.created", true),
            ("orders.*", "orders.created.eu", false),
            ("orders.*.eu", "orders.created.eu", true),
            ("orders.>", "orders.created", true),
            ("orders.>", "orders.created.eu", true),
            ("orders.>", "orders", false),
            (">", "anything", true),
            ("*", "one", true),
            ("*", "one.two", false),
        ];
        for (pattern, topic, expected) in cases {
            assert_eq!(
                topic_matches(pattern, topic),
                expected,
                "pattern {pattern:?} vs topic {topic:?}"
            );
        }
    }
}
