//! Wire-facing handlers: the overlay registered as a service on the hub.

use std::sync::{Arc, Weak};

use tether_core::{Context, EventType, Flags, Hub, Reply};

use crate::wire::{
    MessageData, PublishData, QueueSubscribeData, RequestData, ResponseData, SubscribeData,
    SubscribeListData, UnsubscribeData, PATH_MESSAGE, PATH_PUBLISH, PATH_QUEUE_SUBSCRIBE,
    PATH_REQUEST, PATH_SUBSCRIBE, PATH_SUBSCRIBE_LIST, PATH_UNSUBSCRIBE,
};
use crate::PubSub;

/// Build the overlay for a hub: register its handlers under `pubsub/` and
/// hook `Disconnect` so dead sockets drop all their subscriptions.
///
/// Handler closures hold the overlay weakly; the returned `Arc` is the
/// owning reference.
pub fn attach(hub: &Arc<Hub>) -> Arc<PubSub> {
    let pubsub = Arc::new(PubSub::new(hub.clone()));
    register(hub, Arc::downgrade(&pubsub));

    let hook = Arc::downgrade(&pubsub);
    hub.on(EventType::Disconnect, move |socket, _| {
        if let Some(pubsub) = hook.upgrade() {
            pubsub.unsubscribe_all(socket.id());
        }
        true
    });
    pubsub
}

fn register(hub: &Arc<Hub>, pubsub: Weak<PubSub>) {
    let registry = hub.registry();

    let overlay = pubsub.clone();
    registry.register(PATH_SUBSCRIBE, move |ctx| {
        let pubsub = overlay.upgrade()?;
        let data: SubscribeData = match ctx.bind() {
            Ok(data) => data,
            Err(_) => return invalid_data(),
        };
        for topic in &data.topics {
            pubsub.subscribe(ctx.socket(), topic, None);
        }
        Reply::json(&ResponseData::ok("subscribed", "subscription recorded"))
    });

    let overlay = pubsub.clone();
    registry.register(PATH_QUEUE_SUBSCRIBE, move |ctx| {
        let pubsub = overlay.upgrade()?;
        let data: QueueSubscribeData = match ctx.bind() {
            Ok(data) => data,
            Err(_) => return invalid_data(),
        };
        for topic in &data.topics {
            pubsub.queue_subscribe(ctx.socket(), topic, &data.queue, None);
        }
        Reply::json(&ResponseData::ok("queue_subscribed", "queue subscription recorded"))
    });

    let overlay = pubsub.clone();
    registry.register(PATH_UNSUBSCRIBE, move |ctx| {
        let pubsub = overlay.upgrade()?;
        let data: UnsubscribeData = match ctx.bind() {
            Ok(data) => data,
            Err(_) => return invalid_data(),
        };
        for topic in &data.topics {
            pubsub.unsubscribe(ctx.socket().id(), topic);
        }
        Reply::json(&ResponseData::ok("unsubscribed", "subscription removed"))
    });

    let overlay = pubsub.clone();
    registry.register(PATH_PUBLISH, move |ctx| {
        let pubsub = overlay.upgrade()?;
        let data: PublishData = match ctx.bind() {
            Ok(data) => data,
            Err(_) => return invalid_data(),
        };
        let delivered = pubsub.publish(&data.topic, &data.message);
        Reply::json(&ResponseData::with_data(
            "published",
            "message published",
            serde_json::json!({ "delivered": delivered }),
        ))
    });

    // The wait for the answer must not block the read task: the handler
    // returns no reply and a detached task sends the correlated ack once
    // the response (or the deadline) arrives.
    let overlay = pubsub.clone();
    registry.register(PATH_REQUEST, move |ctx| {
        let pubsub = overlay.upgrade()?;
        let data: RequestData = match ctx.bind() {
            Ok(data) => data,
            Err(_) => return invalid_data(),
        };
        let socket = ctx.socket().clone();
        let index = ctx.index();
        let wants_ack = ctx.flags().contains(Flags::NEED_ACK) && index != 0;
        let confirm = {
            let s2c = &pubsub.hub().options().s2c_confirm;
            if s2c.is_empty() {
                ctx.path().to_string()
            } else {
                s2c.clone()
            }
        };
        tokio::spawn(async move {
            let response = pubsub.request(&data.topic, &data.message, data.timeout).await;
            if !wants_ack {
                return;
            }
            let body = match response {
                Some(value) => ResponseData::with_data("requested", "request answered", value),
                None => ResponseData::ok("request_timeout", "no reply before the deadline"),
            };
            let _ = socket.send(Flags::IS_ACK, index, &confirm, &body).await;
        });
        None
    });

    let overlay = pubsub.clone();
    registry.register(PATH_SUBSCRIBE_LIST, move |ctx| {
        let pubsub = overlay.upgrade()?;
        let topics = pubsub.subscriptions(ctx.socket().id());
        let data = serde_json::to_value(SubscribeListData { topics }).ok()?;
        Reply::json(&ResponseData::with_data(
            "subscriptions",
            "subscription list",
            data,
        ))
    });

    // Messages published by an upstream hub we subscribed to: hand them to
    // the local handlers, no reply.
    let overlay = pubsub;
    registry.register(PATH_MESSAGE, move |ctx: &mut Context<'_>| {
        let pubsub = overlay.upgrade()?;
        match ctx.bind::<MessageData>() {
            Ok(data) => pubsub.dispatch_local(&data.topic, &data.message, data.reply.as_deref()),
            Err(err) => tracing::debug!(%err, "malformed pubsub delivery"),
        }
        None
    });
}

fn invalid_data() -> Option<Reply> {
    Reply::json(&ResponseData::ok("invalid_data", "malformed request body"))
}
