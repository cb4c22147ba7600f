//! Wire-visible paths and bodies of the pub/sub protocol.

use serde::{Deserialize, Serialize};

/// Handler paths served (and dialed) by the overlay.
pub const PATH_SUBSCRIBE: &str = "/pubsub/subscribe";
pub const PATH_QUEUE_SUBSCRIBE: &str = "/pubsub/queue_subscribe";
pub const PATH_UNSUBSCRIBE: &str = "/pubsub/unsubscribe";
pub const PATH_PUBLISH: &str = "/pubsub/publish";
pub const PATH_REQUEST: &str = "/pubsub/request";
pub const PATH_SUBSCRIBE_LIST: &str = "/pubsub/subscribe/list";
/// Path delivered messages arrive under on a remote subscriber.
pub const PATH_MESSAGE: &str = "/pubsub/message";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeData {
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSubscribeData {
    pub topics: Vec<String>,
    pub queue: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeData {
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishData {
    pub topic: String,
    pub message: serde_json::Value,
}

/// Ask the topic's subscribers for exactly one answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestData {
    pub topic: String,
    pub message: serde_json::Value,
    /// Milliseconds to wait for the reply.
    pub timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeListData {
    pub topics: Vec<String>,
}

/// Body of every delivered message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageData {
    pub topic: String,
    pub message: serde_json::Value,
    /// Reply inbox a responder publishes the answer to. Present only on
    /// request deliveries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
}

/// Uniform response body for the overlay's handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseData {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ResponseData {
    pub fn ok(code: &str, message: &str) -> ResponseData {
        ResponseData {
            code: code.to_string(),
            message: message.to_string(),
            data: None,
        }
    }

    pub fn with_data(code: &str, message: &str, data: serde_json::Value) -> ResponseData {
        ResponseData {
            code: code.to_string(),
            message: message.to_string(),
            data: Some(data),
        }
    }
}
