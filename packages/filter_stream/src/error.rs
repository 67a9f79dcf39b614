use tokio_tungstenite::tungstenite;

use crate::filter::SubscriberId;

/// Errors produced by the streaming client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The filter document is not a JSON object.
    #[error("malformed filter JSON: {0}")]
    MalformedFilterJson(String),

    /// An inbound batch's first entity carries no routing id.
    #[error("no subscriber id in inbound batch")]
    NoSubscriberId,

    /// An inbound batch names a subscriber that is not registered.
    #[error("unknown subscriber: {0}")]
    UnknownSubscriber(SubscriberId),

    /// An inbound frame is not a `{ "data": [...] }` object.
    #[error("malformed inbound batch: {0}")]
    MalformedBatch(String),

    /// The transport failed before reaching the open state.
    #[error("transport error: {0}")]
    Transport(String),

    /// A filter set could not be encoded into, or decoded from, a connection target.
    #[error("filter set encoding error: {0}")]
    Encode(String),

    /// The client has shut down.
    #[error("stream client is closed")]
    Closed,
}

impl StreamError {
    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
