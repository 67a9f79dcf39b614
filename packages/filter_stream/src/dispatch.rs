//! Demultiplexing of inbound batches to subscriber callbacks.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Result, StreamError};
use crate::filter::{ROUTING_KEY, SubscriberId};
use crate::registry::{Callback, FilterRegistry};

/// One inbound wire message: `{ "type": ..., "data": [entity, ...] }`.
///
/// Every entity carries its subscriber id under [`ROUTING_KEY`]. The server
/// never interleaves subscribers within one batch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundBatch {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    /// Missing and `null` both mean an empty batch.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub data: Vec<Value>,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl InboundBatch {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| StreamError::MalformedBatch(e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Routing id of the first entity. `Ok(None)` for an empty batch.
    pub fn subscriber_id(&self) -> Result<Option<SubscriberId>> {
        let Some(first) = self.data.first() else {
            return Ok(None);
        };
        first
            .get(ROUTING_KEY)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(|id| Some(SubscriberId::from(id)))
            .ok_or(StreamError::NoSubscriberId)
    }
}

/// Resolve the callback a batch belongs to without invoking it.
///
/// Returns `Ok(None)` for an empty batch. The callback is cloned out of the
/// registry so the caller can drop its borrow before invoking it.
pub fn route(
    registry: &FilterRegistry,
    batch: &InboundBatch,
) -> Result<Option<(SubscriberId, Callback)>> {
    let Some(id) = batch.subscriber_id()? else {
        return Ok(None);
    };
    match registry.callback(&id) {
        Some(callback) => Ok(Some((id, callback))),
        None => Err(StreamError::UnknownSubscriber(id)),
    }
}

/// Deliver `batch` to the one subscriber it belongs to.
///
/// Only the first entity's id is inspected; the whole batch is handed to that
/// subscriber exactly once. Returns the subscriber that received it.
pub fn dispatch_batch(
    registry: &FilterRegistry,
    batch: &InboundBatch,
) -> Result<Option<SubscriberId>> {
    let Some((id, callback)) = route(registry, batch)? else {
        return Ok(None);
    };
    callback(batch);
    Ok(Some(id))
}
