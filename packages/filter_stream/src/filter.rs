//! Filter documents and subscriber identity.
//!
//! A filter is an opaque JSON object owned by the subscriber that produced it.
//! The client only ever touches two places inside it: the routing key, which is
//! stamped with the subscriber id so replies can be routed back, and
//! `options.preload`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StreamError};

/// Key under which the subscriber id is stamped into outbound filters and
/// echoed back in every inbound entity.
pub const ROUTING_KEY: &str = "callback";

const OPTIONS_KEY: &str = "options";
const PRELOAD_KEY: &str = "preload";
const DATA_TYPE_KEY: &str = "data_type";

/// Opaque identifier correlating a filter, its callback and inbound batches.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SubscriberId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A subscriber's query descriptor plus delivery options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(Map<String, Value>);

impl Filter {
    /// Parse a filter document and stamp `subscriber_id` under [`ROUTING_KEY`].
    pub fn parse(subscriber_id: &SubscriberId, filter_json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(filter_json)
            .map_err(|e| StreamError::MalformedFilterJson(e.to_string()))?;
        Self::from_value(subscriber_id, value)
    }

    /// Stamp an already-parsed document.
    pub fn from_value(subscriber_id: &SubscriberId, value: Value) -> Result<Self> {
        let Value::Object(doc) = value else {
            return Err(StreamError::MalformedFilterJson(format!(
                "expected a JSON object, got {}",
                kind_of(&value)
            )));
        };
        Ok(Self(doc).stamped(subscriber_id))
    }

    /// This filter with `subscriber_id` written under [`ROUTING_KEY`],
    /// replacing any id it already carried.
    pub fn stamped(mut self, subscriber_id: &SubscriberId) -> Self {
        self.0.insert(
            ROUTING_KEY.to_string(),
            Value::String(subscriber_id.as_str().to_string()),
        );
        self
    }

    /// The stamped routing id, if the document carries one.
    pub fn subscriber_id(&self) -> Option<SubscriberId> {
        self.0
            .get(ROUTING_KEY)
            .and_then(Value::as_str)
            .map(SubscriberId::from)
    }

    pub fn data_type(&self) -> Option<&str> {
        self.0.get(DATA_TYPE_KEY).and_then(Value::as_str)
    }

    /// Whether the server should replay history for this filter. Absent means no.
    pub fn preload(&self) -> bool {
        self.0
            .get(OPTIONS_KEY)
            .and_then(|options| options.get(PRELOAD_KEY))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// A copy of this filter with `options.preload` forced to `false`.
    ///
    /// A missing or non-object `options` is replaced by `{ "preload": false }`.
    pub fn without_preload(&self) -> Self {
        let mut doc = self.0.clone();
        let options = doc
            .entry(OPTIONS_KEY)
            .or_insert_with(|| Value::Object(Map::new()));
        if !options.is_object() {
            *options = Value::Object(Map::new());
        }
        if let Value::Object(options) = options {
            options.insert(PRELOAD_KEY.to_string(), Value::Bool(false));
        }
        Self(doc)
    }

    pub fn as_document(&self) -> &Map<String, Value> {
        &self.0
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
