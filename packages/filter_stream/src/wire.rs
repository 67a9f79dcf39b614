//! Connection-target encoding of the combined filter set.
//!
//! The whole filter set travels in the last path segment of the WebSocket URL:
//! a JSON array of filter documents, URL-safe base64 without padding.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;

use crate::error::{Result, StreamError};
use crate::filter::{Filter, SubscriberId};

/// Encode `filters` as a URL path segment.
pub fn encode_filter_set(filters: &[Filter]) -> Result<String> {
    let json = serde_json::to_vec(filters).map_err(|e| StreamError::Encode(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

/// Decode the filter set carried by a connection path.
///
/// Accepts either the bare segment or a full path/URL; only the last
/// non-empty path segment is decoded. Trailing `=` padding is tolerated.
/// Every document must be an object stamped with its subscriber id.
pub fn decode_filter_set(path: &str) -> Result<BTreeMap<SubscriberId, Filter>> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let segment = path
        .rsplit('/')
        .find(|s| !s.is_empty())
        .ok_or_else(|| StreamError::Encode(format!("no filter segment in {path:?}")))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| StreamError::Encode(format!("invalid base64: {e}")))?;
    let documents: Vec<Value> = serde_json::from_slice(&bytes)
        .map_err(|e| StreamError::Encode(format!("invalid filter array: {e}")))?;

    let mut filters = BTreeMap::new();
    for document in documents {
        if !document.is_object() {
            return Err(StreamError::Encode("filter is not an object".into()));
        }
        let filter: Filter =
            serde_json::from_value(document).map_err(|e| StreamError::Encode(e.to_string()))?;
        let id = filter
            .subscriber_id()
            .ok_or_else(|| StreamError::Encode("filter carries no subscriber id".into()))?;
        filters.insert(id, filter);
    }
    Ok(filters)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(id: &str, json: &str) -> Filter {
        Filter::parse(&SubscriberId::from(id), json).unwrap()
    }

    #[test]
    fn test_encoding_is_url_safe() {
        // Enough non-ASCII and high bytes to produce '+' and '/' in standard base64.
        let filters = vec![filter(
            "u1",
            r#"{"data_type":"article","query":{"keyword":["?>?>?>~~~ÿÿÿ"]}}"#,
        )];
        let encoded = encode_filter_set(&filters).unwrap();
        assert!(
            encoded
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            "{encoded}"
        );
    }

    #[test]
    fn test_round_trip() {
        let filters = vec![
            filter("a", r#"{"data_type":"page","options":{"preload":false}}"#),
            filter("b", r#"{"data_type":"metric","agg":{"name":"avg"}}"#),
        ];
        let encoded = encode_filter_set(&filters).unwrap();
        let decoded = decode_filter_set(&format!("ws://localhost:8080/{encoded}")).unwrap();

        assert_eq!(decoded.len(), 2);
        for f in &filters {
            assert_eq!(decoded.get(&f.subscriber_id().unwrap()), Some(f));
        }
    }

    #[test]
    fn test_empty_set_encodes_empty_array() {
        let encoded = encode_filter_set(&[]).unwrap();
        assert_eq!(URL_SAFE_NO_PAD.decode(&encoded).unwrap(), b"[]");
        assert!(decode_filter_set(&encoded).unwrap().is_empty());
    }

    #[test]
    fn test_decode_tolerates_padding_and_query() {
        let filters = vec![filter("a", "{}")];
        let encoded = encode_filter_set(&filters).unwrap();
        let decoded = decode_filter_set(&format!("/{encoded}==?token=abc")).unwrap();
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_filter_set("/").is_err());
        assert!(decode_filter_set("/!!!").is_err());
        // Valid base64 of `{}`: an object, not an array.
        assert!(decode_filter_set(&URL_SAFE_NO_PAD.encode("{}")).is_err());
        // Array entry without a routing id.
        assert!(decode_filter_set(&URL_SAFE_NO_PAD.encode(r#"[{"data_type":"x"}]"#)).is_err());
    }
}
