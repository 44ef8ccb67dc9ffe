//! Cache key definitions.
//!
//! Defines `Fingerprint` for cache entries, `FeedKey` for shared change feeds,
//! and the identifiers of entries, subscribers and sessions.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::document::Document;
use crate::domain::sort::SortSpec;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("malformed cache key `{key}`: {reason}")]
    Malformed { key: String, reason: String },
}

impl KeyError {
    fn malformed(key: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Serialize a JSON value with object keys in sorted order at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Query shape recovered from a fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryShape {
    pub collection: String,
    pub filter: Document,
    pub sort: Option<SortSpec>,
}

/// Deterministic identity of a query shape: collection, filter and sort.
///
/// Two requests with the same shape share one cache entry regardless of the
/// key order inside their filters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(collection: &str, filter: &Document, sort: Option<&SortSpec>) -> Self {
        let mut shape = Map::new();
        shape.insert("collection".to_string(), Value::String(collection.to_string()));
        shape.insert("filter".to_string(), Value::Object(filter.clone()));
        shape.insert(
            "sort".to_string(),
            sort.map_or(Value::Null, |sort| Value::Object(sort.to_document())),
        );
        Self(canonical_json(&Value::Object(shape)))
    }

    /// Wrap an externally supplied key without validating it.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parse(&self) -> Result<QueryShape, KeyError> {
        let value: Value = serde_json::from_str(&self.0)
            .map_err(|err| KeyError::malformed(&self.0, err.to_string()))?;
        let Value::Object(mut shape) = value else {
            return Err(KeyError::malformed(&self.0, "expected an object"));
        };

        let collection = match shape.remove("collection") {
            Some(Value::String(collection)) => collection,
            _ => return Err(KeyError::malformed(&self.0, "missing collection")),
        };
        let filter = match shape.remove("filter") {
            Some(Value::Object(filter)) => filter,
            None | Some(Value::Null) => Document::new(),
            _ => return Err(KeyError::malformed(&self.0, "filter must be an object")),
        };
        let sort = match shape.remove("sort") {
            None | Some(Value::Null) => None,
            Some(Value::Object(sort)) => Some(
                SortSpec::from_document(&sort)
                    .ok_or_else(|| KeyError::malformed(&self.0, "unsupported sort"))?,
            ),
            _ => return Err(KeyError::malformed(&self.0, "sort must be an object")),
        };

        Ok(QueryShape {
            collection,
            filter,
            sort,
        })
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a shared change feed: collection plus the feed filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedKey(String);

impl FeedKey {
    pub fn new(collection: &str, filter: &Document) -> Self {
        let mut shape = Map::new();
        shape.insert("collection".to_string(), Value::String(collection.to_string()));
        shape.insert("filter".to_string(), Value::Object(filter.clone()));
        Self(canonical_json(&Value::Object(shape)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one cache entry's lifetime; a recreated entry gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }
    };
}

string_id!(
    /// One live subscription.
    SubscriberId
);
string_id!(
    /// One client connection; a session may own many subscriptions.
    SessionId
);

/// Compute a hash for any hashable value.
pub fn hash_value<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn fingerprint_is_independent_of_key_order() {
        let a: Document = serde_json::from_str(r#"{"owner":"u1","status":{"$in":["a","b"]}}"#)
            .expect("json");
        let b: Document = serde_json::from_str(r#"{"status":{"$in":["a","b"]},"owner":"u1"}"#)
            .expect("json");
        let sort = SortSpec::descending("createdAt");
        assert_eq!(
            Fingerprint::new("posts", &a, Some(&sort)),
            Fingerprint::new("posts", &b, Some(&sort))
        );
        assert_ne!(
            Fingerprint::new("posts", &a, Some(&sort)),
            Fingerprint::new("posts", &a, None)
        );
        assert_eq!(
            hash_value(&Fingerprint::new("posts", &a, None)),
            hash_value(&Fingerprint::new("posts", &b, None))
        );
    }

    #[test]
    fn fingerprint_parses_back_into_shape() {
        let filter = doc(json!({"owner": "u1"}));
        let sort = SortSpec::ascending("rank");
        let shape = Fingerprint::new("posts", &filter, Some(&sort))
            .parse()
            .expect("shape");
        assert_eq!(shape.collection, "posts");
        assert_eq!(shape.filter, filter);
        assert_eq!(shape.sort, Some(sort));
    }

    #[test]
    fn malformed_fingerprint_is_rejected() {
        assert!(Fingerprint::from_raw("not json").parse().is_err());
        assert!(Fingerprint::from_raw(r#"{"filter":{}}"#).parse().is_err());
        assert!(
            Fingerprint::from_raw(r#"{"collection":"c","sort":{"a":1,"b":1}}"#)
                .parse()
                .is_err()
        );
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        assert_eq!(
            canonical_json(&json!({"b": [{"y": 1, "x": 2}], "a": null})),
            r#"{"a":null,"b":[{"x":2,"y":1}]}"#
        );
    }

    #[test]
    fn feed_keys_differ_by_filter() {
        assert_ne!(
            FeedKey::new("posts", &doc(json!({"status": "open"}))),
            FeedKey::new("posts", &Document::new())
        );
        assert_ne!(EntryId::new(), EntryId::new());
    }
}
