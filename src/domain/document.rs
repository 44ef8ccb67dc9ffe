//! Documents and document identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field name carrying a document's identity within its collection.
pub const ID_FIELD: &str = "_id";

/// An opaque key-value record.
pub type Document = Map<String, Value>;

/// Canonical string form of a document `_id`.
///
/// Strings are kept as-is, `{"$oid": "<hex>"}` collapses to the hex string and
/// integers use their decimal form, so the same document always produces the
/// same id regardless of how the store encoded it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(String);

impl DocId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(id) => Some(Self(id.clone())),
            Value::Number(number) if number.is_i64() || number.is_u64() => {
                Some(Self(number.to_string()))
            }
            Value::Object(map) => match map.get("$oid") {
                Some(Value::String(hex)) => Some(Self(hex.clone())),
                _ => None,
            },
            _ => None,
        }
    }

    /// Read the id of a document, if it carries a usable `_id`.
    pub fn of(doc: &Document) -> Option<Self> {
        doc.get(ID_FIELD).and_then(Self::from_value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::String(self.0.clone())
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DocId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Rewrite the document's `_id` into its canonical string form.
pub fn normalize_id(doc: &mut Document) -> Option<DocId> {
    let id = DocId::of(doc)?;
    doc.insert(ID_FIELD.to_string(), id.to_value());
    Some(id)
}

/// Look up a possibly dotted field path (`address.city`).
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    if let Some(value) = doc.get(path) {
        return Some(value);
    }

    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn set_path(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let slot = doc.entry(head.to_string()).or_insert(Value::Null);
            set_nested(slot, rest, value);
        }
    }
}

fn set_nested(slot: &mut Value, path: &str, value: Value) {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };

    if let Value::Array(items) = slot {
        let Some(item) = head.parse::<usize>().ok().and_then(|index| items.get_mut(index)) else {
            return;
        };
        match rest {
            Some(rest) => set_nested(item, rest, value),
            None => *item = value,
        }
        return;
    }

    if !slot.is_object() {
        *slot = Value::Object(Document::new());
    }
    if let Value::Object(map) = slot {
        match rest {
            Some(rest) => set_nested(map.entry(head.to_string()).or_insert(Value::Null), rest, value),
            None => {
                map.insert(head.to_string(), value);
            }
        }
    }
}

fn unset_path(doc: &mut Document, path: &str) {
    let Some((head, rest)) = path.split_once('.') else {
        doc.remove(path);
        return;
    };
    if let Some(Value::Object(inner)) = doc.get_mut(head) {
        unset_path(inner, rest);
    }
}

/// Field-level changes carried by an update event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldDelta {
    pub set: Document,
    pub unset: Vec<String>,
}

impl FieldDelta {
    pub fn new(set: Document, unset: Vec<String>) -> Self {
        Self { set, unset }
    }

    /// Apply the delta in place. Dotted paths write into nested documents,
    /// creating intermediate objects as needed.
    pub fn apply(&self, doc: &mut Document) {
        for (field, value) in &self.set {
            set_path(doc, field, value.clone());
        }
        for field in &self.unset {
            unset_path(doc, field);
        }
    }

    /// Fields as delivered to subscribers; removed fields become explicit nulls.
    pub fn to_fields(&self, id: &DocId) -> Document {
        let mut fields = self.set.clone();
        for field in &self.unset {
            fields.insert(field.clone(), Value::Null);
        }
        fields.insert(ID_FIELD.to_string(), id.to_value());
        fields
    }
}
