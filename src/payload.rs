/// JSON-like payload values that may carry raw binary buffers inline.
///
/// The wire format is text JSON, so binary values cannot travel in the
/// payload itself. Before encoding, a depth-first walk replaces every
/// `Binary` node with a `{"_placeholder": true, "num": k}` marker and
/// collects the buffer into an attachment list; after all attachment frames
/// arrive, the inverse walk restores each buffer at its recorded index.
use bytes::Bytes;
use serde_json::{Map, Number, Value as JsonValue};
use std::collections::BTreeMap;

pub(crate) const PLACEHOLDER_KEY: &str = "_placeholder";
pub(crate) const PLACEHOLDER_NUM: &str = "num";

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    /// A raw binary buffer, transported as a separate attachment frame.
    Binary(Bytes),
    Array(Vec<Payload>),
    Object(BTreeMap<String, Payload>),
}

impl Payload {
    /// Whether this value contains a binary buffer at any depth.
    /// Drives EVENT vs BINARY_EVENT selection.
    pub fn has_binary(&self) -> bool {
        match self {
            Payload::Binary(_) => true,
            Payload::Array(items) => items.iter().any(Payload::has_binary),
            Payload::Object(map) => map.values().any(Payload::has_binary),
            _ => false,
        }
    }

    /// Depth-first walk replacing every binary value with a placeholder
    /// marker, appending the buffer to `buffers` in discovery order.
    pub fn deconstruct(&self, buffers: &mut Vec<Bytes>) -> JsonValue {
        match self {
            Payload::Null => JsonValue::Null,
            Payload::Bool(b) => JsonValue::Bool(*b),
            Payload::Number(n) => JsonValue::Number(n.clone()),
            Payload::String(s) => JsonValue::String(s.clone()),
            Payload::Binary(buf) => {
                let mut placeholder = Map::new();
                placeholder.insert(PLACEHOLDER_KEY.to_string(), JsonValue::Bool(true));
                placeholder.insert(PLACEHOLDER_NUM.to_string(), JsonValue::from(buffers.len()));
                buffers.push(buf.clone());
                JsonValue::Object(placeholder)
            }
            Payload::Array(items) => {
                JsonValue::Array(items.iter().map(|v| v.deconstruct(buffers)).collect())
            }
            Payload::Object(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.deconstruct(buffers)))
                    .collect(),
            ),
        }
    }

    /// Inverse of [`deconstruct`](Self::deconstruct): replaces every
    /// placeholder marker with the buffer at its recorded index. A
    /// placeholder referencing a missing buffer resolves to `Null`.
    pub fn resolve_placeholders(self, buffers: &[Bytes]) -> Payload {
        match self {
            Payload::Object(map) => {
                if map.get(PLACEHOLDER_KEY) == Some(&Payload::Bool(true)) {
                    let index = map
                        .get(PLACEHOLDER_NUM)
                        .and_then(|n| match n {
                            Payload::Number(n) => n.as_u64(),
                            _ => None,
                        })
                        .map(|n| n as usize);
                    return match index.and_then(|i| buffers.get(i)) {
                        Some(buf) => Payload::Binary(buf.clone()),
                        None => Payload::Null,
                    };
                }
                Payload::Object(
                    map.into_iter()
                        .map(|(k, v)| (k, v.resolve_placeholders(buffers)))
                        .collect(),
                )
            }
            Payload::Array(items) => Payload::Array(
                items
                    .into_iter()
                    .map(|v| v.resolve_placeholders(buffers))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Plain JSON conversion for payloads without binary values. A stray
    /// `Binary` node serializes as an array of byte numbers.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Payload::Null => JsonValue::Null,
            Payload::Bool(b) => JsonValue::Bool(*b),
            Payload::Number(n) => JsonValue::Number(n.clone()),
            Payload::String(s) => JsonValue::String(s.clone()),
            Payload::Binary(buf) => {
                JsonValue::Array(buf.iter().map(|b| JsonValue::from(*b)).collect())
            }
            Payload::Array(items) => JsonValue::Array(items.iter().map(Payload::to_json).collect()),
            Payload::Object(map) => JsonValue::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Payload]> {
        match self {
            Payload::Array(items) => Some(items),
            _ => None,
        }
    }
}

impl From<JsonValue> for Payload {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Payload::Null,
            JsonValue::Bool(b) => Payload::Bool(b),
            JsonValue::Number(n) => Payload::Number(n),
            JsonValue::String(s) => Payload::String(s),
            JsonValue::Array(items) => {
                Payload::Array(items.into_iter().map(Payload::from).collect())
            }
            JsonValue::Object(map) => Payload::Object(
                map.into_iter().map(|(k, v)| (k, Payload::from(v))).collect(),
            ),
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::String(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::String(value)
    }
}

impl From<bool> for Payload {
    fn from(value: bool) -> Self {
        Payload::Bool(value)
    }
}

impl From<i64> for Payload {
    fn from(value: i64) -> Self {
        Payload::Number(Number::from(value))
    }
}

impl From<u64> for Payload {
    fn from(value: u64) -> Self {
        Payload::Number(Number::from(value))
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Binary(value)
    }
}

impl From<Vec<Payload>> for Payload {
    fn from(value: Vec<Payload>) -> Self {
        Payload::Array(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_binary_at_depth() {
        let payload = Payload::Array(vec![
            Payload::from("a"),
            Payload::Object(BTreeMap::from([(
                "b".to_string(),
                Payload::Binary(Bytes::from_static(b"\x01\x02")),
            )])),
        ]);
        assert!(payload.has_binary());
        assert!(!Payload::from("a").has_binary());
    }

    #[test]
    fn deconstruct_then_resolve_round_trips() {
        let payload = Payload::Array(vec![
            Payload::from("a"),
            Payload::Object(BTreeMap::from([
                ("x".to_string(), Payload::Binary(Bytes::from_static(b"abc"))),
                (
                    "y".to_string(),
                    Payload::Array(vec![Payload::Binary(Bytes::from_static(b"def"))]),
                ),
            ])),
        ]);

        let mut buffers = Vec::new();
        let json = payload.deconstruct(&mut buffers);
        assert_eq!(buffers.len(), 2);

        let restored = Payload::from(json).resolve_placeholders(&buffers);
        assert_eq!(restored, payload);
    }

    #[test]
    fn placeholder_out_of_range_resolves_to_null() {
        let json = serde_json::json!({"_placeholder": true, "num": 5});
        let restored = Payload::from(json).resolve_placeholders(&[]);
        assert_eq!(restored, Payload::Null);
    }
}
