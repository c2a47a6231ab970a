//! Conversion between driver-native BSON trees and the generic [`Value`] shape used by callers.
//!
//! The driver hands back documents, arrays and typed scalars depending on how a query was
//! shaped. Everything leaving the storage layer goes through [`normalize`] so callers only ever
//! see `serde_json` maps, arrays and scalars.

use mongodb::bson::{Bson, Document};
use serde_json::{Map, Number, Value};

use super::storage::{StorageError, StorageResult};

/// Recursive conversion into the generic container representation.
///
/// Implementations must be idempotent: normalizing a [`Value`] returns it unchanged.
pub trait Normalize {
    /// Consume `self` and produce the generic tree.
    fn normalize(self) -> Value;
}

/// Normalize any supported tree into a [`Value`].
pub fn normalize<T: Normalize>(value: T) -> Value {
    value.normalize()
}

impl Normalize for Bson {
    fn normalize(self) -> Value {
        match self {
            Bson::Document(document) => document.normalize(),
            Bson::Array(items) => items.normalize(),
            Bson::Null | Bson::Undefined | Bson::MinKey | Bson::MaxKey => Value::Null,
            Bson::Boolean(flag) => Value::Bool(flag),
            Bson::Int32(number) => Value::from(number),
            Bson::Int64(number) => Value::from(number),
            Bson::Double(number) => Number::from_f64(number).map_or(Value::Null, Value::Number),
            Bson::String(text) | Bson::Symbol(text) => Value::String(text),
            Bson::ObjectId(oid) => Value::String(oid.to_hex()),
            Bson::DateTime(at) => Value::from(at.timestamp_millis()),
            Bson::Binary(binary) => binary.bytes.into_iter().map(Value::from).collect(),
            other => Value::String(other.to_string()),
        }
    }
}

impl Normalize for Document {
    fn normalize(self) -> Value {
        Value::Object(
            self.into_iter()
                .map(|(key, value)| (key, value.normalize()))
                .collect(),
        )
    }
}

impl Normalize for Vec<Bson> {
    fn normalize(self) -> Value {
        Value::Array(self.into_iter().map(Normalize::normalize).collect())
    }
}

// Already generic: nothing below a `Value` can be driver-native.
impl Normalize for Value {
    fn normalize(self) -> Value {
        self
    }
}

/// Shape a generic value into the BSON tree the driver persists.
pub fn encode(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(flag) => Bson::Boolean(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => Bson::Int64(integer),
            None => number.as_f64().map_or(Bson::Null, Bson::Double),
        },
        Value::String(text) => Bson::String(text.clone()),
        Value::Array(items) => Bson::Array(items.iter().map(encode).collect()),
        Value::Object(map) => Bson::Document(encode_map(map)),
    }
}

/// Shape a generic value that must be a mapping into a BSON document.
pub fn encode_document(value: &Value) -> StorageResult<Document> {
    match value {
        Value::Object(map) => Ok(encode_map(map)),
        other => Err(StorageError::decode(format!(
            "expected an object, found {}",
            kind_of(other)
        ))),
    }
}

fn encode_map(map: &Map<String, Value>) -> Document {
    let mut document = Document::new();
    for (key, value) in map {
        document.insert(key.clone(), encode(value));
    }
    document
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

#[cfg(test)]
mod tests {
    use mongodb::bson::{DateTime, doc, oid::ObjectId};
    use serde_json::json;

    use super::*;

    #[test]
    fn nested_documents_become_objects() {
        let document = doc! {
            "hp": 100,
            "items": ["sword", {"name": "shield", "tags": [1, 2]}],
            "pos": {"x": 1.5, "y": -2.0},
        };

        assert_eq!(
            normalize(document),
            json!({
                "hp": 100,
                "items": ["sword", {"name": "shield", "tags": [1, 2]}],
                "pos": {"x": 1.5, "y": -2.0},
            })
        );
    }

    #[test]
    fn arrays_of_documents_are_converted_element_wise() {
        let items = vec![Bson::Document(doc! {"a": 1}), Bson::Array(vec![Bson::Null])];
        assert_eq!(normalize(items), json!([{"a": 1}, [null]]));
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize(doc! {"a": {"b": [{"c": true}]}, "d": "e"});
        let twice = normalize(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn scalars_pass_through_as_generic_scalars() {
        let oid = ObjectId::new();
        let at = DateTime::from_millis(1_700_000_000_000);
        let document = doc! {
            "flag": true,
            "small": 7_i32,
            "big": 9_000_000_000_i64,
            "text": "hello",
            "oid": oid,
            "at": at,
            "nothing": Bson::Null,
        };

        assert_eq!(
            normalize(document),
            json!({
                "flag": true,
                "small": 7,
                "big": 9_000_000_000_i64,
                "text": "hello",
                "oid": oid.to_hex(),
                "at": 1_700_000_000_000_i64,
                "nothing": null,
            })
        );
    }

    #[test]
    fn non_finite_doubles_become_null() {
        assert_eq!(normalize(Bson::Double(f64::NAN)), Value::Null);
        assert_eq!(normalize(Bson::Double(f64::INFINITY)), Value::Null);
    }

    #[test]
    fn encoded_values_normalize_back_to_themselves() {
        let value = json!({
            "hp": 100,
            "ratio": 0.25,
            "name": "p1",
            "items": ["sword", {"count": 2}],
            "flags": [true, false, null],
            "neg": -3,
        });

        assert_eq!(normalize(encode(&value)), value);
    }

    #[test]
    fn encode_document_rejects_non_objects() {
        let err = encode_document(&json!([1, 2])).unwrap_err();
        assert!(matches!(err, StorageError::Decode { .. }));
        assert!(err.to_string().contains("an array"));

        let document = encode_document(&json!({"a": {"b": 1}})).unwrap();
        assert_eq!(document, doc! {"a": {"b": 1_i64}});
    }
}
