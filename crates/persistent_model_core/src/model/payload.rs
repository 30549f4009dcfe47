//! Record payload codec for declared persistent values.
//!
//! Payloads are JSON objects with keys in sorted order, so encoding the same
//! value set always yields the same bytes.

use crate::model::schema::ModelSchema;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Encodes the persistent subset of `values` declared by `schema`.
///
/// Absent and `null` values are omitted.
pub fn encode_persistent_values(
    schema: &ModelSchema,
    values: &BTreeMap<String, Value>,
) -> Result<Vec<u8>, serde_json::Error> {
    let persisted: BTreeMap<&str, &Value> = schema
        .keys_for_persistent_values()
        .into_iter()
        .filter_map(|name| {
            values
                .get(name)
                .filter(|value| !value.is_null())
                .map(|value| (name, value))
        })
        .collect();
    serde_json::to_vec(&persisted)
}

/// Decodes a payload into the values declared persistent by `schema`.
///
/// An empty payload decodes to no values; undeclared entries are dropped.
pub fn decode_persistent_values(
    schema: &ModelSchema,
    data: &[u8],
) -> Result<BTreeMap<String, Value>, serde_json::Error> {
    if data.is_empty() {
        return Ok(BTreeMap::new());
    }

    let decoded: Map<String, Value> = serde_json::from_slice(data)?;
    Ok(decoded
        .into_iter()
        .filter(|(name, value)| schema.is_persistent(name) && !value.is_null())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::{decode_persistent_values, encode_persistent_values};
    use crate::model::schema::{ModelSchema, PropertyKind};
    use serde_json::{json, Value};
    use std::collections::BTreeMap;

    fn video_schema() -> ModelSchema {
        ModelSchema::builder("Video")
            .property("title", PropertyKind::Text)
            .property("likes_count", PropertyKind::Integer)
            .property("participants_keys", PropertyKind::TextList)
            .transient_property("is_playing", PropertyKind::Bool)
            .build()
            .unwrap()
    }

    fn values(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn encoding_skips_transient_and_null_values() {
        let schema = video_schema();
        let input = values(&[
            ("title", json!("Intro")),
            ("likes_count", json!(3)),
            ("participants_keys", json!(null)),
            ("is_playing", json!(true)),
        ]);

        let bytes = encode_persistent_values(&schema, &input).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"likes_count":3,"title":"Intro"}"#
        );
    }

    #[test]
    fn encoding_is_stable_for_equal_values() {
        let schema = video_schema();
        let first = values(&[("title", json!("A")), ("likes_count", json!(1))]);
        let second = values(&[("likes_count", json!(1)), ("title", json!("A"))]);

        assert_eq!(
            encode_persistent_values(&schema, &first).unwrap(),
            encode_persistent_values(&schema, &second).unwrap()
        );
    }

    #[test]
    fn decoding_drops_undeclared_entries_and_accepts_empty_payload() {
        let schema = video_schema();

        assert!(decode_persistent_values(&schema, b"").unwrap().is_empty());

        let decoded =
            decode_persistent_values(&schema, br#"{"title":"B","retired_field":1}"#).unwrap();
        assert_eq!(decoded, values(&[("title", json!("B"))]));
    }

    #[test]
    fn decoding_rejects_non_object_payload() {
        let schema = video_schema();
        assert!(decode_persistent_values(&schema, b"[1,2]").is_err());
    }
}
