//! Bound-parameter representation and the vector wire forms of §6.

use rusqlite::types::{Null, ToSql, ToSqlOutput, ValueRef};

/// A single bindable value. Integer-valued numbers bind as integers, non-integer
/// numbers bind as floats, strings as text, byte arrays as blobs. Float32 arrays
/// enter the blob arm via [`vector_to_blob`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Null,
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    /// Classifies a JSON number as integer or float the way the source's
    /// `is_integer` check does, and otherwise maps JSON types structurally.
    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Integer(i64::from(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else {
                    Value::Real(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Text(s.clone()),
            other => Value::Text(other.to_string()),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Integer(i) => ToSqlOutput::from(*i),
            Value::Real(f) => ToSqlOutput::from(*f),
            Value::Text(s) => ToSqlOutput::from(s.as_str()),
            Value::Blob(b) => ToSqlOutput::from(b.as_slice()),
            Value::Null => ToSqlOutput::from(Null),
        })
    }
}

/// Converts a materialized row cell back into a JSON value for the result
/// envelope. Blobs are base64-encoded since JSON has no native byte-string type.
pub fn value_ref_to_json(value: ValueRef<'_>) -> serde_json::Value {
    use base64::Engine;

    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => {
            serde_json::Value::String(String::from_utf8_lossy(t).into_owned())
        }
        ValueRef::Blob(b) => {
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
    }
}

/// Insert-side vector wire form: the little-endian float32 byte image of the array.
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for component in vector {
        bytes.extend_from_slice(&component.to_le_bytes());
    }
    bytes
}

/// Query-side vector wire form: a JSON array of finite numbers, bound as text.
pub fn vector_to_query_text(vector: &[f32]) -> String {
    serde_json::to_string(vector).expect("a slice of f32 always serializes to JSON")
}

/// Reverses [`vector_to_blob`]; used when re-reading a stored embedding.
pub fn blob_to_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_round_trips_through_blob() {
        let vector = vec![1.0_f32, -2.5, 0.0, 384.0];
        let blob = vector_to_blob(&vector);
        assert_eq!(blob.len(), vector.len() * 4);
        assert_eq!(blob_to_vector(&blob).unwrap(), vector);
    }

    #[test]
    fn query_text_is_finite_json_array() {
        let vector = vec![0.1_f32, 0.2, 0.3];
        let text = vector_to_query_text(&vector);
        let parsed: Vec<f32> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, vector);
    }

    #[test]
    fn json_number_classification_matches_is_integer() {
        assert_eq!(Value::from_json(&serde_json::json!(3)), Value::Integer(3));
        assert_eq!(Value::from_json(&serde_json::json!(3.5)), Value::Real(3.5));
        assert_eq!(
            Value::from_json(&serde_json::json!("hi")),
            Value::Text("hi".into())
        );
        assert_eq!(Value::from_json(&serde_json::Value::Null), Value::Null);
    }
}
