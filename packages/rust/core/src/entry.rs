//! Entry serialization.
//!
//! An entry payload is `<path>|<json>`. The JSON object holds the user
//! properties of the record in key order; system fields (leading `_`) are left
//! out and blob references are resolved to blob ids.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use treedump_shared::{Result, TreeDumpError};

/// Key of a blob reference object: `{"$blob": "<reference>"}`.
pub const BLOB_REFERENCE_KEY: &str = "$blob";
/// Prefix of a resolved blob value.
pub const BLOB_ID_PREFIX: &str = ":blobId:";

/// Dereferences external binary values referenced by an entry.
pub trait BlobResolver: Send + Sync {
    /// The blob id for `reference`.
    fn resolve(&self, reference: &str) -> Result<String>;
}

/// Uses the reference itself as the blob id.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughBlobResolver;

impl BlobResolver for PassthroughBlobResolver {
    fn resolve(&self, reference: &str) -> Result<String> {
        Ok(reference.to_string())
    }
}

/// Turns record fields into entry payloads.
#[derive(Clone)]
pub struct EntryWriter {
    blobs: Arc<dyn BlobResolver>,
}

impl EntryWriter {
    pub fn new(blobs: Arc<dyn BlobResolver>) -> Self {
        Self { blobs }
    }

    /// The JSON part of an entry.
    pub fn to_json(&self, fields: &BTreeMap<String, Value>) -> Result<String> {
        let mut properties = BTreeMap::new();
        for (name, value) in fields {
            if name.starts_with('_') {
                continue;
            }
            properties.insert(name.as_str(), self.resolve_value(value)?);
        }
        Ok(serde_json::to_string(&properties)?)
    }

    /// The complete payload for the entry at `path`.
    pub fn serialize(&self, path: &str, fields: &BTreeMap<String, Value>) -> Result<Vec<u8>> {
        if path.contains('|') {
            return Err(TreeDumpError::validation(format!(
                "path '{path}' contains the entry delimiter '|'"
            )));
        }
        let json = self.to_json(fields)?;
        let mut payload = Vec::with_capacity(path.len() + 1 + json.len());
        payload.extend_from_slice(path.as_bytes());
        payload.push(b'|');
        payload.extend_from_slice(json.as_bytes());
        Ok(payload)
    }

    fn resolve_value(&self, value: &Value) -> Result<Value> {
        match value {
            Value::Object(map) if map.len() == 1 => match map.get(BLOB_REFERENCE_KEY) {
                Some(Value::String(reference)) => {
                    let id = self.blobs.resolve(reference)?;
                    Ok(Value::String(format!("{BLOB_ID_PREFIX}{id}")))
                }
                _ => Ok(value.clone()),
            },
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_value(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            _ => Ok(value.clone()),
        }
    }
}

impl Default for EntryWriter {
    fn default() -> Self {
        Self::new(Arc::new(PassthroughBlobResolver))
    }
}

/// Split a payload into its path and JSON parts.
pub fn decode_entry(payload: &[u8]) -> Result<(&str, &[u8])> {
    let split = payload
        .iter()
        .position(|b| *b == b'|')
        .ok_or_else(|| TreeDumpError::validation("entry payload has no path delimiter"))?;
    let path = std::str::from_utf8(&payload[..split])
        .map_err(|e| TreeDumpError::validation(format!("entry path is not UTF-8: {e}")))?;
    Ok((path, &payload[split + 1..]))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn fields(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    struct PrefixResolver;

    impl BlobResolver for PrefixResolver {
        fn resolve(&self, reference: &str) -> Result<String> {
            if reference.is_empty() {
                return Err(TreeDumpError::validation("empty blob reference"));
            }
            Ok(format!("b-{reference}"))
        }
    }

    #[test]
    fn skips_system_fields_and_orders_keys() {
        let writer = EntryWriter::default();
        let json = writer
            .to_json(&fields(json!({"title": "t", "_modified": 3, "a": [1, 2]})))
            .unwrap();
        assert_eq!(json, r#"{"a":[1,2],"title":"t"}"#);
    }

    #[test]
    fn resolves_blob_references() {
        let writer = EntryWriter::new(Arc::new(PrefixResolver));
        let json = writer
            .to_json(&fields(json!({
                "data": {"$blob": "r1"},
                "many": [{"$blob": "r2"}, "plain"],
                "other": {"$blob": "r3", "extra": true}
            })))
            .unwrap();
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["data"], json!(":blobId:b-r1"));
        assert_eq!(parsed["many"], json!([":blobId:b-r2", "plain"]));
        assert_eq!(parsed["other"], json!({"$blob": "r3", "extra": true}));
    }

    #[test]
    fn resolver_errors_propagate() {
        let writer = EntryWriter::new(Arc::new(PrefixResolver));
        assert!(writer.to_json(&fields(json!({"data": {"$blob": ""}}))).is_err());
    }

    #[test]
    fn payload_splits_back_into_path_and_json() {
        let writer = EntryWriter::default();
        let payload = writer.serialize("/content/a", &fields(json!({"x": "a|b"}))).unwrap();
        let (path, json) = decode_entry(&payload).unwrap();
        assert_eq!(path, "/content/a");
        assert_eq!(json, br#"{"x":"a|b"}"#);
    }

    #[test]
    fn delimiter_in_path_is_rejected() {
        let writer = EntryWriter::default();
        assert!(writer.serialize("/a|b", &BTreeMap::new()).is_err());
        assert!(decode_entry(b"no-delimiter").is_err());
    }
}
