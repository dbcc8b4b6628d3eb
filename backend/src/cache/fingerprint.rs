//! Cache key derivation
//!
//! A fingerprint is SHA-256 over the normalized message plus a canonical
//! rendering of the client context. Object keys are emitted in sorted order
//! at every depth, so two contexts that differ only in key order share a
//! fingerprint while two clients asking the same question never do.

use crate::chat::models::ClientContext;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Separator between content and context in the hashed material
const FIELD_SEPARATOR: u8 = 0x1f;

/// Lowercase, trim, and collapse internal whitespace
pub fn normalize_content(content: &str) -> String {
    content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Order-independent serialization of the client context
pub fn canonical_context(context: &ClientContext) -> String {
    let mut out = String::new();
    match serde_json::to_value(context) {
        Ok(value) => write_canonical(&value, &mut out),
        // ClientContext has no map keys that can fail to serialize; an
        // empty rendering still yields a deterministic key.
        Err(_) => out.push_str("null"),
    }
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Fingerprint for a (content, context) pair, hex encoded
pub fn fingerprint(content: &str, context: &ClientContext) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_content(content).as_bytes());
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(canonical_context(context).as_bytes());
    hex::encode(hasher.finalize())
}
