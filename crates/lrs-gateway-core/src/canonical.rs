//! Deterministic JSON encoding.
//!
//! Statement content is compared by digest, so the byte encoding must not
//! depend on key insertion order or on which `serde_json` features other
//! crates in the build enable.
//!
//! ## Rules
//!
//! - Object keys are emitted in ascending byte order.
//! - No insignificant whitespace.
//! - Strings and numbers use `serde_json`'s own escaping and formatting.

use serde_json::Value;

/// Encode a JSON value deterministically.
pub fn canonical_json(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    write_value(value, &mut buf);
    buf
}

fn write_value(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

            buf.push(b'{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    buf.push(b',');
                }
                write_scalar(&Value::String(key.clone()), buf);
                buf.push(b':');
                write_value(item, buf);
            }
            buf.push(b'}');
        }
        Value::Array(items) => {
            buf.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    buf.push(b',');
                }
                write_value(item, buf);
            }
            buf.push(b']');
        }
        scalar => write_scalar(scalar, buf),
    }
}

fn write_scalar(value: &Value, buf: &mut Vec<u8>) {
    // Serializing a scalar into a Vec cannot fail.
    if serde_json::to_writer(&mut *buf, value).is_err() {
        buf.extend_from_slice(b"null");
    }
}
