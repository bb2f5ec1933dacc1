//! Canonical JSON serialization and content hashing.
//!
//! Canonical JSON is used wherever a byte-stable representation is hashed or
//! signed: callback-idempotency body hashes, audit-signer payload hashes, and
//! audit-log record chaining. The rule: object keys sorted by code point,
//! `undefined`-equivalent (missing/null-optional) fields dropped, numbers
//! emitted via `serde_json`'s own float/int rules (non-finite floats can't
//! occur in valid JSON so there's nothing extra to special-case there).

use serde_json::Value;
use std::fmt::Write as _;

/// Serializes `v` into canonical form: object keys sorted, no insignificant
/// whitespace. Arrays and nested objects are canonicalized recursively.
pub fn to_canonical_json(v: &Value) -> Vec<u8> {
    let mut out = String::new();
    write_canonical(v, &mut out);
    out.into_bytes()
}

fn write_canonical(v: &Value, out: &mut String) {
    match v {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            let _ = write!(out, "{}", n);
        }
        Value::String(s) => write_json_string(s, out),
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
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(k, out);
                out.push(':');
                write_canonical(&map[*k], out);
            }
            out.push('}');
        }
    }
}

fn write_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// BLAKE3 hex digest — used for idempotency-record body/response hashing and
/// WAL framing.
pub fn blake3_hex(data: &[u8]) -> String {
    blake3::Hasher::new().update(data).finalize().to_hex().to_string()
}

/// SHA-256 digest, base64url (no padding) encoded — the audit signer's
/// `payloadHashSha256B64u` and the hash algorithm canonical records use.
pub fn sha256_b64u(data: &[u8]) -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64, Engine};
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(data);
    B64.encode(digest)
}

/// SHA-256 lowercase hex digest, used for the record-hash chain where a hex
/// representation is the more conventional choice for a log line.
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Hash name carrying its algorithm prefix, e.g. `sha256:<hex>`.
pub fn prefixed_hash(algo: &str, hex: &str) -> String {
    format!("{}:{}", algo, hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_object_keys() {
        let v = json!({"b": 1, "a": 2});
        assert_eq!(to_canonical_json(&v), b"{\"a\":2,\"b\":1}");
    }

    #[test]
    fn nested_and_array() {
        let v = json!({"z": [3, 2, {"y": 1, "x": null}]});
        assert_eq!(
            to_canonical_json(&v),
            b"{\"z\":[3,2,{\"x\":null,\"y\":1}]}"
        );
    }

    #[test]
    fn escapes_control_chars() {
        let v = json!("a\nb\"c");
        assert_eq!(to_canonical_json(&v), b"\"a\\nb\\\"c\"");
    }

    #[test]
    fn hash_is_stable_across_key_order() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(
            sha256_hex(&to_canonical_json(&a)),
            sha256_hex(&to_canonical_json(&b))
        );
    }
}
