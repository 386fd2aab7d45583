//! Canonical item encoding for signatures.
//!
//! An item is signed over its JSON form with the `signature` member removed,
//! object keys sorted, and no insignificant whitespace. Every replica must
//! produce the same bytes for the same item, independent of map ordering.

use pvault_core::types::{Item, ItemSignature};
use pvault_core::VaultResult;
use pvault_crypto::{Blob, KeyPair, PublicKey, SIGN_ALGO};
use serde_json::Value;

/// Serialize `value` with sorted keys and compact separators.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(values) => {
            out.push('[');
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(v, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        other => out.push_str(&other.to_string()),
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push_str(&Value::String(s.to_owned()).to_string());
}

/// Bytes covered by an item's signature.
pub fn signing_bytes(item: &Item) -> VaultResult<Vec<u8>> {
    let mut value = serde_json::to_value(item)?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("signature");
    }
    Ok(canonical_json(&value).into_bytes())
}

/// Sign `item` in place with a node's sign key.
pub fn sign_item(item: &mut Item, key: &KeyPair) -> VaultResult<()> {
    item.signature = None;
    let bytes = signing_bytes(item)?;
    item.signature = Some(ItemSignature {
        algo: SIGN_ALGO.into(),
        blob: Blob::new(key.sign(&bytes)),
    });
    Ok(())
}

/// Check an item's signature against a sign key. Unsigned items never verify.
pub fn verify_item(item: &Item, key: &PublicKey) -> bool {
    let Some(signature) = &item.signature else {
        return false;
    };
    if signature.algo != SIGN_ALGO {
        return false;
    }
    match signing_bytes(item) {
        Ok(bytes) => key.verify(&bytes, signature.blob.as_bytes()),
        Err(_) => false,
    }
}
