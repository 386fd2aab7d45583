//! Wire format shared by client and server.
//!
//! Requests are plain HTTP/1.1 over the TLS connection. Authentication rides
//! in `Authorization` (client → server) and `Authentication-Info` /
//! `WWW-Authenticate` (server → client) using two schemes:
//!
//! ```text
//! HMAC_CB name=<initiator name>                     pairing request
//! HMAC_CB kxid=<id>                                 pairing challenge (401)
//! HMAC_CB kxid=<id>, signature=<b64 hmac>           pairing proof
//! RSA_CB node=<uuid>, signature=<b64 rsa-pss>       sync authentication
//! ```
//!
//! Bodies are JSON: item arrays for sync, certificate payloads for pairing.

use axum::http::{HeaderMap, StatusCode};
use pvault_core::types::Item;
use pvault_core::{VaultError, VaultResult};
use pvault_crypto::{hmac_sha256, verify_hmac_sha256, Blob};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const SCHEME_HMAC_CB: &str = "HMAC_CB";
pub const SCHEME_RSA_CB: &str = "RSA_CB";

pub const AUTHENTICATION_INFO: &str = "authentication-info";
pub const X_VECTOR: &str = "x-vector";
/// Set on a pull response that was cut short; pull again from the new cursor
pub const X_MORE: &str = "x-more";
/// Largest body the sender accepts, advertised on pulls in both directions
pub const X_MAX_BODY: &str = "x-max-body";

/// Digits in a pairing PIN
pub const PIN_DIGITS: usize = 6;

/// Host header sent on every request; the TLS layer carries no name.
pub const HOST: &str = "pvault";

pub fn pair_path(vault: &Uuid) -> String {
    format!("/api/vaults/{vault}/pair")
}

pub fn items_path(vault: &Uuid) -> String {
    format!("/api/vaults/{vault}/items")
}

/// An authentication header value: a scheme and `key=value` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeader {
    pub scheme: String,
    pub params: BTreeMap<String, String>,
}

impl AuthHeader {
    pub fn new(scheme: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            params: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> VaultResult<&str> {
        self.get(key).ok_or_else(|| {
            VaultError::InvalidArgument(format!("{} header lacks {key}", self.scheme))
        })
    }

    pub fn is(&self, scheme: &str) -> bool {
        self.scheme.eq_ignore_ascii_case(scheme)
    }

    /// `RSA_CB node=.., signature=..`
    pub fn rsa_cb(node: &Uuid, signature: &[u8]) -> Self {
        Self::new(SCHEME_RSA_CB)
            .with("node", node.to_string())
            .with("signature", Blob::new(signature).to_base64())
    }

    /// Decode the `node` and `signature` of an `RSA_CB` header.
    pub fn rsa_cb_parts(&self) -> VaultResult<(Uuid, Vec<u8>)> {
        if !self.is(SCHEME_RSA_CB) {
            return Err(VaultError::InvalidArgument(format!(
                "expected {SCHEME_RSA_CB}, got {}",
                self.scheme
            )));
        }
        let node = Uuid::parse_str(self.require("node")?)
            .map_err(|e| VaultError::InvalidArgument(format!("bad node: {e}")))?;
        Ok((node, self.signature()?))
    }

    /// Decoded base64 `signature` parameter.
    pub fn signature(&self) -> VaultResult<Vec<u8>> {
        Blob::from_base64(self.require("signature")?)
            .map(Blob::into_inner)
            .ok_or_else(|| VaultError::InvalidArgument("signature is not base64".into()))
    }
}

impl fmt::Display for AuthHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.scheme)?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{sep}{key}=")?;
            if needs_quotes(value) {
                f.write_str("\"")?;
                for c in value.chars() {
                    if c == '"' || c == '\\' {
                        f.write_str("\\")?;
                    }
                    write!(f, "{c}")?;
                }
                f.write_str("\"")?;
            } else {
                f.write_str(value)?;
            }
        }
        Ok(())
    }
}

fn needs_quotes(value: &str) -> bool {
    value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ',' | '"' | '\\'))
}

fn bad_param(detail: &str) -> VaultError {
    VaultError::InvalidArgument(format!("bad authentication parameter: {detail}"))
}

/// `key=token` or `key="quoted string"` pairs separated by commas. Quoted
/// values may contain commas and `\`-escaped characters.
fn parse_params(rest: &str) -> VaultResult<BTreeMap<String, String>> {
    let mut params = BTreeMap::new();
    let mut chars = rest.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace() || *c == ',').is_some() {}
        if chars.peek().is_none() {
            return Ok(params);
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && *c != ',') {
            key.push(c);
        }
        let key = key.trim();
        if chars.next() != Some('=') || key.is_empty() {
            return Err(bad_param(key));
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if_eq(&'"').is_some() {
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some(escaped) => value.push(escaped),
                        None => break,
                    },
                    '"' => {
                        closed = true;
                        break;
                    }
                    c => value.push(c),
                }
            }
            if !closed {
                return Err(bad_param(&format!("{key}: unterminated quoted string")));
            }
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            if chars.peek().is_some_and(|c| *c != ',') {
                return Err(bad_param(&format!("{key}: text after quoted string")));
            }
        } else {
            while let Some(c) = chars.next_if(|c| *c != ',') {
                value.push(c);
            }
            value = value.trim().to_string();
        }
        params.insert(key.to_ascii_lowercase(), value);
    }
}

impl FromStr for AuthHeader {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (scheme, rest) = s.split_once(' ').unwrap_or((s, ""));
        if scheme.is_empty() {
            return Err(VaultError::InvalidArgument("empty authentication header".into()));
        }
        Ok(AuthHeader {
            scheme: scheme.to_string(),
            params: parse_params(rest)?,
        })
    }
}

// ── PIN proofs ────────────────────────────────────────────────────────────────

/// `(pin + delta) mod 10^digits`, zero padded to the PIN's width.
pub fn adjust_pin(pin: &str, delta: i64) -> VaultResult<String> {
    let digits = pin.len();
    if digits == 0 || digits > 18 || !pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(VaultError::InvalidArgument("PIN must be decimal digits".into()));
    }
    let modulus = 10i64.pow(digits as u32);
    let value: i64 = pin
        .parse()
        .map_err(|e| VaultError::InvalidArgument(format!("bad PIN: {e}")))?;
    let adjusted = (value + delta).rem_euclid(modulus);
    Ok(format!("{adjusted:0digits$}"))
}

/// HMAC-SHA256 over the channel binding, keyed by the adjusted PIN.
pub fn pin_proof(pin: &str, delta: i64, binding: &[u8]) -> VaultResult<Vec<u8>> {
    let key = adjust_pin(pin, delta)?;
    Ok(hmac_sha256(key.as_bytes(), binding)?)
}

pub fn verify_pin_proof(pin: &str, delta: i64, binding: &[u8], proof: &[u8]) -> bool {
    match adjust_pin(pin, delta) {
        Ok(key) => verify_hmac_sha256(key.as_bytes(), binding, proof),
        Err(_) => false,
    }
}

// ── Bodies ────────────────────────────────────────────────────────────────────

/// Decode an item array, dropping entries that do not parse.
pub fn parse_items(body: &[u8]) -> VaultResult<Vec<Item>> {
    let values: Vec<Value> = serde_json::from_slice(body)?;
    let total = values.len();
    let items: Vec<Item> = values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<Item>(value) {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::warn!("dropping malformed item: {e}");
                None
            }
        })
        .collect();
    if items.len() < total {
        tracing::debug!(total, kept = items.len(), "item batch had malformed entries");
    }
    Ok(items)
}

/// How many leading `items` fit in a JSON array of at most `budget` bytes.
/// Never less than one, so an oversized item still moves (and fails loudly
/// at the receiver) instead of stalling the sync.
pub fn page_len(items: &[Item], budget: usize) -> VaultResult<usize> {
    let mut used = 2;
    for (i, item) in items.iter().enumerate() {
        let len = serde_json::to_vec(item)?.len() + usize::from(i > 0);
        if i > 0 && used + len > budget {
            return Ok(i);
        }
        used += len;
    }
    Ok(items.len())
}

/// The peer's `X-Max-Body`, if it sent a usable one.
pub fn advertised_limit(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(X_MAX_BODY)?
        .to_str()
        .ok()?
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|limit| *limit > 0)
}

/// Response body of a push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSummary {
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

/// JSON error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

// ── Status mapping ────────────────────────────────────────────────────────────

/// HTTP status for a model error.
pub fn status_for(err: &VaultError) -> StatusCode {
    match err {
        VaultError::NotFound(_) => StatusCode::NOT_FOUND,
        VaultError::Exists(_) => StatusCode::CONFLICT,
        VaultError::Locked(_) => StatusCode::LOCKED,
        VaultError::WrongPassword => StatusCode::FORBIDDEN,
        VaultError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        VaultError::Consistency(_) => StatusCode::CONFLICT,
        VaultError::Remote(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Client-side view of an error response.
pub fn error_for(status: StatusCode, body: &[u8]) -> VaultError {
    let detail = serde_json::from_slice::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
    match status {
        StatusCode::NOT_FOUND => VaultError::NotFound(format!("remote: {detail}")),
        StatusCode::LOCKED => VaultError::Locked(format!("remote: {detail}")),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            VaultError::Remote(format!("authentication failed ({status}): {detail}"))
        }
        _ => VaultError::Remote(format!("{status}: {detail}")),
    }
}


#[cfg(test)]
mod proptest_suite {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn pin_plus_minus_cancel(pin in "[0-9]{6}", delta in -3i64..=3) {
            let there = adjust_pin(&pin, delta).unwrap();
            prop_assert_eq!(there.len(), PIN_DIGITS);
            prop_assert_eq!(adjust_pin(&there, -delta).unwrap(), pin);
        }

        #[test]
        fn header_roundtrip(name in "[ -~]{0,24}", kxid in "[0-9a-f-]{1,36}") {
            let h = AuthHeader::new(SCHEME_HMAC_CB).with("name", name).with("kxid", kxid);
            prop_assert_eq!(h.to_string().parse::<AuthHeader>().unwrap(), h);
        }
    }
}
