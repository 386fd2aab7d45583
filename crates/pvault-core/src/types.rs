use pvault_crypto::{Blob, EncInfo, PwCheck, SealedSecret};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Key type label for RSA public keys in certificates
pub const KEYTYPE_RSA: &str = "rsa";

/// Version field names owned by the engine; applications cannot set them.
pub const RESERVED_VERSION_FIELDS: &[&str] = &["id", "version", "parent", "created_at", "deleted"];

// ── Vaults ────────────────────────────────────────────────────────────────────

/// A key pair as stored at rest: public half in clear, private half sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKeyPair {
    pub keytype: String,
    pub public: Blob,
    pub private: Blob,
    pub encinfo: EncInfo,
    pub pwcheck: PwCheck,
}

impl StoredKeyPair {
    pub fn new(public_der: Vec<u8>, sealed: SealedSecret) -> Self {
        Self {
            keytype: KEYTYPE_RSA.into(),
            public: Blob(public_der),
            private: sealed.blob,
            encinfo: sealed.encinfo,
            pwcheck: sealed.pwcheck,
        }
    }

    pub fn sealed(&self) -> SealedSecret {
        SealedSecret {
            blob: self.private.clone(),
            encinfo: self.encinfo.clone(),
            pwcheck: self.pwcheck.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKeys {
    pub sign: StoredKeyPair,
    pub encrypt: StoredKeyPair,
    pub auth: StoredKeyPair,
}

/// Persisted vault document (table `vaults`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultRecord {
    /// Shared across all replicas of the vault
    pub id: Uuid,
    pub name: String,
    /// This replica's own node id
    pub node: Uuid,
    pub keys: StoredKeys,
    pub created_at: u64,
}

/// Public view of a vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultInfo {
    pub id: Uuid,
    pub name: String,
    pub node: Uuid,
    pub locked: bool,
}

// ── Items ─────────────────────────────────────────────────────────────────────

/// Logical clock position of an item: `seqnr` is assigned by `node` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin {
    pub node: Uuid,
    pub seqnr: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSignature {
    pub algo: String,
    pub blob: Blob,
}

/// The signed unit of storage and sync. Immutable once signed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    pub vault: Uuid,
    pub origin: Origin,
    pub payload: ItemPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<ItemSignature>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type")]
pub enum ItemPayload {
    Certificate(Certificate),
    EncryptedItem(EncryptedPayload),
}

impl ItemPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            ItemPayload::Certificate(_) => "Certificate",
            ItemPayload::EncryptedItem(_) => "EncryptedItem",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertPublicKey {
    pub keytype: String,
    pub key: Blob,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertKeys {
    pub sign: CertPublicKey,
    pub encrypt: CertPublicKey,
    pub auth: CertPublicKey,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restrictions {
    /// Node may sync but is neither an encryption recipient nor a voucher
    #[serde(default)]
    pub synconly: bool,
}

/// Announces a node's public keys. Also the certinfo exchanged by pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    /// Subject node
    pub node: Uuid,
    pub name: String,
    pub keys: CertKeys,
    #[serde(default)]
    pub restrictions: Restrictions,
}

impl Certificate {
    pub fn synconly(&self) -> bool {
        self.restrictions.synconly
    }
}

/// AES ciphertext of a [`Version`] plus the symmetric key wrapped per recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub algo: String,
    pub iv: Blob,
    pub blob: Blob,
    pub keyalgo: String,
    pub keys: BTreeMap<Uuid, Blob>,
}

// ── Versions ──────────────────────────────────────────────────────────────────

/// Decrypted record content.
///
/// `id` is the logical record id, stable across edits. `version` identifies
/// this particular edit; `parent` points at the `version` it was derived from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub id: Uuid,
    pub version: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Uuid>,
    pub created_at: u64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Version {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Current unix time in seconds.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
