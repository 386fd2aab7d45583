//! pvault-crypto: cryptographic primitives for the vault replication core
//!
//! Every vault replica (node) owns three RSA key pairs:
//! ```text
//! sign     RSA-PSS-SHA256 signatures over items
//! encrypt  RSA-OAEP-SHA256 wrapping of per-item symmetric keys
//! auth     RSA-PSS-SHA256 signatures over TLS channel bindings
//! ```
//!
//! Private keys are sealed at rest with a password:
//! ```text
//! password ── PBKDF2-HMAC-SHA256(salt, count) ──> 256-bit sealing key
//!   ├── AES-256-CBC-PKCS7(iv) over the PKCS#8 private key
//!   └── HMAC-SHA256(random) verifier, checked before decrypting
//! ```

pub mod cipher;
pub mod encoding;
pub mod kdf;
pub mod keys;
pub mod mac;
pub mod random;

pub use cipher::{decrypt_cbc, encrypt_cbc, SymmetricKey};
pub use encoding::Blob;
pub use kdf::{open_secret, seal_secret, EncInfo, KdfParams, PwCheck, SealedSecret};
pub use keys::{KeyPair, PublicKey};
pub use mac::{hmac_sha256, verify_hmac_sha256};
pub use random::{random_bytes, random_pin, random_uuid};

use thiserror::Error;

/// Size of an AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of an AES-CBC initialization vector
pub const IV_SIZE: usize = 16;

/// Symmetric algorithm label stored next to ciphertexts
pub const SYMMETRIC_ALGO: &str = "AES-CBC-PKCS7";

/// Key-wrapping algorithm label
pub const WRAP_ALGO: &str = "RSA-OAEP-SHA256";

/// Signature algorithm label
pub const SIGN_ALGO: &str = "RSA-PSS-SHA256";

/// Errors raised by the crypto port
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("wrong password")]
    WrongPassword,

    #[error("key error: {0}")]
    Key(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("signature error: {0}")]
    Signature(String),

    #[error("key derivation failed: {0}")]
    Kdf(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
