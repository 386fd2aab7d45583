//! Node key material and the bounded RSA key-generation pool.

use pvault_core::types::{StoredKeyPair, StoredKeys};
use pvault_core::{VaultError, VaultResult};
use pvault_crypto::{open_secret, seal_secret, KdfParams, KeyPair};
use secrecy::SecretString;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// The three key pairs a node holds for a vault.
#[derive(Debug, Clone)]
pub struct NodeKeys {
    pub sign: KeyPair,
    pub encrypt: KeyPair,
    pub auth: KeyPair,
}

impl NodeKeys {
    /// Generate all three pairs. Blocks for a while at realistic sizes.
    pub fn generate(bits: usize) -> VaultResult<Self> {
        Ok(Self {
            sign: KeyPair::generate(bits)?,
            encrypt: KeyPair::generate(bits)?,
            auth: KeyPair::generate(bits)?,
        })
    }

    /// Seal the private halves with `password` for storage.
    pub fn seal(&self, password: &SecretString, kdf: &KdfParams) -> VaultResult<StoredKeys> {
        let seal = |pair: &KeyPair| -> VaultResult<StoredKeyPair> {
            let private = pair.to_pkcs8_der()?;
            let sealed = seal_secret(password, &private, kdf)?;
            Ok(StoredKeyPair::new(pair.public().to_der()?, sealed))
        };
        Ok(StoredKeys {
            sign: seal(&self.sign)?,
            encrypt: seal(&self.encrypt)?,
            auth: seal(&self.auth)?,
        })
    }

    /// Recover the key pairs. Fails with `WrongPassword` on a verifier mismatch.
    pub fn open(stored: &StoredKeys, password: &SecretString) -> VaultResult<Self> {
        let open = |pair: &StoredKeyPair| -> VaultResult<KeyPair> {
            let der = open_secret(password, &pair.sealed())?;
            Ok(KeyPair::from_pkcs8_der(&der)?)
        };
        Ok(Self {
            sign: open(&stored.sign)?,
            encrypt: open(&stored.encrypt)?,
            auth: open(&stored.auth)?,
        })
    }
}

/// Runs RSA key generation on the blocking pool, at most `workers` at a time,
/// so protocol I/O keeps flowing while keys are being made.
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    permits: Arc<Semaphore>,
    bits: usize,
}

impl KeyGenerator {
    pub fn new(workers: usize, bits: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            bits,
        }
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    pub async fn node_keys(&self) -> VaultResult<NodeKeys> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| VaultError::Platform(format!("key generator closed: {e}")))?;

        let bits = self.bits;
        let started = std::time::Instant::now();
        let keys = tokio::task::spawn_blocking(move || NodeKeys::generate(bits))
            .await
            .map_err(|e| VaultError::Platform(format!("key generation task failed: {e}")))??;
        tracing::debug!(bits, elapsed_ms = started.elapsed().as_millis() as u64, "generated node keys");
        Ok(keys)
    }
}
