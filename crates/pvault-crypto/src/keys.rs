//! RSA key pairs: generation, DER encoding, OAEP key wrapping, PSS signatures

use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::pss::{BlindedSigningKey, Signature, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{CryptoError, CryptoResult};

/// Smallest modulus accepted for new keys.
pub const MIN_RSA_BITS: usize = 1024;

/// An RSA public key (SubjectPublicKeyInfo DER on the wire).
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    inner: RsaPublicKey,
}

impl PublicKey {
    pub fn from_der(der: &[u8]) -> CryptoResult<Self> {
        RsaPublicKey::from_public_key_der(der)
            .map(|inner| Self { inner })
            .map_err(|e| CryptoError::Key(format!("invalid RSA public key: {e}")))
    }

    pub fn to_der(&self) -> CryptoResult<Vec<u8>> {
        self.inner
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| CryptoError::Key(format!("encoding RSA public key: {e}")))
    }

    /// RSA-OAEP-SHA256 encryption, used to wrap symmetric keys.
    pub fn wrap(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        self.inner
            .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), data)
            .map_err(|e| CryptoError::Encrypt(format!("RSA-OAEP: {e}")))
    }

    /// RSA-PSS-SHA256 verification. Malformed signatures simply fail.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::try_from(signature) else {
            return false;
        };
        VerifyingKey::<Sha256>::new(self.inner.clone())
            .verify(message, &signature)
            .is_ok()
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use rsa::traits::PublicKeyParts;
        f.debug_struct("PublicKey")
            .field("bits", &(self.inner.size() * 8))
            .finish()
    }
}

/// An RSA key pair. The private half never leaves memory unsealed.
#[derive(Clone)]
pub struct KeyPair {
    private: RsaPrivateKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh key pair. CPU heavy: run off the async scheduler.
    pub fn generate(bits: usize) -> CryptoResult<Self> {
        if bits < MIN_RSA_BITS {
            return Err(CryptoError::Key(format!(
                "RSA modulus too small: {bits} bits (minimum {MIN_RSA_BITS})"
            )));
        }
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| CryptoError::Key(format!("RSA keygen: {e}")))?;
        Ok(Self::from_private(private))
    }

    fn from_private(private: RsaPrivateKey) -> Self {
        let public = PublicKey {
            inner: RsaPublicKey::from(&private),
        };
        Self { private, public }
    }

    /// Load from a PKCS#8 DER private key.
    pub fn from_pkcs8_der(der: &[u8]) -> CryptoResult<Self> {
        RsaPrivateKey::from_pkcs8_der(der)
            .map(Self::from_private)
            .map_err(|e| CryptoError::Key(format!("invalid RSA private key: {e}")))
    }

    /// PKCS#8 DER encoding of the private key, zeroized on drop.
    pub fn to_pkcs8_der(&self) -> CryptoResult<Zeroizing<Vec<u8>>> {
        self.private
            .to_pkcs8_der()
            .map(|doc| Zeroizing::new(doc.as_bytes().to_vec()))
            .map_err(|e| CryptoError::Key(format!("encoding RSA private key: {e}")))
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Unwrap a symmetric key produced by [`PublicKey::wrap`].
    pub fn unwrap_key(&self, wrapped: &[u8]) -> CryptoResult<Zeroizing<Vec<u8>>> {
        self.private
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map(Zeroizing::new)
            .map_err(|e| CryptoError::Decrypt(format!("RSA-OAEP: {e}")))
    }

    /// RSA-PSS-SHA256 signature (randomized salt).
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        BlindedSigningKey::<Sha256>::new(self.private.clone())
            .sign_with_rng(&mut rand::thread_rng(), message)
            .to_vec()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("private", &"[REDACTED]")
            .finish()
    }
}
