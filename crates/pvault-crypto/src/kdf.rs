//! Password sealing: PBKDF2-HMAC-SHA256 → AES-256-CBC, with an HMAC verifier
//!
//! The verifier lets `open_secret` tell a wrong password apart from corrupted
//! ciphertext without relying on padding errors.

use pbkdf2::pbkdf2_hmac;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::cipher::{decrypt_cbc, encrypt_cbc, SymmetricKey};
use crate::encoding::Blob;
use crate::mac::{hmac_sha256, verify_hmac_sha256};
use crate::random::random_bytes;
use crate::{CryptoError, CryptoResult, KEY_SIZE, SYMMETRIC_ALGO};

/// KDF label stored in [`EncInfo::kdf`]
pub const KDF_ALGO: &str = "PBKDF2-HMAC-SHA256";

/// Verifier label stored in [`PwCheck::algo`]
pub const PWCHECK_ALGO: &str = "HMAC-SHA256";

const SALT_SIZE: usize = 16;
const PWCHECK_RANDOM_SIZE: usize = 16;

/// PBKDF2 parameters for sealing new secrets
#[derive(Debug, Clone)]
pub struct KdfParams {
    /// PBKDF2 iteration count (default: 100000)
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self { iterations: 100_000 }
    }
}

/// How a sealed secret was encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncInfo {
    pub algo: String,
    pub iv: Blob,
    pub kdf: String,
    pub salt: Blob,
    pub count: u32,
    pub length: u32,
}

/// Password verifier: HMAC of a random challenge under the derived key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PwCheck {
    pub algo: String,
    pub random: Blob,
    pub verifier: Blob,
}

/// A secret encrypted with a password-derived key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    pub blob: Blob,
    pub encinfo: EncInfo,
    pub pwcheck: PwCheck,
}

fn derive_key(password: &SecretString, salt: &[u8], count: u32) -> SymmetricKey {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(password.expose_secret().as_bytes(), salt, count, &mut key);
    let derived = SymmetricKey::from_bytes(key);
    key.zeroize();
    derived
}

/// Seal `secret` under `password`.
pub fn seal_secret(
    password: &SecretString,
    secret: &[u8],
    params: &KdfParams,
) -> CryptoResult<SealedSecret> {
    if params.iterations == 0 {
        return Err(CryptoError::Kdf("PBKDF2 iteration count must be > 0".into()));
    }
    let salt = random_bytes(SALT_SIZE);
    let key = derive_key(password, &salt, params.iterations);

    let (iv, ciphertext) = encrypt_cbc(&key, secret)?;

    let challenge = random_bytes(PWCHECK_RANDOM_SIZE);
    let verifier = hmac_sha256(key.as_bytes(), &challenge)?;

    Ok(SealedSecret {
        blob: Blob(ciphertext),
        encinfo: EncInfo {
            algo: SYMMETRIC_ALGO.into(),
            iv: Blob(iv),
            kdf: KDF_ALGO.into(),
            salt: Blob(salt),
            count: params.iterations,
            length: KEY_SIZE as u32,
        },
        pwcheck: PwCheck {
            algo: PWCHECK_ALGO.into(),
            random: Blob(challenge),
            verifier: Blob(verifier),
        },
    })
}

/// Open a sealed secret. Fails with [`CryptoError::WrongPassword`] when the
/// verifier does not match.
pub fn open_secret(password: &SecretString, sealed: &SealedSecret) -> CryptoResult<Zeroizing<Vec<u8>>> {
    let info = &sealed.encinfo;
    if info.algo != SYMMETRIC_ALGO || info.kdf != KDF_ALGO || info.length as usize != KEY_SIZE {
        return Err(CryptoError::Kdf(format!(
            "unsupported sealing: algo={} kdf={} length={}",
            info.algo, info.kdf, info.length
        )));
    }
    if sealed.pwcheck.algo != PWCHECK_ALGO {
        return Err(CryptoError::Kdf(format!(
            "unsupported password check: {}",
            sealed.pwcheck.algo
        )));
    }

    let key = derive_key(password, info.salt.as_bytes(), info.count);
    if !verify_hmac_sha256(
        key.as_bytes(),
        sealed.pwcheck.random.as_bytes(),
        sealed.pwcheck.verifier.as_bytes(),
    ) {
        return Err(CryptoError::WrongPassword);
    }

    let plaintext = decrypt_cbc(&key, info.iv.as_bytes(), sealed.blob.as_bytes())?;
    Ok(Zeroizing::new(plaintext))
}
