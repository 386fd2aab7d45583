//! Secure randomness: raw bytes, UUIDs and numeric PINs

use rand::{Rng, RngCore};

/// Fill a fresh buffer with `len` bytes from the thread-local CSPRNG.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// Random (v4) UUID.
pub fn random_uuid() -> uuid::Uuid {
    uuid::Uuid::new_v4()
}

/// Zero-padded numeric PIN with `digits` digits (e.g. "004217").
pub fn random_pin(digits: u32) -> String {
    let modulus = 10u64.pow(digits);
    let value = rand::thread_rng().gen_range(0..modulus);
    format!("{:0width$}", value, width = digits as usize)
}
