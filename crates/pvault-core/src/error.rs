use pvault_crypto::CryptoError;
use thiserror::Error;

pub type VaultResult<T> = Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("vault is locked: {0}")]
    Locked(String),

    #[error("wrong password")]
    WrongPassword,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("consistency error: {0}")]
    Consistency(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("platform error: {0}")]
    Platform(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CryptoError> for VaultError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::WrongPassword => VaultError::WrongPassword,
            other => VaultError::Platform(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::InvalidArgument(format!("malformed JSON: {e}"))
    }
}
