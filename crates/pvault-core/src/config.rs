use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{VaultError, VaultResult};

/// Top-level daemon configuration (loaded from pvault.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PvaultConfig {
    pub daemon: DaemonConfig,
    pub store: StoreConfig,
    pub sync: SyncConfig,
    pub crypto: CryptoConfig,
    /// Statically known neighbors, fed to the static locator
    pub peers: Vec<PeerConfig>,
}

impl PvaultConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> VaultResult<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| {
            VaultError::InvalidArgument(format!("parsing config {}: {e}", path.display()))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// TLS listen address for pairing and sync (default: 0.0.0.0:6170)
    pub listen: String,
    /// Prometheus metrics endpoint (default: 127.0.0.1:9170)
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
    /// Display name announced in this node's certificates
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON document store file
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between sync rounds with the same neighbor
    pub interval_secs: u64,
    pub connect_timeout_secs: u64,
    /// Lifetime of an outstanding pairing transaction
    pub pairing_timeout_secs: u64,
    /// How long the responder waits for a human to approve a pairing
    pub approval_timeout_secs: u64,
    /// Request/response body cap
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// RSA modulus size for new key pairs (default: 2048)
    pub rsa_bits: usize,
    /// PBKDF2 iteration count for sealing private keys (default: 100000)
    pub pbkdf2_iterations: u32,
    /// Concurrent RSA key generations (default: 2)
    pub keygen_workers: usize,
}

/// A neighbor entry: where a vault replica can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node: Uuid,
    pub vault: Uuid,
    pub address: String,
    #[serde(default)]
    pub name: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:6170".into(),
            metrics_addr: Some("127.0.0.1:9170".into()),
            log_level: "info".into(),
            log_format: "json".into(),
            name: "pvault".into(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("~/.local/share/pvault/store.json"),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            connect_timeout_secs: 10,
            pairing_timeout_secs: 60,
            approval_timeout_secs: 60,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            rsa_bits: 2048,
            pbkdf2_iterations: 100_000,
            keygen_workers: 2,
        }
    }
}
