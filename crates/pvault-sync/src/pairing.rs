//! PIN pairing between two nodes that do not trust each other yet.
//!
//! ```text
//! initiator                                   responder
//!   POST pair  Authorization: HMAC_CB name=n   ──>
//!                                              new kxid + PIN, human approves
//!   <── 401  WWW-Authenticate: HMAC_CB kxid=k
//!   human types the PIN
//!   POST pair  Authorization: HMAC_CB kxid=k, signature=HMAC(PIN+1, cb)
//!              body: initiator certinfo        ──>
//!                                              check proof, add certificate
//!   <── 200  Authentication-Info: HMAC_CB kxid=k, signature=HMAC(PIN-1, cb)
//!            body: responder certinfo
//!   check proof, add certificate
//! ```
//!
//! `cb` is the TLS channel binding, so a proof is only valid on the connection
//! it was made for. A kxid is single use and expires; a failed confirm
//! consumes it.

use async_trait::async_trait;
use pvault_core::types::Certificate;
use pvault_core::{VaultError, VaultResult};
use pvault_crypto::{random_pin, random_uuid, Blob};
use pvault_model::SharedModel;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::transport::ChannelBinding;
use crate::wire::{pin_proof, verify_pin_proof, AuthHeader, PIN_DIGITS, SCHEME_HMAC_CB};

/// Responder-side pairing failures. All of them surface as `403` except
/// model errors, which map through the usual status table.
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("pairing refused: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Vault(#[from] VaultError),
}

/// A pending pairing as presented to a human.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRequest {
    pub vault: Uuid,
    /// Name the initiator announced
    pub name: String,
    pub kxid: String,
}

/// Responder side: show the PIN to a human and let them decide.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn approve(&self, request: &PairingRequest, pin: &str) -> bool;
}

/// Initiator side: obtain the PIN displayed on the responder.
#[async_trait]
pub trait PinPrompt: Send + Sync {
    async fn read_pin(&self, vault: &Uuid, kxid: &str) -> VaultResult<String>;
}

/// Approves everything. For tests and unattended setups.
#[derive(Debug, Default)]
pub struct AutoApprove;

#[async_trait]
impl Approver for AutoApprove {
    async fn approve(&self, request: &PairingRequest, _pin: &str) -> bool {
        info!(vault = %request.vault, name = %request.name, "pairing auto-approved");
        true
    }
}

/// A PIN known in advance.
#[derive(Debug, Clone)]
pub struct FixedPin(pub String);

#[async_trait]
impl PinPrompt for FixedPin {
    async fn read_pin(&self, _vault: &Uuid, _kxid: &str) -> VaultResult<String> {
        Ok(self.0.clone())
    }
}

/// What the responder answers to a well-formed pairing request.
#[derive(Debug, Clone)]
pub enum PairingOutcome {
    /// First leg done; the initiator must come back with a proof
    Challenge(AuthHeader),
    Completed(PairingReply),
}

/// Successful confirm: proof for the initiator plus our own certificate.
#[derive(Debug, Clone)]
pub struct PairingReply {
    pub authentication_info: AuthHeader,
    pub certinfo: Certificate,
    /// Node that was just certified
    pub peer: Uuid,
}

struct Transaction {
    vault: Uuid,
    name: String,
    pin: String,
    created: Instant,
}

/// Server half of pairing, shared by every connection of a daemon.
pub struct PairingResponder {
    model: SharedModel,
    approver: Box<dyn Approver>,
    transactions: Mutex<HashMap<String, Transaction>>,
    ttl: Duration,
    approval_timeout: Duration,
}

impl PairingResponder {
    pub fn new(
        model: SharedModel,
        approver: Box<dyn Approver>,
        ttl: Duration,
        approval_timeout: Duration,
    ) -> Self {
        Self {
            model,
            approver,
            transactions: Mutex::new(HashMap::new()),
            ttl,
            approval_timeout,
        }
    }

    /// Number of outstanding transactions.
    pub async fn pending(&self) -> usize {
        self.transactions.lock().await.len()
    }

    async fn purge_expired(&self) {
        let mut transactions = self.transactions.lock().await;
        let before = transactions.len();
        let ttl = self.ttl;
        transactions.retain(|_, tx| tx.created.elapsed() < ttl);
        let purged = before - transactions.len();
        if purged > 0 {
            info!(purged, "expired pairing transactions purged");
        }
    }

    /// Handle one pairing request on `vault`.
    pub async fn handle(
        &self,
        vault: &Uuid,
        binding: &ChannelBinding,
        authorization: Option<&AuthHeader>,
        body: &[u8],
    ) -> Result<PairingOutcome, PairingError> {
        self.purge_expired().await;

        let auth = authorization
            .filter(|a| a.is(SCHEME_HMAC_CB))
            .ok_or_else(|| PairingError::Forbidden(format!("{SCHEME_HMAC_CB} authorization required")))?;

        match (auth.get("kxid"), auth.get("name")) {
            (Some(kxid), _) => self
                .confirm(vault, binding, kxid, auth, body)
                .await
                .map(PairingOutcome::Completed),
            (None, Some(name)) => self.challenge(vault, name).await.map(PairingOutcome::Challenge),
            (None, None) => Err(PairingError::Forbidden("neither kxid nor name given".into())),
        }
    }

    async fn challenge(&self, vault: &Uuid, name: &str) -> Result<AuthHeader, PairingError> {
        if self.model.lock().await.vault_is_locked(vault)? {
            return Err(VaultError::Locked(vault.to_string()).into());
        }

        let kxid = random_uuid().to_string();
        let pin = random_pin(PIN_DIGITS as u32);
        let request = PairingRequest {
            vault: *vault,
            name: name.to_string(),
            kxid: kxid.clone(),
        };

        let approved = tokio::time::timeout(self.approval_timeout, self.approver.approve(&request, &pin))
            .await
            .unwrap_or(false);
        if !approved {
            warn!(vault = %vault, name, "pairing request not approved");
            return Err(PairingError::Forbidden("pairing not approved".into()));
        }

        self.transactions.lock().await.insert(
            kxid.clone(),
            Transaction {
                vault: *vault,
                name: name.to_string(),
                pin,
                created: Instant::now(),
            },
        );
        info!(vault = %vault, name, kxid = %kxid, "pairing challenge issued");
        Ok(AuthHeader::new(SCHEME_HMAC_CB).with("kxid", kxid))
    }

    async fn confirm(
        &self,
        vault: &Uuid,
        binding: &ChannelBinding,
        kxid: &str,
        auth: &AuthHeader,
        body: &[u8],
    ) -> Result<PairingReply, PairingError> {
        let tx = self
            .transactions
            .lock()
            .await
            .remove(kxid)
            .ok_or_else(|| PairingError::Forbidden("unknown or expired kxid".into()))?;
        if tx.vault != *vault {
            return Err(PairingError::Forbidden("kxid belongs to another vault".into()));
        }

        let proof = auth
            .signature()
            .map_err(|e| PairingError::Forbidden(e.to_string()))?;
        if !verify_pin_proof(&tx.pin, 1, binding.as_bytes(), &proof) {
            warn!(vault = %vault, kxid, name = %tx.name, "pairing proof mismatch");
            return Err(PairingError::Forbidden("PIN proof mismatch".into()));
        }

        let peer: Certificate = serde_json::from_slice(body).map_err(VaultError::from)?;
        let peer_node = peer.node;
        let certinfo = {
            let mut model = self.model.lock().await;
            model.add_certificate(vault, peer)?;
            model.get_certinfo(vault)?
        };

        let answer = pin_proof(&tx.pin, -1, binding.as_bytes())?;
        info!(vault = %vault, node = %peer_node, name = %tx.name, "pairing completed");
        Ok(PairingReply {
            authentication_info: AuthHeader::new(SCHEME_HMAC_CB)
                .with("kxid", kxid)
                .with("signature", Blob::new(answer).to_base64()),
            certinfo,
            peer: peer_node,
        })
    }
}

impl std::fmt::Debug for PairingResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingResponder")
            .field("ttl", &self.ttl)
            .field("approval_timeout", &self.approval_timeout)
            .finish()
    }
}
