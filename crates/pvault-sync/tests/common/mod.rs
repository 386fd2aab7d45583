//! Shared fixtures: in-memory models and in-memory connections.

#![allow(dead_code)]

use async_trait::async_trait;
use pvault_core::{JsonStore, VaultError, VaultResult};
use pvault_crypto::KdfParams;
use pvault_model::{Model, ModelSettings, SharedModel};
use pvault_sync::pairing::{Approver, PairingRequest, PinPrompt};
use pvault_sync::scheduler::Connector;
use pvault_sync::server::serve_connection;
use pvault_sync::{ChannelBinding, PairingResponder, ServerContext, SyncClient, SyncEvent};
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

pub const MAX_BODY: usize = 4 * 1024 * 1024;

/// The binding both ends of an in-memory connection agree on.
pub const BINDING: ChannelBinding = ChannelBinding([7u8; 32]);

pub fn pw(s: &str) -> SecretString {
    SecretString::from(s)
}

pub fn model(name: &str) -> Model {
    let settings = ModelSettings {
        name: name.into(),
        rsa_bits: 1024,
        kdf: KdfParams { iterations: 1000 },
    };
    Model::open(Box::new(JsonStore::in_memory()), settings).unwrap()
}

/// Certify each other directly, without the pairing protocol.
pub async fn exchange_certificates(a: &SharedModel, b: &SharedModel, vault: &Uuid) {
    let cert_a = a.lock().await.get_certinfo(vault).unwrap();
    let cert_b = b.lock().await.get_certinfo(vault).unwrap();
    a.lock().await.add_certificate(vault, cert_b).unwrap();
    b.lock().await.add_certificate(vault, cert_a).unwrap();
}

/// Approves every request and publishes the PIN it was shown.
#[derive(Clone, Default)]
pub struct PinBoard(pub Arc<Mutex<Option<String>>>);

impl PinBoard {
    pub fn pin(&self) -> Option<String> {
        self.0.lock().unwrap().clone()
    }
}

#[async_trait]
impl Approver for PinBoard {
    async fn approve(&self, _request: &PairingRequest, pin: &str) -> bool {
        *self.0.lock().unwrap() = Some(pin.to_string());
        true
    }
}

/// Reads the PIN off a `PinBoard`, optionally shifted to simulate a typo.
pub struct BoardPrompt {
    pub board: PinBoard,
    pub shift: i64,
}

#[async_trait]
impl PinPrompt for BoardPrompt {
    async fn read_pin(&self, _vault: &Uuid, _kxid: &str) -> VaultResult<String> {
        let pin = self
            .board
            .pin()
            .ok_or_else(|| VaultError::InvalidArgument("no PIN shown".into()))?;
        pvault_sync::wire::adjust_pin(&pin, self.shift)
    }
}

pub struct Server {
    pub ctx: Arc<ServerContext>,
    pub board: PinBoard,
    pub events: broadcast::Receiver<SyncEvent>,
}

pub fn server(model: SharedModel) -> Server {
    server_with_limit(model, MAX_BODY)
}

pub fn server_with_limit(model: SharedModel, max_body: usize) -> Server {
    let board = PinBoard::default();
    let pairing = PairingResponder::new(
        model.clone(),
        Box::new(board.clone()),
        Duration::from_secs(60),
        Duration::from_secs(5),
    );
    let (events, rx) = broadcast::channel(64);
    Server {
        ctx: Arc::new(ServerContext {
            model,
            pairing: Arc::new(pairing),
            max_body,
            events,
        }),
        board,
        events: rx,
    }
}

/// A client connected to `ctx` over an in-memory pipe.
pub async fn connect_with(ctx: Arc<ServerContext>, server_binding: ChannelBinding, client_binding: ChannelBinding) -> SyncClient {
    open(ctx, server_binding, client_binding, MAX_BODY).await
}

/// A client that accepts response bodies of at most `max_body` bytes.
pub async fn connect_limited(ctx: Arc<ServerContext>, max_body: usize) -> SyncClient {
    open(ctx, BINDING, BINDING, max_body).await
}

async fn open(
    ctx: Arc<ServerContext>,
    server_binding: ChannelBinding,
    client_binding: ChannelBinding,
    max_body: usize,
) -> SyncClient {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    tokio::spawn(async move {
        let _ = serve_connection(server_io, server_binding, ctx).await;
    });
    SyncClient::handshake(client_io, client_binding, max_body).await.unwrap()
}

pub async fn connect(ctx: Arc<ServerContext>) -> SyncClient {
    connect_with(ctx, BINDING, BINDING).await
}

/// Connector over in-memory pipes; unknown addresses are unreachable.
#[derive(Default)]
pub struct MemoryConnector {
    pub servers: HashMap<String, Arc<ServerContext>>,
    pub dials: AtomicUsize,
    /// Dials still to refuse before connecting again
    pub refusals: AtomicUsize,
}

impl MemoryConnector {
    pub fn with(mut self, address: &str, ctx: Arc<ServerContext>) -> Self {
        self.servers.insert(address.to_string(), ctx);
        self
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Refuse the next `n` dials, whatever the address.
    pub fn refuse_next(&self, n: usize) {
        self.refusals.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, address: &str) -> VaultResult<SyncClient> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(VaultError::Remote(format!("connect {address}: reset")));
        }
        let ctx = self
            .servers
            .get(address)
            .cloned()
            .ok_or_else(|| VaultError::Remote(format!("connect {address}: refused")))?;
        Ok(connect(ctx).await)
    }
}
