//! Sync scheduler.
//!
//! Wakes on a timer, on local writes and on neighbor changes. Each round:
//!
//!   1. take the locator's neighbors for unlocked vaults, minus ourselves and
//!      nodes the vault's trust graph does not know
//!   2. select those due: never synced, last synced over `interval` ago,
//!      failed last time, or whose vault has unsynced local writes
//!   3. add neighbors that are not due but share an address with a selected
//!      one, since the connection is open anyway
//!   4. connect once per address and sync its vaults one after another
//!
//! A failure only costs the current address. Nothing is retried within a
//! round; a peer that failed is due again in the next round, whatever its
//! `last_sync`.

use async_trait::async_trait;
use pvault_core::VaultResult;
use pvault_model::{ModelEvent, SharedModel, TrustGraph};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::MissedTickBehavior;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::SyncClient;
use crate::events::SyncEvent;
use crate::locator::{Locator, LocatorEvent, Neighbor};
use crate::transport;

/// Opens a client connection to an address.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str) -> VaultResult<SyncClient>;
}

/// Dials TCP and runs the TLS handshake.
pub struct TlsDialer {
    connector: TlsConnector,
    timeout: Duration,
    max_body: usize,
}

impl TlsDialer {
    pub fn new(timeout: Duration, max_body: usize) -> VaultResult<Self> {
        Ok(Self {
            connector: TlsConnector::from(transport::client_config()?),
            timeout,
            max_body,
        })
    }
}

#[async_trait]
impl Connector for TlsDialer {
    async fn connect(&self, address: &str) -> VaultResult<SyncClient> {
        let (stream, binding) = transport::connect(&self.connector, address, self.timeout).await?;
        SyncClient::handshake(stream, binding, self.max_body).await
    }
}

/// One connection of a round and the vaults synced over it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedConnection {
    pub address: String,
    pub targets: Vec<Neighbor>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub connections: usize,
    pub synced: usize,
    pub failed: usize,
    pub pulled: usize,
    pub pushed: usize,
}

impl RoundReport {
    pub fn attempted(&self) -> usize {
        self.synced + self.failed
    }
}

pub struct SyncScheduler {
    model: SharedModel,
    locator: Arc<dyn Locator>,
    connector: Arc<dyn Connector>,
    interval: Duration,
    last_sync: HashMap<Uuid, Instant>,
    /// Vaults with local writes not yet pushed
    dirty: HashSet<Uuid>,
    /// Nodes whose last attempt failed; due again next round
    retry: HashSet<Uuid>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncScheduler {
    pub fn new(
        model: SharedModel,
        locator: Arc<dyn Locator>,
        connector: Arc<dyn Connector>,
        interval: Duration,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            model,
            locator,
            connector,
            interval,
            last_sync: HashMap::new(),
            dirty: HashSet::new(),
            retry: HashSet::new(),
            events,
        }
    }

    pub fn mark_dirty(&mut self, vault: Uuid) {
        self.dirty.insert(vault);
    }

    pub fn last_sync(&self, node: &Uuid) -> Option<Instant> {
        self.last_sync.get(node).copied()
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    /// Neighbors we may sync with at all.
    async fn eligible(&self) -> Vec<Neighbor> {
        let neighbors = self.locator.get_neighbors();
        let model = self.model.lock().await;
        let mut trust: HashMap<Uuid, Option<(Uuid, TrustGraph)>> = HashMap::new();

        neighbors
            .into_iter()
            .filter(|n| !n.addresses.is_empty())
            .filter(|n| {
                let entry = trust.entry(n.vault).or_insert_with(|| {
                    match model.vault_is_locked(&n.vault) {
                        Ok(false) => Some((model.node_id(&n.vault).ok()?, model.get_trust(&n.vault).ok()?)),
                        _ => None,
                    }
                });
                match entry {
                    Some((own, graph)) => n.node != *own && graph.is_trusted(&n.node),
                    None => false,
                }
            })
            .collect()
    }

    /// Work for a round starting at `now`, grouped by address.
    pub async fn plan_round(&self, now: Instant) -> Vec<PlannedConnection> {
        let eligible = self.eligible().await;
        let due = |n: &Neighbor| {
            self.dirty.contains(&n.vault)
                || self.retry.contains(&n.node)
                || self
                    .last_sync
                    .get(&n.node)
                    .map_or(true, |last| now.saturating_duration_since(*last) >= self.interval)
        };

        let selected: HashSet<&str> = eligible
            .iter()
            .filter(|n| due(n))
            .map(|n| n.addresses[0].as_str())
            .collect();

        let mut by_address: BTreeMap<String, Vec<Neighbor>> = BTreeMap::new();
        for neighbor in &eligible {
            let address = neighbor.addresses[0].as_str();
            if selected.contains(address) {
                by_address
                    .entry(address.to_string())
                    .or_default()
                    .push(neighbor.clone());
            }
        }
        by_address
            .into_iter()
            .map(|(address, targets)| PlannedConnection { address, targets })
            .collect()
    }

    /// Plan and run one round.
    pub async fn run_round(&mut self) -> RoundReport {
        let started = Instant::now();
        let plan = self.plan_round(started).await;
        self.dirty.clear();

        let mut report = RoundReport::default();
        for connection in plan {
            self.sync_address(connection, started, &mut report).await;
        }
        if report.attempted() > 0 {
            self.emit(SyncEvent::RoundFinished {
                synced: report.synced,
                failed: report.failed,
            });
        }
        report
    }

    async fn sync_address(&mut self, connection: PlannedConnection, started: Instant, report: &mut RoundReport) {
        let PlannedConnection { address, targets } = connection;
        let mut client = match self.connector.connect(&address).await {
            Ok(client) => client,
            Err(e) => {
                warn!(addr = %address, "neighbor unreachable: {e}");
                self.abandon(&address, &targets, report);
                return;
            }
        };
        report.connections += 1;

        for (i, target) in targets.iter().enumerate() {
            match client.sync_vault(&self.model, &target.vault).await {
                Ok(result) => {
                    if result.node != target.node {
                        debug!(vault = %target.vault, expected = %target.node, node = %result.node, "answered by another node");
                    }
                    self.last_sync.insert(target.node, started);
                    self.retry.remove(&target.node);
                    report.synced += 1;
                    report.pulled += result.pulled;
                    report.pushed += result.pushed;
                    self.emit(SyncEvent::Synced {
                        vault: target.vault,
                        node: result.node,
                        pulled: result.pulled,
                        pushed: result.pushed,
                    });
                }
                Err(e) => {
                    warn!(vault = %target.vault, node = %target.node, addr = %address, "sync failed: {e}");
                    self.retry.insert(target.node);
                    report.failed += 1;
                    self.emit(SyncEvent::SyncFailed {
                        vault: target.vault,
                        address: address.clone(),
                    });
                    if client.is_closed() {
                        self.abandon(&address, &targets[i + 1..], report);
                        return;
                    }
                }
            }
        }
    }

    fn abandon(&mut self, address: &str, targets: &[Neighbor], report: &mut RoundReport) {
        for target in targets {
            self.retry.insert(target.node);
            report.failed += 1;
            self.emit(SyncEvent::SyncFailed {
                vault: target.vault,
                address: address.to_string(),
            });
        }
    }

    /// Run rounds until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> VaultResult<()> {
        let mut model_events = self.model.lock().await.subscribe();
        let mut locator_events = self.locator.subscribe();
        let mut model_open = true;
        let mut locator_open = true;

        let period = (self.interval / 4).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, "sync scheduler started");

        loop {
            let wake = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("sync scheduler: shutdown signal received");
                    return Ok(());
                }
                _ = ticker.tick() => true,
                event = model_events.recv(), if model_open => match event {
                    Ok(ModelEvent::VersionsAdded { vault, local: true }) => {
                        self.mark_dirty(vault);
                        true
                    }
                    Ok(ModelEvent::VaultUnlocked { .. } | ModelEvent::CertificateAdded { .. }) => true,
                    Ok(_) => false,
                    Err(RecvError::Lagged(missed)) => {
                        debug!(missed, "model events lagged");
                        true
                    }
                    Err(RecvError::Closed) => {
                        model_open = false;
                        false
                    }
                },
                event = locator_events.recv(), if locator_open => match event {
                    Ok(LocatorEvent::Discovered(_) | LocatorEvent::Updated(_)) => true,
                    Ok(LocatorEvent::Disappeared { node, .. }) => {
                        self.last_sync.remove(&node);
                        self.retry.remove(&node);
                        false
                    }
                    Err(RecvError::Lagged(_)) => true,
                    Err(RecvError::Closed) => {
                        locator_open = false;
                        false
                    }
                },
            };
            if !wake {
                continue;
            }

            let report = self.run_round().await;
            if report.attempted() > 0 {
                info!(
                    connections = report.connections,
                    synced = report.synced,
                    failed = report.failed,
                    pulled = report.pulled,
                    pushed = report.pushed,
                    "sync round finished"
                );
            }
        }
    }
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("interval", &self.interval)
            .field("tracked", &self.last_sync.len())
            .field("dirty", &self.dirty.len())
            .field("retry", &self.retry.len())
            .finish()
    }
}
