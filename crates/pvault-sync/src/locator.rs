//! Neighbor discovery.
//!
//! A `Locator` announces the local node for each vault and reports the
//! neighbors it knows about. The scheduler only reads neighbors and listens
//! for changes; how they are found is up to the implementation.
//! `StaticLocator` serves neighbors from configuration and explicit calls.

use pvault_core::config::PeerConfig;
use pvault_core::{VaultError, VaultResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;

/// A remote node serving a vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub node: Uuid,
    pub vault: Uuid,
    pub name: String,
    /// Where the neighbor was learned from ("config", "manual", ...)
    pub source: String,
    /// `host:port` candidates, preferred first
    pub addresses: Vec<String>,
    pub properties: BTreeMap<String, String>,
}

/// The local node's announcement for one vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub node: Uuid,
    pub name: String,
    pub vault: Uuid,
    pub vault_name: String,
    pub address: String,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocatorEvent {
    Discovered(Neighbor),
    Updated(Neighbor),
    Disappeared { node: Uuid, vault: Uuid },
}

pub trait Locator: Send + Sync {
    /// Announce the local node for a vault. Re-registering replaces.
    fn register(&self, registration: Registration) -> VaultResult<()>;

    fn unregister(&self, node: &Uuid, vault: &Uuid) -> VaultResult<()>;

    /// Set a property on an existing registration.
    fn set_property(&self, node: &Uuid, vault: &Uuid, key: &str, value: &str) -> VaultResult<()>;

    /// Known remote neighbors, local registrations excluded.
    fn get_neighbors(&self) -> Vec<Neighbor>;

    fn subscribe(&self) -> broadcast::Receiver<LocatorEvent>;
}

#[derive(Default)]
struct Inner {
    registrations: HashMap<(Uuid, Uuid), Registration>,
    neighbors: HashMap<(Uuid, Uuid), Neighbor>,
}

/// Locator backed by a fixed peer list plus explicit updates.
pub struct StaticLocator {
    inner: Mutex<Inner>,
    events: broadcast::Sender<LocatorEvent>,
}

impl StaticLocator {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    pub fn from_peers(peers: &[PeerConfig]) -> Self {
        let locator = Self::new();
        for peer in peers {
            locator.add_neighbor(Neighbor {
                node: peer.node,
                vault: peer.vault,
                name: peer.name.clone(),
                source: "config".into(),
                addresses: vec![peer.address.clone()],
                properties: BTreeMap::new(),
            });
        }
        locator
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every update is a single map operation
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: LocatorEvent) {
        let _ = self.events.send(event);
    }

    /// Add a neighbor, or merge its addresses and properties into a known one.
    pub fn add_neighbor(&self, neighbor: Neighbor) {
        let key = (neighbor.node, neighbor.vault);
        let event = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            match inner.neighbors.get_mut(&key) {
                Some(known) => {
                    let before = known.clone();
                    for address in neighbor.addresses {
                        if !known.addresses.contains(&address) {
                            known.addresses.push(address);
                        }
                    }
                    known.properties.extend(neighbor.properties);
                    if !neighbor.name.is_empty() {
                        known.name = neighbor.name;
                    }
                    (*known != before).then(|| LocatorEvent::Updated(known.clone()))
                }
                None => {
                    inner.neighbors.insert(key, neighbor.clone());
                    Some(LocatorEvent::Discovered(neighbor))
                }
            }
        };
        if let Some(event) = event {
            debug!(?event, "neighbor changed");
            self.emit(event);
        }
    }

    pub fn remove_neighbor(&self, node: &Uuid, vault: &Uuid) -> bool {
        let removed = self.lock().neighbors.remove(&(*node, *vault)).is_some();
        if removed {
            self.emit(LocatorEvent::Disappeared {
                node: *node,
                vault: *vault,
            });
        }
        removed
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.lock().registrations.values().cloned().collect()
    }
}

impl Default for StaticLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Locator for StaticLocator {
    fn register(&self, registration: Registration) -> VaultResult<()> {
        debug!(vault = %registration.vault, node = %registration.node, addr = %registration.address, "registered");
        self.lock()
            .registrations
            .insert((registration.node, registration.vault), registration);
        Ok(())
    }

    fn unregister(&self, node: &Uuid, vault: &Uuid) -> VaultResult<()> {
        self.lock()
            .registrations
            .remove(&(*node, *vault))
            .map(|_| ())
            .ok_or_else(|| VaultError::NotFound(format!("registration {node} in {vault}")))
    }

    fn set_property(&self, node: &Uuid, vault: &Uuid, key: &str, value: &str) -> VaultResult<()> {
        let mut inner = self.lock();
        let registration = inner
            .registrations
            .get_mut(&(*node, *vault))
            .ok_or_else(|| VaultError::NotFound(format!("registration {node} in {vault}")))?;
        registration.properties.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_neighbors(&self) -> Vec<Neighbor> {
        let inner = self.lock();
        let mut neighbors: Vec<Neighbor> = inner
            .neighbors
            .iter()
            .filter(|(key, _)| !inner.registrations.contains_key(*key))
            .map(|(_, n)| n.clone())
            .collect();
        neighbors.sort_by_key(|n| (n.vault, n.node));
        neighbors
    }

    fn subscribe(&self) -> broadcast::Receiver<LocatorEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neighbor(node: u128, vault: u128, address: &str) -> Neighbor {
        Neighbor {
            node: Uuid::from_u128(node),
            vault: Uuid::from_u128(vault),
            name: format!("n{node}"),
            source: "manual".into(),
            addresses: vec![address.into()],
            properties: BTreeMap::new(),
        }
    }

    #[test]
    fn test_from_peers() {
        let peers = vec![PeerConfig {
            node: Uuid::from_u128(1),
            vault: Uuid::from_u128(9),
            address: "10.0.0.1:6170".into(),
            name: "desk".into(),
        }];
        let locator = StaticLocator::from_peers(&peers);
        let neighbors = locator.get_neighbors();
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].source, "config");
        assert_eq!(neighbors[0].addresses, vec!["10.0.0.1:6170".to_string()]);
    }

    #[test]
    fn test_events_on_change() {
        let locator = StaticLocator::new();
        let mut rx = locator.subscribe();

        locator.add_neighbor(neighbor(1, 9, "a:1"));
        assert!(matches!(rx.try_recv().unwrap(), LocatorEvent::Discovered(_)));

        // Same address again: no change, no event
        locator.add_neighbor(neighbor(1, 9, "a:1"));
        assert!(rx.try_recv().is_err());

        locator.add_neighbor(neighbor(1, 9, "b:2"));
        match rx.try_recv().unwrap() {
            LocatorEvent::Updated(n) => assert_eq!(n.addresses, vec!["a:1".to_string(), "b:2".to_string()]),
            other => panic!("unexpected {other:?}"),
        }

        assert!(locator.remove_neighbor(&Uuid::from_u128(1), &Uuid::from_u128(9)));
        assert!(matches!(rx.try_recv().unwrap(), LocatorEvent::Disappeared { .. }));
        assert!(!locator.remove_neighbor(&Uuid::from_u128(1), &Uuid::from_u128(9)));
    }

    #[test]
    fn test_registrations_hidden_from_neighbors() {
        let locator = StaticLocator::new();
        locator.add_neighbor(neighbor(1, 9, "a:1"));
        locator.add_neighbor(neighbor(2, 9, "b:1"));
        locator
            .register(Registration {
                node: Uuid::from_u128(1),
                name: "me".into(),
                vault: Uuid::from_u128(9),
                vault_name: "V".into(),
                address: "a:1".into(),
                properties: BTreeMap::new(),
            })
            .unwrap();

        let nodes: Vec<Uuid> = locator.get_neighbors().iter().map(|n| n.node).collect();
        assert_eq!(nodes, vec![Uuid::from_u128(2)]);

        locator
            .set_property(&Uuid::from_u128(1), &Uuid::from_u128(9), "visible", "true")
            .unwrap();
        assert_eq!(locator.registrations()[0].properties["visible"], "true");

        locator.unregister(&Uuid::from_u128(1), &Uuid::from_u128(9)).unwrap();
        assert_eq!(locator.get_neighbors().len(), 2);
        assert!(locator.unregister(&Uuid::from_u128(1), &Uuid::from_u128(9)).is_err());
        assert!(locator
            .set_property(&Uuid::from_u128(1), &Uuid::from_u128(9), "k", "v")
            .is_err());
    }
}
