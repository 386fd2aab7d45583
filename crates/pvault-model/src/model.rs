//! The vault engine.
//!
//! `Model` owns every vault in one document store: the sealed key material,
//! the signed items, the trust graph computed from certificate items, and,
//! while a vault is unlocked, its private keys and decrypted versions.
//!
//! Items are append-only. Each local item takes the next sequence number of
//! this node within the vault, is signed with the node's sign key and then
//! persisted. Imported items are checked against the trust graph before they
//! are stored. Locking a vault drops its private keys and every decrypted
//! version; stored items and the trust graph remain.

use pvault_core::config::PvaultConfig;
use pvault_core::store::{DocStore, Query, Sort};
use pvault_core::types::{
    now_secs, CertKeys, CertPublicKey, Certificate, EncryptedPayload, Item, ItemPayload, Origin,
    Restrictions, StoredKeyPair, VaultInfo, VaultRecord, Version, KEYTYPE_RSA,
    RESERVED_VERSION_FIELDS,
};
use pvault_core::{VaultError, VaultResult, Vector};
use pvault_crypto::{
    decrypt_cbc, encrypt_cbc, random_uuid, Blob, KdfParams, PublicKey, SymmetricKey,
    SYMMETRIC_ALGO, WRAP_ALGO,
};
use secrecy::SecretString;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::canonical::{sign_item, verify_item};
use crate::events::ModelEvent;
use crate::history::{conflicts, sort_history};
use crate::keygen::NodeKeys;
use crate::trust::TrustGraph;

pub const VAULTS_TABLE: &str = "vaults";
pub const ITEMS_TABLE: &str = "items";

const EVENT_CAPACITY: usize = 256;

/// A model shared between the sync server, the scheduler and local callers.
/// Never hold the lock across network I/O.
pub type SharedModel = Arc<tokio::sync::Mutex<Model>>;

#[derive(Debug, Clone)]
pub struct ModelSettings {
    /// Display name put in this node's certificates
    pub name: String,
    pub rsa_bits: usize,
    pub kdf: KdfParams,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            name: "pvault".into(),
            rsa_bits: 2048,
            kdf: KdfParams::default(),
        }
    }
}

impl ModelSettings {
    pub fn from_config(config: &PvaultConfig) -> Self {
        Self {
            name: config.daemon.name.clone(),
            rsa_bits: config.crypto.rsa_bits,
            kdf: KdfParams {
                iterations: config.crypto.pbkdf2_iterations,
            },
        }
    }
}

/// Outcome of an import batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub accepted: usize,
    /// Already stored, ignored
    pub duplicates: usize,
    /// Failed verification or did not belong to the vault
    pub rejected: usize,
}

struct VaultState {
    record: VaultRecord,
    /// Present only while unlocked
    keys: Option<NodeKeys>,
    trust: TrustGraph,
    vector: Vector,
    /// logical id → every decrypted instance
    instances: HashMap<Uuid, Vec<Version>>,
    /// logical id → current head followed by its ancestors
    histories: HashMap<Uuid, Vec<Version>>,
}

impl VaultState {
    fn node(&self) -> Uuid {
        self.record.node
    }

    fn unlocked_keys(&self) -> VaultResult<&NodeKeys> {
        self.keys
            .as_ref()
            .ok_or_else(|| VaultError::Locked(self.record.id.to_string()))
    }

    fn ensure_unlocked(&self) -> VaultResult<()> {
        self.unlocked_keys().map(|_| ())
    }

    fn cache_version(&mut self, version: Version) {
        let id = version.id;
        let instances = self.instances.entry(id).or_default();
        if instances.iter().any(|v| v.version == version.version) {
            return;
        }
        instances.push(version);
        let history = sort_history(instances);
        self.histories.insert(id, history);
    }

    fn current(&self, id: &Uuid) -> Option<&Version> {
        self.histories.get(id).and_then(|h| h.first())
    }

    fn info(&self) -> VaultInfo {
        VaultInfo {
            id: self.record.id,
            name: self.record.name.clone(),
            node: self.record.node,
            locked: self.keys.is_none(),
        }
    }
}

fn vault_entry<'a>(
    vaults: &'a mut HashMap<Uuid, VaultState>,
    vault: &Uuid,
) -> VaultResult<&'a mut VaultState> {
    vaults
        .get_mut(vault)
        .ok_or_else(|| VaultError::NotFound(format!("vault {vault}")))
}

pub struct Model {
    store: Box<dyn DocStore>,
    settings: ModelSettings,
    vaults: HashMap<Uuid, VaultState>,
    events: broadcast::Sender<ModelEvent>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("settings", &self.settings)
            .field("vaults", &self.vaults.len())
            .finish()
    }
}

impl Model {
    /// Load every vault in `store`. All vaults start locked.
    pub fn open(mut store: Box<dyn DocStore>, settings: ModelSettings) -> VaultResult<Self> {
        store.create_index(VAULTS_TABLE, "id")?;
        store.create_index(ITEMS_TABLE, "vault")?;
        store.create_index(ITEMS_TABLE, "origin.node")?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut model = Self {
            store,
            settings,
            vaults: HashMap::new(),
            events,
        };

        for doc in model.store.find_all(VAULTS_TABLE, &Query::all(), None)? {
            let record: VaultRecord = serde_json::from_value(doc)?;
            model.load_vault(record)?;
        }
        info!(vaults = model.vaults.len(), "model opened");
        Ok(model)
    }

    pub fn into_shared(self) -> SharedModel {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ModelEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    pub fn flush(&mut self) -> VaultResult<()> {
        self.store.flush()
    }

    fn load_vault(&mut self, record: VaultRecord) -> VaultResult<()> {
        let items = self.load_items(&record.id)?;
        let mut vector = Vector::new();
        for item in &items {
            vector.observe(item.origin.node, item.origin.seqnr);
        }
        let trust = TrustGraph::build(record.node, &items);
        debug!(vault = %record.id, items = items.len(), trusted = trust.nodes().count(), "vault loaded");
        self.vaults.insert(
            record.id,
            VaultState {
                record,
                keys: None,
                trust,
                vector,
                instances: HashMap::new(),
                histories: HashMap::new(),
            },
        );
        Ok(())
    }

    fn load_items(&self, vault: &Uuid) -> VaultResult<Vec<Item>> {
        self.query_items(Query::all().eq("vault", vault))
    }

    fn query_items(&self, query: Query) -> VaultResult<Vec<Item>> {
        self.store
            .find_all(ITEMS_TABLE, &query, Some(&Sort::asc("origin.seqnr")))?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(VaultError::from))
            .collect()
    }

    fn state(&self, vault: &Uuid) -> VaultResult<&VaultState> {
        self.vaults
            .get(vault)
            .ok_or_else(|| VaultError::NotFound(format!("vault {vault}")))
    }

    // ── Vault lifecycle ───────────────────────────────────────────────────────

    /// Create a vault with freshly generated keys. Key generation is CPU heavy;
    /// async callers should generate through `KeyGenerator` and use
    /// [`Model::create_vault_with_keys`].
    pub fn create_vault(&mut self, name: &str, password: &SecretString) -> VaultResult<Uuid> {
        let keys = NodeKeys::generate(self.settings.rsa_bits)?;
        self.create_vault_with_keys(name, password, keys)
    }

    pub fn create_vault_with_keys(
        &mut self,
        name: &str,
        password: &SecretString,
        keys: NodeKeys,
    ) -> VaultResult<Uuid> {
        self.insert_vault(random_uuid(), name, password, keys)
    }

    /// Create a local replica of an existing vault, to be paired afterwards.
    pub fn join_vault(&mut self, vault: Uuid, name: &str, password: &SecretString) -> VaultResult<Uuid> {
        let keys = NodeKeys::generate(self.settings.rsa_bits)?;
        self.join_vault_with_keys(vault, name, password, keys)
    }

    pub fn join_vault_with_keys(
        &mut self,
        vault: Uuid,
        name: &str,
        password: &SecretString,
        keys: NodeKeys,
    ) -> VaultResult<Uuid> {
        self.insert_vault(vault, name, password, keys)
    }

    fn insert_vault(
        &mut self,
        id: Uuid,
        name: &str,
        password: &SecretString,
        keys: NodeKeys,
    ) -> VaultResult<Uuid> {
        if name.trim().is_empty() {
            return Err(VaultError::InvalidArgument("vault name must not be empty".into()));
        }
        if self.vaults.contains_key(&id) {
            return Err(VaultError::Exists(format!("vault {id}")));
        }

        let record = VaultRecord {
            id,
            name: name.to_string(),
            node: random_uuid(),
            keys: keys.seal(password, &self.settings.kdf)?,
            created_at: now_secs(),
        };
        self.store.insert(VAULTS_TABLE, serde_json::to_value(&record)?)?;

        let node = record.node;
        self.vaults.insert(
            id,
            VaultState {
                record,
                keys: Some(keys),
                trust: TrustGraph::default(),
                vector: Vector::new(),
                instances: HashMap::new(),
                histories: HashMap::new(),
            },
        );

        let certinfo = self.get_certinfo(&id)?;
        self.emit_item(&id, ItemPayload::Certificate(certinfo))?;
        self.recompute_trust(&id)?;
        self.store.flush()?;

        info!(vault = %id, node = %node, name, "vault created");
        self.emit(ModelEvent::VaultCreated { vault: id });
        Ok(id)
    }

    pub fn unlock_vault(&mut self, vault: &Uuid, password: &SecretString) -> VaultResult<()> {
        let keys = NodeKeys::open(&self.state(vault)?.record.keys, password)?;
        let items = self.load_items(vault)?;

        let state = vault_entry(&mut self.vaults, vault)?;
        let node = state.node();
        let mut readable = 0usize;
        for item in &items {
            let ItemPayload::EncryptedItem(payload) = &item.payload else {
                continue;
            };
            match decrypt_payload(payload, &node, &keys) {
                Ok(Some(version)) => {
                    state.cache_version(version);
                    readable += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(vault = %vault, node = %item.origin.node, seqnr = item.origin.seqnr, "undecryptable item: {e}")
                }
            }
        }
        state.keys = Some(keys);

        info!(vault = %vault, readable, "vault unlocked");
        self.emit(ModelEvent::VaultUnlocked { vault: *vault });
        Ok(())
    }

    pub fn lock_vault(&mut self, vault: &Uuid) -> VaultResult<()> {
        let state = vault_entry(&mut self.vaults, vault)?;
        state.keys = None;
        state.instances.clear();
        state.histories.clear();
        info!(vault = %vault, "vault locked");
        self.emit(ModelEvent::VaultLocked { vault: *vault });
        Ok(())
    }

    pub fn vault_is_locked(&self, vault: &Uuid) -> VaultResult<bool> {
        Ok(self.state(vault)?.keys.is_none())
    }

    pub fn get_vault(&self, vault: &Uuid) -> VaultResult<VaultInfo> {
        Ok(self.state(vault)?.info())
    }

    pub fn get_vaults(&self) -> Vec<VaultInfo> {
        let mut vaults: Vec<VaultInfo> = self.vaults.values().map(VaultState::info).collect();
        vaults.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        vaults
    }

    /// Rename a vault locally. The name is not replicated.
    pub fn update_vault(&mut self, vault: &Uuid, name: &str) -> VaultResult<VaultInfo> {
        if name.trim().is_empty() {
            return Err(VaultError::InvalidArgument("vault name must not be empty".into()));
        }
        let state = vault_entry(&mut self.vaults, vault)?;
        state.record.name = name.to_string();
        let doc = serde_json::to_value(&state.record)?;
        let info = state.info();
        self.store
            .update(VAULTS_TABLE, &Query::all().eq("id", vault), doc)?;
        self.store.flush()?;
        Ok(info)
    }

    /// Remove the vault and every item stored for it.
    pub fn delete_vault(&mut self, vault: &Uuid) -> VaultResult<()> {
        if self.vaults.remove(vault).is_none() {
            return Err(VaultError::NotFound(format!("vault {vault}")));
        }
        self.store.delete(VAULTS_TABLE, &Query::all().eq("id", vault))?;
        let items = self.store.delete(ITEMS_TABLE, &Query::all().eq("vault", vault))?;
        self.store.flush()?;
        info!(vault = %vault, items, "vault deleted");
        self.emit(ModelEvent::VaultDeleted { vault: *vault });
        Ok(())
    }

    // ── Items ─────────────────────────────────────────────────────────────────

    /// Sign and persist a new local item.
    fn emit_item(&mut self, vault: &Uuid, payload: ItemPayload) -> VaultResult<Item> {
        let state = vault_entry(&mut self.vaults, vault)?;
        let keys = state.unlocked_keys()?;
        let node = state.node();
        let seqnr = state.vector.get(&node) + 1;

        let mut item = Item {
            id: random_uuid(),
            vault: *vault,
            origin: Origin { node, seqnr },
            payload,
            signature: None,
        };
        sign_item(&mut item, &keys.sign)?;

        self.store.insert(ITEMS_TABLE, serde_json::to_value(&item)?)?;
        state.vector.observe(node, seqnr);
        debug!(vault = %vault, seqnr, kind = item.payload.type_name(), "local item stored");
        Ok(item)
    }

    fn recompute_trust(&mut self, vault: &Uuid) -> VaultResult<()> {
        let certs = self.query_items(
            Query::all()
                .eq("vault", vault)
                .eq("payload._type", "Certificate"),
        )?;
        let state = vault_entry(&mut self.vaults, vault)?;
        state.trust = TrustGraph::build(state.node(), &certs);
        Ok(())
    }

    fn is_known(&self, item: &Item) -> VaultResult<bool> {
        let query = Query::all()
            .eq("vault", item.vault)
            .eq("origin.node", item.origin.node)
            .eq("origin.seqnr", item.origin.seqnr);
        Ok(self.store.find_one(ITEMS_TABLE, &query)?.is_some())
    }

    /// Whether `item` carries a valid signature from a node trusted to sign.
    fn verify(&self, state: &VaultState, item: &Item) -> bool {
        let signer = item.origin.node;
        match state.trust.best(&signer) {
            None => {
                debug!(vault = %item.vault, node = %signer, "item from untrusted node");
                false
            }
            Some(cert) if cert.synconly() => {
                warn!(vault = %item.vault, node = %signer, "item signed by synconly node rejected");
                false
            }
            Some(_) => match state.trust.verify_key(&signer) {
                Some(key) => verify_item(item, &key),
                None => false,
            },
        }
    }

    fn store_imported(&mut self, vault: &Uuid, item: &Item) -> VaultResult<()> {
        self.store.insert(ITEMS_TABLE, serde_json::to_value(item)?)?;
        vault_entry(&mut self.vaults, vault)?
            .vector
            .observe(item.origin.node, item.origin.seqnr);
        Ok(())
    }

    pub fn import_item(&mut self, vault: &Uuid, item: Item) -> VaultResult<ImportReport> {
        self.import_items(vault, vec![item])
    }

    /// Verify and store items received from a peer.
    ///
    /// Known items are skipped, so importing is idempotent. Items that fail
    /// verification are dropped one by one; the rest of the batch proceeds.
    /// Certificates go first and are retried until no more become verifiable,
    /// so a batch may carry a signer's certificate after the items it vouches
    /// for. Encrypted items without a key for this node are stored but stay
    /// unreadable.
    pub fn import_items(&mut self, vault: &Uuid, items: Vec<Item>) -> VaultResult<ImportReport> {
        self.state(vault)?;
        let mut report = ImportReport::default();
        let mut certs = Vec::new();
        let mut encrypted = Vec::new();

        for item in items {
            if item.vault != *vault {
                warn!(vault = %vault, other = %item.vault, "item for another vault rejected");
                report.rejected += 1;
                continue;
            }
            match item.payload {
                ItemPayload::Certificate(_) => certs.push(item),
                ItemPayload::EncryptedItem(_) => encrypted.push(item),
            }
        }

        let mut new_certs = Vec::new();
        let mut pending = certs;
        loop {
            let mut progress = false;
            let mut deferred = Vec::new();
            for item in pending {
                if self.is_known(&item)? {
                    report.duplicates += 1;
                    continue;
                }
                if !self.verify(self.state(vault)?, &item) {
                    deferred.push(item);
                    continue;
                }
                self.store_imported(vault, &item)?;
                self.recompute_trust(vault)?;
                if let ItemPayload::Certificate(cert) = &item.payload {
                    new_certs.push(cert.node);
                }
                report.accepted += 1;
                progress = true;
            }
            pending = deferred;
            if !progress || pending.is_empty() {
                break;
            }
        }
        for item in &pending {
            warn!(vault = %vault, node = %item.origin.node, seqnr = item.origin.seqnr, "certificate failed verification");
            report.rejected += 1;
        }

        encrypted.sort_by_key(|item| (item.origin.node, item.origin.seqnr));
        let mut versions_added = false;
        for item in encrypted {
            if self.is_known(&item)? {
                report.duplicates += 1;
                continue;
            }
            if !self.verify(self.state(vault)?, &item) {
                warn!(vault = %vault, node = %item.origin.node, seqnr = item.origin.seqnr, "item failed verification");
                report.rejected += 1;
                continue;
            }
            self.store_imported(vault, &item)?;
            report.accepted += 1;

            let state = vault_entry(&mut self.vaults, vault)?;
            let node = state.node();
            let (Some(keys), ItemPayload::EncryptedItem(payload)) = (&state.keys, &item.payload) else {
                continue;
            };
            match decrypt_payload(payload, &node, keys) {
                Ok(Some(version)) => {
                    state.cache_version(version);
                    versions_added = true;
                }
                Ok(None) => {
                    debug!(vault = %vault, node = %item.origin.node, seqnr = item.origin.seqnr, "item not encrypted to this node")
                }
                Err(e) => {
                    warn!(vault = %vault, node = %item.origin.node, seqnr = item.origin.seqnr, "undecryptable item: {e}")
                }
            }
        }

        if report.accepted > 0 {
            self.store.flush()?;
        }
        info!(
            vault = %vault,
            accepted = report.accepted,
            duplicates = report.duplicates,
            rejected = report.rejected,
            "items imported"
        );
        for node in new_certs {
            self.emit(ModelEvent::CertificateAdded { vault: *vault, node });
        }
        if versions_added {
            self.emit(ModelEvent::VersionsAdded {
                vault: *vault,
                local: false,
            });
        }
        Ok(report)
    }

    /// Every stored item newer than `vector`, in sequence order.
    pub fn get_items(&self, vault: &Uuid, vector: &Vector) -> VaultResult<Vec<Item>> {
        self.state(vault)?;
        Ok(self
            .load_items(vault)?
            .into_iter()
            .filter(|item| vector.is_newer(&item.origin.node, item.origin.seqnr))
            .collect())
    }

    pub fn get_vector(&self, vault: &Uuid) -> VaultResult<Vector> {
        Ok(self.state(vault)?.vector.clone())
    }

    // ── Versions ──────────────────────────────────────────────────────────────

    /// Encrypt, sign and store one version instance without flushing.
    fn commit_version(&mut self, vault: &Uuid, version: Version) -> VaultResult<()> {
        let state = self.state(vault)?;
        state.ensure_unlocked()?;
        let payload = encrypt_version(&state.trust, state.node(), &version)?;
        self.emit_item(vault, ItemPayload::EncryptedItem(payload))?;
        vault_entry(&mut self.vaults, vault)?.cache_version(version);
        Ok(())
    }

    /// Store an explicitly built version instance.
    ///
    /// `add_version`, `update_version` and `delete_version` build on this; it is
    /// also how an instance with a caller-chosen parent and timestamp is stored.
    pub fn save_version(&mut self, vault: &Uuid, version: Version) -> VaultResult<Version> {
        check_fields(&version.fields)?;
        self.commit_version(vault, version.clone())?;
        self.store.flush()?;
        self.emit(ModelEvent::VersionsAdded {
            vault: *vault,
            local: true,
        });
        Ok(version)
    }

    pub fn add_version(&mut self, vault: &Uuid, fields: Map<String, Value>) -> VaultResult<Version> {
        let version = Version {
            id: random_uuid(),
            version: random_uuid(),
            parent: None,
            created_at: now_secs(),
            deleted: false,
            fields,
        };
        self.save_version(vault, version)
    }

    /// New instance of record `id` derived from its current head.
    pub fn update_version(
        &mut self,
        vault: &Uuid,
        id: &Uuid,
        fields: Map<String, Value>,
    ) -> VaultResult<Version> {
        let current = self.get_version(vault, id)?;
        let version = Version {
            id: current.id,
            version: random_uuid(),
            parent: Some(current.version),
            created_at: now_secs(),
            deleted: false,
            fields,
        };
        self.save_version(vault, version)
    }

    /// Tombstone record `id`. Its history stays available.
    pub fn delete_version(&mut self, vault: &Uuid, id: &Uuid) -> VaultResult<Version> {
        let current = self.get_version(vault, id)?;
        let version = Version {
            id: current.id,
            version: random_uuid(),
            parent: Some(current.version),
            created_at: now_secs(),
            deleted: true,
            fields: Map::new(),
        };
        self.save_version(vault, version)
    }

    /// Current head of record `id`. Deleted records are not found.
    pub fn get_version(&self, vault: &Uuid, id: &Uuid) -> VaultResult<Version> {
        let state = self.state(vault)?;
        state.ensure_unlocked()?;
        match state.current(id) {
            Some(version) if !version.deleted => Ok(version.clone()),
            _ => Err(VaultError::NotFound(format!("version {id}"))),
        }
    }

    /// Current heads of every live record.
    pub fn get_versions(&self, vault: &Uuid) -> VaultResult<Vec<Version>> {
        let state = self.state(vault)?;
        state.ensure_unlocked()?;
        let mut versions: Vec<Version> = state
            .histories
            .values()
            .filter_map(|h| h.first())
            .filter(|v| !v.deleted)
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.id);
        Ok(versions)
    }

    /// Head of record `id` followed by its ancestors.
    pub fn get_version_history(&self, vault: &Uuid, id: &Uuid) -> VaultResult<Vec<Version>> {
        let state = self.state(vault)?;
        state.ensure_unlocked()?;
        match state.histories.get(id) {
            Some(history) if !history.is_empty() => Ok(history.clone()),
            _ => Err(VaultError::NotFound(format!("version {id}"))),
        }
    }

    /// Concurrent heads of record `id` that lost to the current one, newest first.
    pub fn get_conflicts(&self, vault: &Uuid, id: &Uuid) -> VaultResult<Vec<Version>> {
        let state = self.state(vault)?;
        state.ensure_unlocked()?;
        match state.instances.get(id) {
            Some(instances) => Ok(conflicts(instances)),
            None => Err(VaultError::NotFound(format!("version {id}"))),
        }
    }

    // ── Trust ─────────────────────────────────────────────────────────────────

    pub fn node_id(&self, vault: &Uuid) -> VaultResult<Uuid> {
        Ok(self.state(vault)?.node())
    }

    /// This node's certificate payload for `vault`, as sent during pairing.
    pub fn get_certinfo(&self, vault: &Uuid) -> VaultResult<Certificate> {
        let state = self.state(vault)?;
        let public = |pair: &StoredKeyPair| CertPublicKey {
            keytype: pair.keytype.clone(),
            key: pair.public.clone(),
        };
        let keys = &state.record.keys;
        Ok(Certificate {
            node: state.node(),
            name: self.settings.name.clone(),
            keys: CertKeys {
                sign: public(&keys.sign),
                encrypt: public(&keys.encrypt),
                auth: public(&keys.auth),
            },
            restrictions: Restrictions::default(),
        })
    }

    /// Best trusted certificate for every node.
    pub fn get_certificates(&self, vault: &Uuid) -> VaultResult<Vec<Certificate>> {
        Ok(self
            .state(vault)?
            .trust
            .best_certificates()
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn get_trust(&self, vault: &Uuid) -> VaultResult<TrustGraph> {
        Ok(self.state(vault)?.trust.clone())
    }

    /// Vouch for a node: sign a certificate for it and, unless it is synconly,
    /// re-encrypt every live record so the node can read them.
    pub fn add_certificate(&mut self, vault: &Uuid, certinfo: Certificate) -> VaultResult<Item> {
        let state = self.state(vault)?;
        state.ensure_unlocked()?;
        if certinfo.node == state.node() {
            return Err(VaultError::InvalidArgument("cannot certify own node".into()));
        }
        check_cert_keys(&certinfo.keys)?;

        let subject = certinfo.node;
        let synconly = certinfo.synconly();
        let item = self.emit_item(vault, ItemPayload::Certificate(certinfo))?;
        self.recompute_trust(vault)?;
        info!(vault = %vault, node = %subject, synconly, "certificate added");

        let mut reencrypted = 0usize;
        if !synconly {
            let live: Vec<Version> = self
                .state(vault)?
                .histories
                .values()
                .filter_map(|h| h.first())
                .filter(|v| !v.deleted)
                .cloned()
                .collect();
            for current in live {
                let next = Version {
                    id: current.id,
                    version: random_uuid(),
                    parent: Some(current.version),
                    created_at: now_secs(),
                    deleted: false,
                    fields: current.fields,
                };
                self.commit_version(vault, next)?;
                reencrypted += 1;
            }
        }
        self.store.flush()?;

        self.emit(ModelEvent::CertificateAdded {
            vault: *vault,
            node: subject,
        });
        if reencrypted > 0 {
            debug!(vault = %vault, reencrypted, "records re-encrypted for new node");
            self.emit(ModelEvent::VersionsAdded {
                vault: *vault,
                local: true,
            });
        }
        Ok(item)
    }

    /// Sign a TLS channel binding with this node's auth key.
    pub fn sign_channel_binding(&self, vault: &Uuid, binding: &[u8]) -> VaultResult<Vec<u8>> {
        let keys = self.state(vault)?.unlocked_keys()?;
        Ok(keys.auth.sign(binding))
    }

    /// Check a peer's channel-binding signature against its best certificate.
    pub fn verify_channel_binding(
        &self,
        vault: &Uuid,
        node: &Uuid,
        binding: &[u8],
        signature: &[u8],
    ) -> VaultResult<bool> {
        let state = self.state(vault)?;
        if *node == state.node() {
            return Ok(false);
        }
        Ok(state
            .trust
            .auth_key(node)
            .is_some_and(|key| key.verify(binding, signature)))
    }
}

fn check_fields(fields: &Map<String, Value>) -> VaultResult<()> {
    match RESERVED_VERSION_FIELDS.iter().find(|f| fields.contains_key(**f)) {
        Some(field) => Err(VaultError::InvalidArgument(format!(
            "field {field} is reserved"
        ))),
        None => Ok(()),
    }
}

fn check_cert_keys(keys: &CertKeys) -> VaultResult<()> {
    for (usage, key) in [("sign", &keys.sign), ("encrypt", &keys.encrypt), ("auth", &keys.auth)] {
        if key.keytype != KEYTYPE_RSA {
            return Err(VaultError::InvalidArgument(format!(
                "unsupported {usage} key type: {}",
                key.keytype
            )));
        }
        PublicKey::from_der(key.key.as_bytes()).map_err(|e| {
            VaultError::InvalidArgument(format!("invalid {usage} key: {e}"))
        })?;
    }
    Ok(())
}

/// Encrypt `version` to every current recipient of `trust`, including `own`.
fn encrypt_version(trust: &TrustGraph, own: Uuid, version: &Version) -> VaultResult<EncryptedPayload> {
    let plaintext = serde_json::to_vec(version)?;
    let key = SymmetricKey::generate();
    let (iv, blob) = encrypt_cbc(&key, &plaintext)?;

    let mut keys = BTreeMap::new();
    for cert in trust.encryption_recipients() {
        let public = match PublicKey::from_der(cert.keys.encrypt.key.as_bytes()) {
            Ok(public) => public,
            Err(e) => {
                warn!(node = %cert.node, "skipping recipient with unusable key: {e}");
                continue;
            }
        };
        keys.insert(cert.node, Blob::new(public.wrap(key.as_bytes())?));
    }
    if !keys.contains_key(&own) {
        return Err(VaultError::Consistency(format!(
            "node {own} is not a recipient of its own items"
        )));
    }

    Ok(EncryptedPayload {
        algo: SYMMETRIC_ALGO.into(),
        iv: Blob::new(iv),
        blob: Blob::new(blob),
        keyalgo: WRAP_ALGO.into(),
        keys,
    })
}

/// Decrypt a payload with this node's encrypt key. `None` when the payload
/// carries no key for `own`.
fn decrypt_payload(
    payload: &EncryptedPayload,
    own: &Uuid,
    keys: &NodeKeys,
) -> VaultResult<Option<Version>> {
    let Some(wrapped) = payload.keys.get(own) else {
        return Ok(None);
    };
    if payload.algo != SYMMETRIC_ALGO || payload.keyalgo != WRAP_ALGO {
        return Err(VaultError::InvalidArgument(format!(
            "unsupported algorithms {}/{}",
            payload.algo, payload.keyalgo
        )));
    }
    let raw = keys.encrypt.unwrap_key(wrapped.as_bytes())?;
    let key = SymmetricKey::from_slice(&raw)?;
    let plaintext = decrypt_cbc(&key, payload.iv.as_bytes(), payload.blob.as_bytes())?;
    Ok(Some(serde_json::from_slice(&plaintext)?))
}
