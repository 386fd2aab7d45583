//! Vault engine behavior across the public API: password handling, encryption
//! round trips, tamper detection, conflict resolution, and replication between
//! independent model instances through `get_items`/`import_items`.

use pvault_core::types::{ItemPayload, Restrictions, Version};
use pvault_core::{JsonStore, VaultError, Vector};
use pvault_crypto::KdfParams;
use pvault_model::canonical::verify_item;
use pvault_model::{Model, ModelEvent, ModelSettings};
use secrecy::SecretString;
use serde_json::{json, Map, Value};
use uuid::Uuid;

fn settings(name: &str) -> ModelSettings {
    ModelSettings {
        name: name.into(),
        rsa_bits: 1024,
        kdf: KdfParams { iterations: 1000 },
    }
}

fn model(name: &str) -> Model {
    Model::open(Box::new(JsonStore::in_memory()), settings(name)).unwrap()
}

fn pw(s: &str) -> SecretString {
    SecretString::from(s)
}

fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

/// Pull everything `to` is missing from `from`.
fn transfer(from: &Model, to: &mut Model, vault: &Uuid) -> pvault_model::ImportReport {
    let vector = to.get_vector(vault).unwrap();
    let items = from.get_items(vault, &vector).unwrap();
    to.import_items(vault, items).unwrap()
}

/// Two replicas of one vault that have exchanged certificates and synced once.
fn paired() -> (Model, Model, Uuid) {
    let mut a = model("alpha");
    let vault = a.create_vault("V", &pw("pw-a")).unwrap();
    let mut b = model("beta");
    b.join_vault(vault, "V", &pw("pw-b")).unwrap();

    let cert_b = b.get_certinfo(&vault).unwrap();
    let cert_a = a.get_certinfo(&vault).unwrap();
    a.add_certificate(&vault, cert_b).unwrap();
    b.add_certificate(&vault, cert_a).unwrap();

    transfer(&a, &mut b, &vault);
    transfer(&b, &mut a, &vault);
    (a, b, vault)
}

#[test]
fn password_and_lock_scenario() {
    let mut m = model("n");
    let vault = m.create_vault("V", &pw("pw")).unwrap();
    let v = m.add_version(&vault, fields(json!({"foo": "bar"}))).unwrap();

    m.lock_vault(&vault).unwrap();
    assert!(m.vault_is_locked(&vault).unwrap());
    assert!(matches!(m.get_version(&vault, &v.id), Err(VaultError::Locked(_))));
    assert!(matches!(m.unlock_vault(&vault, &pw("wrong")), Err(VaultError::WrongPassword)));
    assert!(m.vault_is_locked(&vault).unwrap());

    m.unlock_vault(&vault, &pw("pw")).unwrap();
    let got = m.get_version(&vault, &v.id).unwrap();
    assert_eq!(got.field("foo"), Some(&json!("bar")));
}

#[test]
fn locked_vault_cannot_write() {
    let mut m = model("n");
    let vault = m.create_vault("V", &pw("pw")).unwrap();
    m.lock_vault(&vault).unwrap();
    assert!(matches!(
        m.add_version(&vault, fields(json!({"a": 1}))),
        Err(VaultError::Locked(_))
    ));
    assert!(matches!(
        m.sign_channel_binding(&vault, &[0u8; 32]),
        Err(VaultError::Locked(_))
    ));
}

#[test]
fn unknown_vault_and_version() {
    let mut m = model("n");
    let missing = Uuid::from_u128(42);
    assert!(matches!(m.get_vault(&missing), Err(VaultError::NotFound(_))));
    assert!(matches!(m.lock_vault(&missing), Err(VaultError::NotFound(_))));

    let vault = m.create_vault("V", &pw("pw")).unwrap();
    assert!(matches!(m.get_version(&vault, &missing), Err(VaultError::NotFound(_))));
    assert!(matches!(
        m.update_version(&vault, &missing, Map::new()),
        Err(VaultError::NotFound(_))
    ));
}

#[test]
fn version_roundtrip_preserves_content() {
    let mut m = model("n");
    let vault = m.create_vault("V", &pw("pw")).unwrap();
    let payload = json!({
        "name": "bank",
        "username": "me",
        "password": "s3cr3t ünïcode",
        "tags": ["a", "b"],
        "meta": {"n": 3, "ok": true}
    });
    let v = m.add_version(&vault, fields(payload.clone())).unwrap();

    // A fresh unlock decrypts from the stored items, not from the cache
    m.lock_vault(&vault).unwrap();
    m.unlock_vault(&vault, &pw("pw")).unwrap();
    let got = m.get_version(&vault, &v.id).unwrap();
    assert_eq!(got, v);
    assert_eq!(Value::Object(got.fields), payload);
}

#[test]
fn update_and_delete() {
    let mut m = model("n");
    let vault = m.create_vault("V", &pw("pw")).unwrap();
    let v0 = m.add_version(&vault, fields(json!({"n": 0}))).unwrap();
    let v1 = m.update_version(&vault, &v0.id, fields(json!({"n": 1}))).unwrap();
    assert_eq!(v1.parent, Some(v0.version));
    assert_eq!(m.get_version(&vault, &v0.id).unwrap().field("n"), Some(&json!(1)));
    assert_eq!(m.get_versions(&vault).unwrap().len(), 1);

    m.delete_version(&vault, &v0.id).unwrap();
    assert!(matches!(m.get_version(&vault, &v0.id), Err(VaultError::NotFound(_))));
    assert!(m.get_versions(&vault).unwrap().is_empty());

    let history = m.get_version_history(&vault, &v0.id).unwrap();
    assert_eq!(history.len(), 3);
    assert!(history[0].deleted);
}

#[test]
fn tampered_item_fails_verification() {
    let mut m = model("n");
    let vault = m.create_vault("V", &pw("pw")).unwrap();
    m.add_version(&vault, fields(json!({"foo": "bar"}))).unwrap();
    let node = m.node_id(&vault).unwrap();
    let key = m.get_trust(&vault).unwrap().verify_key(&node).unwrap();

    let items = m.get_items(&vault, &Vector::new()).unwrap();
    let mut item = items
        .into_iter()
        .find(|i| matches!(i.payload, ItemPayload::EncryptedItem(_)))
        .unwrap();
    assert!(verify_item(&item, &key));

    if let ItemPayload::EncryptedItem(payload) = &mut item.payload {
        payload.blob.0[0] ^= 0x01;
    }
    assert!(!verify_item(&item, &key));

    let mut other = item.clone();
    other.origin.seqnr += 100;
    assert!(!verify_item(&other, &key));
}

#[test]
fn tampered_item_rejected_on_import() {
    let (a, mut b, vault) = paired();
    let mut a = a;
    a.add_version(&vault, fields(json!({"x": 1}))).unwrap();

    let vector = b.get_vector(&vault).unwrap();
    let mut items = a.get_items(&vault, &vector).unwrap();
    assert_eq!(items.len(), 1);
    if let ItemPayload::EncryptedItem(payload) = &mut items[0].payload {
        payload.iv.0[3] ^= 0x80;
    }
    let report = b.import_items(&vault, items).unwrap();
    assert_eq!(report.accepted, 0);
    assert_eq!(report.rejected, 1);
    assert_eq!(b.get_vector(&vault).unwrap(), vector);
}

#[test]
fn conflicting_edits_resolve_to_newest_leaf() {
    let mut m = model("n");
    let vault = m.create_vault("V", &pw("pw")).unwrap();
    let id = Uuid::new_v4();
    let version = |version: Uuid, parent: Option<Uuid>, created_at: u64, n: i64| Version {
        id,
        version,
        parent,
        created_at,
        deleted: false,
        fields: fields(json!({ "n": n })),
    };

    let (r0, r1, r2) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    m.save_version(&vault, version(r0, None, 1000, 0)).unwrap();
    m.save_version(&vault, version(r1, Some(r0), 2000, 1)).unwrap();
    m.save_version(&vault, version(r2, Some(r0), 3000, 2)).unwrap();

    let current = m.get_version(&vault, &id).unwrap();
    assert_eq!(current.version, r2);
    assert_eq!(current.field("n"), Some(&json!(2)));

    let history: Vec<Uuid> = m
        .get_version_history(&vault, &id)
        .unwrap()
        .iter()
        .map(|v| v.version)
        .collect();
    assert_eq!(history, vec![r2, r0]);

    let losers: Vec<Uuid> = m.get_conflicts(&vault, &id).unwrap().iter().map(|v| v.version).collect();
    assert_eq!(losers, vec![r1]);
    assert!(matches!(
        m.get_conflicts(&vault, &Uuid::new_v4()),
        Err(VaultError::NotFound(_))
    ));
}

#[test]
fn get_items_respects_vector() {
    let mut m = model("n");
    let vault = m.create_vault("V", &pw("pw")).unwrap();
    for n in 0..4 {
        m.add_version(&vault, fields(json!({ "n": n }))).unwrap();
    }
    let node = m.node_id(&vault).unwrap();
    let full = m.get_vector(&vault).unwrap();
    assert_eq!(full.get(&node), 5);

    let mut partial = Vector::new();
    partial.observe(node, 3);
    let items = m.get_items(&vault, &partial).unwrap();
    let seqnrs: Vec<u64> = items.iter().map(|i| i.origin.seqnr).collect();
    assert_eq!(seqnrs, vec![4, 5]);
    assert!(m.get_items(&vault, &full).unwrap().is_empty());
}

#[test]
fn two_replicas_converge() {
    let (mut a, mut b, vault) = paired();
    let before_a = a.get_vector(&vault).unwrap();
    let before_b = b.get_vector(&vault).unwrap();

    let from_b = b.add_version(&vault, fields(json!({"site": "b"}))).unwrap();
    let from_a = a.add_version(&vault, fields(json!({"site": "a"}))).unwrap();

    transfer(&a, &mut b, &vault);
    transfer(&b, &mut a, &vault);

    assert_eq!(a.get_version(&vault, &from_b.id).unwrap(), from_b);
    assert_eq!(b.get_version(&vault, &from_a.id).unwrap(), from_a);
    assert_eq!(a.get_vector(&vault).unwrap(), b.get_vector(&vault).unwrap());

    let after_a = a.get_vector(&vault).unwrap();
    let after_b = b.get_vector(&vault).unwrap();
    for (node, seqnr) in &before_a.entries {
        assert!(after_a.get(node) >= *seqnr);
    }
    for (node, seqnr) in &before_b.entries {
        assert!(after_b.get(node) >= *seqnr);
    }
}

#[test]
fn new_peer_gains_read_access_through_reencryption() {
    let mut a = model("alpha");
    let vault = a.create_vault("V", &pw("pw")).unwrap();
    let early = a.add_version(&vault, fields(json!({"secret": 1}))).unwrap();

    let mut b = model("beta");
    b.join_vault(vault, "V", &pw("pw")).unwrap();
    a.add_certificate(&vault, b.get_certinfo(&vault).unwrap()).unwrap();
    b.add_certificate(&vault, a.get_certinfo(&vault).unwrap()).unwrap();
    transfer(&a, &mut b, &vault);

    let seen = b.get_version(&vault, &early.id).unwrap();
    assert_eq!(seen.field("secret"), Some(&json!(1)));
    assert_eq!(seen.parent, Some(early.version));
}

#[test]
fn import_is_idempotent() {
    let (a, mut b, vault) = paired();
    let vector = Vector::new();
    let items = a.get_items(&vault, &vector).unwrap();
    let report = b.import_items(&vault, items.clone()).unwrap();
    assert_eq!(report.accepted, 0);
    assert_eq!(report.duplicates, items.len());

    let single = b.import_item(&vault, items[0].clone()).unwrap();
    assert_eq!(single.duplicates, 1);
}

#[test]
fn batch_certificates_verified_in_any_order() {
    // a trusts b, b vouches for c, c sends its own self-certificate
    let (mut a, mut b, vault) = paired();
    let mut c = model("gamma");
    c.join_vault(vault, "V", &pw("pw")).unwrap();
    b.add_certificate(&vault, c.get_certinfo(&vault).unwrap()).unwrap();
    let c_node = c.node_id(&vault).unwrap();

    let mut batch = c.get_items(&vault, &Vector::new()).unwrap();
    let vector = a.get_vector(&vault).unwrap();
    batch.extend(b.get_items(&vault, &vector).unwrap());

    let report = a.import_items(&vault, batch).unwrap();
    assert_eq!(report.rejected, 0);
    assert!(a.get_trust(&vault).unwrap().is_trusted(&c_node));
    assert!(report.accepted >= 2);
}

#[test]
fn synconly_node_is_neither_recipient_nor_signer() {
    let mut a = model("alpha");
    let vault = a.create_vault("V", &pw("pw")).unwrap();
    a.add_version(&vault, fields(json!({"k": "v"}))).unwrap();
    let items_before = a.get_items(&vault, &Vector::new()).unwrap().len();

    let mut c = model("relay");
    c.join_vault(vault, "V", &pw("pw")).unwrap();
    let c_node = c.node_id(&vault).unwrap();
    let mut certinfo = c.get_certinfo(&vault).unwrap();
    certinfo.restrictions = Restrictions { synconly: true };
    a.add_certificate(&vault, certinfo).unwrap();

    // Only the certificate itself was added: no re-encryption
    assert_eq!(a.get_items(&vault, &Vector::new()).unwrap().len(), items_before + 1);

    a.add_version(&vault, fields(json!({"k": "w"}))).unwrap();
    for item in a.get_items(&vault, &Vector::new()).unwrap() {
        if let ItemPayload::EncryptedItem(payload) = &item.payload {
            assert!(!payload.keys.contains_key(&c_node));
        }
    }

    // Items signed by the synconly node are rejected
    c.add_version(&vault, fields(json!({"evil": true}))).unwrap();
    let from_c = c.get_items(&vault, &Vector::new()).unwrap();
    let report = a.import_items(&vault, from_c.clone()).unwrap();
    assert_eq!(report.accepted, 0);
    assert_eq!(report.rejected, from_c.len());

    // but the node may still authenticate for sync
    let sig = c.sign_channel_binding(&vault, b"binding").unwrap();
    assert!(a.verify_channel_binding(&vault, &c_node, b"binding", &sig).unwrap());
}

#[test]
fn channel_binding_signatures() {
    let (a, b, vault) = paired();
    let a_node = a.node_id(&vault).unwrap();
    let sig = a.sign_channel_binding(&vault, b"cb-1").unwrap();
    assert!(b.verify_channel_binding(&vault, &a_node, b"cb-1", &sig).unwrap());
    assert!(!b.verify_channel_binding(&vault, &a_node, b"cb-2", &sig).unwrap());

    let stranger = Uuid::new_v4();
    assert!(!b.verify_channel_binding(&vault, &stranger, b"cb-1", &sig).unwrap());
}

#[test]
fn vault_management() {
    let mut m = model("n");
    let v1 = m.create_vault("work", &pw("pw")).unwrap();
    let v2 = m.create_vault("home", &pw("pw")).unwrap();

    let names: Vec<String> = m.get_vaults().into_iter().map(|v| v.name).collect();
    assert_eq!(names, vec!["home", "work"]);

    let renamed = m.update_vault(&v1, "office").unwrap();
    assert_eq!(renamed.name, "office");
    assert!(!renamed.locked);

    m.delete_vault(&v2).unwrap();
    assert!(matches!(m.get_vault(&v2), Err(VaultError::NotFound(_))));
    assert_eq!(m.get_vaults().len(), 1);
    assert!(matches!(m.create_vault(" ", &pw("pw")), Err(VaultError::InvalidArgument(_))));
}

#[test]
fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");

    let (vault, id) = {
        let mut m = Model::open(Box::new(JsonStore::open(&path).unwrap()), settings("n")).unwrap();
        let vault = m.create_vault("V", &pw("pw")).unwrap();
        let v = m.add_version(&vault, fields(json!({"keep": "me"}))).unwrap();
        (vault, v.id)
    };

    let mut m = Model::open(Box::new(JsonStore::open(&path).unwrap()), settings("n")).unwrap();
    assert!(m.vault_is_locked(&vault).unwrap());
    assert_eq!(m.get_vector(&vault).unwrap().len(), 1);
    m.unlock_vault(&vault, &pw("pw")).unwrap();
    assert_eq!(m.get_version(&vault, &id).unwrap().field("keep"), Some(&json!("me")));

    // The sequence counter continues after a restart
    let node = m.node_id(&vault).unwrap();
    m.add_version(&vault, fields(json!({"n": 2}))).unwrap();
    assert_eq!(m.get_vector(&vault).unwrap().get(&node), 3);
}

#[test]
fn events_are_published() {
    let mut m = model("n");
    let mut rx = m.subscribe();
    let vault = m.create_vault("V", &pw("pw")).unwrap();
    m.add_version(&vault, fields(json!({"a": 1}))).unwrap();
    m.lock_vault(&vault).unwrap();

    assert_eq!(rx.try_recv().unwrap(), ModelEvent::VaultCreated { vault });
    assert_eq!(
        rx.try_recv().unwrap(),
        ModelEvent::VersionsAdded { vault, local: true }
    );
    assert_eq!(rx.try_recv().unwrap(), ModelEvent::VaultLocked { vault });
}
