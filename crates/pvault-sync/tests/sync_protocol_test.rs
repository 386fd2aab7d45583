//! Pairing and sync over in-memory connections.
//!
//! Each test runs a real server (axum over hyper HTTP/1) on one end of a
//! `tokio::io::duplex` pipe and a `SyncClient` on the other, with a fixed
//! channel binding standing in for the TLS exporter.

mod common;

use common::*;
use pvault_core::{VaultError, Vector};
use pvault_sync::{ChannelBinding, SyncEvent};
use serde_json::{json, Map, Value};

fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn pairing_with_correct_pin_certifies_both_sides() {
    let a = model("alpha").into_shared();
    let vault = a.lock().await.create_vault("V", &pw("pw-a")).unwrap();
    let b = model("beta").into_shared();
    b.lock().await.join_vault(vault, "V", &pw("pw-b")).unwrap();
    let a_node = a.lock().await.node_id(&vault).unwrap();
    let b_node = b.lock().await.node_id(&vault).unwrap();

    let mut srv = server(a.clone());
    let mut client = connect(srv.ctx.clone()).await;
    let prompt = BoardPrompt {
        board: srv.board.clone(),
        shift: 0,
    };

    let cert = client.pair(&b, &vault, "beta laptop", &prompt).await.unwrap();
    assert_eq!(cert.node, a_node);
    assert_eq!(cert.name, "alpha");

    assert!(a.lock().await.get_trust(&vault).unwrap().is_trusted(&b_node));
    assert!(b.lock().await.get_trust(&vault).unwrap().is_trusted(&a_node));
    assert_eq!(
        srv.events.try_recv().unwrap(),
        SyncEvent::PairingCompleted { vault, node: b_node }
    );
}

#[tokio::test]
async fn pairing_with_wrong_pin_fails_closed() {
    let a = model("alpha").into_shared();
    let vault = a.lock().await.create_vault("V", &pw("pw-a")).unwrap();
    let b = model("beta").into_shared();
    b.lock().await.join_vault(vault, "V", &pw("pw-b")).unwrap();

    let mut srv = server(a.clone());
    let mut client = connect(srv.ctx.clone()).await;
    let prompt = BoardPrompt {
        board: srv.board.clone(),
        shift: 1,
    };

    let err = client.pair(&b, &vault, "beta", &prompt).await.unwrap_err();
    assert!(matches!(err, VaultError::Remote(_)), "got {err:?}");

    // Only the self-certificates remain
    assert_eq!(a.lock().await.get_certificates(&vault).unwrap().len(), 1);
    assert_eq!(b.lock().await.get_certificates(&vault).unwrap().len(), 1);
    assert_eq!(srv.events.try_recv().unwrap(), SyncEvent::PairingFailed { vault });
}

#[tokio::test]
async fn paired_nodes_sync_both_directions() {
    let a = model("alpha").into_shared();
    let vault = a.lock().await.create_vault("V", &pw("pw-a")).unwrap();
    let b = model("beta").into_shared();
    b.lock().await.join_vault(vault, "V", &pw("pw-b")).unwrap();
    let a_node = a.lock().await.node_id(&vault).unwrap();

    let srv = server(a.clone());
    let mut client = connect(srv.ctx.clone()).await;
    let prompt = BoardPrompt {
        board: srv.board.clone(),
        shift: 0,
    };
    client.pair(&b, &vault, "beta", &prompt).await.unwrap();

    let x = a.lock().await.add_version(&vault, fields(json!({"site": "a"}))).unwrap();
    let y = b.lock().await.add_version(&vault, fields(json!({"site": "b"}))).unwrap();
    let before = b.lock().await.get_vector(&vault).unwrap();

    let report = client.sync_vault(&b, &vault).await.unwrap();
    assert_eq!(report.node, a_node);
    // self-cert, certificate for b, version x
    assert_eq!(report.pulled, 3);
    // self-cert, certificate for a, version y
    assert_eq!(report.pushed, 3);
    assert_eq!(report.rejected, 0);

    let got = b.lock().await.get_version(&vault, &x.id).unwrap();
    assert_eq!(got.field("site"), Some(&json!("a")));
    let got = a.lock().await.get_version(&vault, &y.id).unwrap();
    assert_eq!(got.field("site"), Some(&json!("b")));

    let after = b.lock().await.get_vector(&vault).unwrap();
    for (node, seqnr) in &before.entries {
        assert!(after.get(node) >= *seqnr);
    }
    assert_eq!(after.get(&a_node), 3);

    // Nothing left to move
    let again = client.sync_vault(&b, &vault).await.unwrap();
    assert_eq!((again.pulled, again.pushed), (0, 0));
    assert_eq!(
        a.lock().await.get_vector(&vault).unwrap(),
        b.lock().await.get_vector(&vault).unwrap()
    );
}

#[tokio::test]
async fn vault_larger_than_body_limit_syncs_in_pages() {
    const LIMIT: usize = 16 * 1024;
    let a = model("alpha").into_shared();
    let vault = a.lock().await.create_vault("V", &pw("pw-a")).unwrap();
    let b = model("beta").into_shared();
    b.lock().await.join_vault(vault, "V", &pw("pw-b")).unwrap();
    exchange_certificates(&a, &b, &vault).await;

    for i in 0..40 {
        let note = format!("a-{i}-{}", "x".repeat(200));
        a.lock().await.add_version(&vault, fields(json!({ "note": note }))).unwrap();
        let note = format!("b-{i}-{}", "y".repeat(200));
        b.lock().await.add_version(&vault, fields(json!({ "note": note }))).unwrap();
    }
    for side in [&a, &b] {
        let all = side.lock().await.get_items(&vault, &Vector::new()).unwrap();
        assert!(serde_json::to_vec(&all).unwrap().len() > 2 * LIMIT);
    }

    let srv = server_with_limit(a.clone(), LIMIT);
    let mut client = connect_limited(srv.ctx.clone(), LIMIT).await;
    let report = client.sync_vault(&b, &vault).await.unwrap();
    assert_eq!(report.rejected, 0);
    assert!(report.pulled >= 40, "pulled {}", report.pulled);
    assert!(report.pushed >= 40, "pushed {}", report.pushed);

    assert_eq!(
        a.lock().await.get_vector(&vault).unwrap(),
        b.lock().await.get_vector(&vault).unwrap()
    );
    assert_eq!(a.lock().await.get_versions(&vault).unwrap().len(), 80);
    assert_eq!(b.lock().await.get_versions(&vault).unwrap().len(), 80);

    let again = client.sync_vault(&b, &vault).await.unwrap();
    assert_eq!((again.pulled, again.pushed), (0, 0));
}

#[tokio::test]
async fn unpaired_node_is_refused() {
    let a = model("alpha").into_shared();
    let vault = a.lock().await.create_vault("V", &pw("pw-a")).unwrap();
    a.lock().await.add_version(&vault, fields(json!({"k": "v"}))).unwrap();
    let a_node = a.lock().await.node_id(&vault).unwrap();
    let c = model("gamma").into_shared();
    c.lock().await.join_vault(vault, "V", &pw("pw-c")).unwrap();

    let srv = server(a.clone());
    let mut client = connect(srv.ctx.clone()).await;
    let err = client.sync_vault(&c, &vault).await.unwrap_err();
    assert!(matches!(err, VaultError::Remote(_)), "got {err:?}");
    assert_eq!(c.lock().await.get_vector(&vault).unwrap().get(&a_node), 0);
}

#[tokio::test]
async fn client_refuses_untrusted_server() {
    let a = model("alpha").into_shared();
    let vault = a.lock().await.create_vault("V", &pw("pw-a")).unwrap();
    a.lock().await.add_version(&vault, fields(json!({"k": "v"}))).unwrap();
    let a_node = a.lock().await.node_id(&vault).unwrap();
    let c = model("gamma").into_shared();
    c.lock().await.join_vault(vault, "V", &pw("pw-c")).unwrap();

    // a vouches for c, c never vouched for a
    let cert_c = c.lock().await.get_certinfo(&vault).unwrap();
    a.lock().await.add_certificate(&vault, cert_c).unwrap();

    let srv = server(a.clone());
    let mut client = connect(srv.ctx.clone()).await;
    let err = client.sync_vault(&c, &vault).await.unwrap_err();
    assert!(matches!(err, VaultError::Remote(_)), "got {err:?}");
    assert_eq!(c.lock().await.get_vector(&vault).unwrap().get(&a_node), 0);
}

#[tokio::test]
async fn proof_from_another_channel_is_rejected() {
    let a = model("alpha").into_shared();
    let vault = a.lock().await.create_vault("V", &pw("pw-a")).unwrap();
    let b = model("beta").into_shared();
    b.lock().await.join_vault(vault, "V", &pw("pw-b")).unwrap();
    exchange_certificates(&a, &b, &vault).await;

    let srv = server(a.clone());
    let mut client = connect_with(srv.ctx.clone(), BINDING, ChannelBinding([8u8; 32])).await;
    let err = client.sync_vault(&b, &vault).await.unwrap_err();
    assert!(matches!(err, VaultError::Remote(_)), "got {err:?}");
}

#[tokio::test]
async fn locked_or_unknown_vault_on_server() {
    let a = model("alpha").into_shared();
    let vault = a.lock().await.create_vault("V", &pw("pw-a")).unwrap();
    let b = model("beta").into_shared();
    b.lock().await.join_vault(vault, "V", &pw("pw-b")).unwrap();
    exchange_certificates(&a, &b, &vault).await;
    let elsewhere = b.lock().await.create_vault("W", &pw("pw-b")).unwrap();

    let srv = server(a.clone());
    let mut client = connect(srv.ctx.clone()).await;

    let err = client.sync_vault(&b, &elsewhere).await.unwrap_err();
    assert!(matches!(err, VaultError::NotFound(_)), "got {err:?}");

    a.lock().await.lock_vault(&vault).unwrap();
    let err = client.sync_vault(&b, &vault).await.unwrap_err();
    assert!(matches!(err, VaultError::Locked(_)), "got {err:?}");

    // The connection survives error responses
    assert!(!client.is_closed());
    a.lock().await.unlock_vault(&vault, &pw("pw-a")).unwrap();
    client.sync_vault(&b, &vault).await.unwrap();
}

#[tokio::test]
async fn synconly_peer_relays_but_is_not_a_recipient() {
    let a = model("alpha").into_shared();
    let vault = a.lock().await.create_vault("V", &pw("pw-a")).unwrap();
    let relay = model("relay").into_shared();
    relay.lock().await.join_vault(vault, "V", &pw("pw-r")).unwrap();
    let relay_node = relay.lock().await.node_id(&vault).unwrap();

    let mut cert = relay.lock().await.get_certinfo(&vault).unwrap();
    cert.restrictions.synconly = true;
    a.lock().await.add_certificate(&vault, cert).unwrap();
    let cert_a = a.lock().await.get_certinfo(&vault).unwrap();
    relay.lock().await.add_certificate(&vault, cert_a).unwrap();

    let v = a.lock().await.add_version(&vault, fields(json!({"k": "v"}))).unwrap();

    let srv = server(a.clone());
    let mut client = connect(srv.ctx.clone()).await;
    let report = client.sync_vault(&relay, &vault).await.unwrap();
    assert!(report.pulled > 0);

    // Items are stored on the relay but it cannot read them
    let relay = relay.lock().await;
    assert!(relay.get_vector(&vault).unwrap().len() >= 2);
    assert!(matches!(relay.get_version(&vault, &v.id), Err(VaultError::NotFound(_))));
    assert!(!a
        .lock()
        .await
        .get_trust(&vault)
        .unwrap()
        .encryption_recipients()
        .iter()
        .any(|c| c.node == relay_node));
}
