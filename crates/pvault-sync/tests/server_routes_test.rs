//! Router behavior for requests the client never sends: missing or
//! malformed authentication, bad paths, unknown routes.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use common::*;
use pvault_sync::server::router;
use pvault_sync::wire::{AuthHeader, ErrorBody};
use tower::ServiceExt;
use uuid::Uuid;

async fn send(app: axum::Router, method: Method, uri: &str, auth: Option<&str>) -> Response {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(auth) = auth {
        request = request.header(AUTHORIZATION, auth);
    }
    app.oneshot(request.body(Body::empty()).unwrap()).await.unwrap()
}

async fn error_message(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice::<ErrorBody>(&bytes).unwrap().error
}

async fn fixture() -> (axum::Router, Uuid) {
    let a = model("alpha").into_shared();
    let vault = a.lock().await.create_vault("V", &pw("pw")).unwrap();
    let srv = server(a);
    (router(srv.ctx, BINDING), vault)
}

#[tokio::test]
async fn pull_without_authorization_is_challenged() {
    let (app, vault) = fixture().await;
    let response = send(app, Method::GET, &format!("/api/vaults/{vault}/items"), None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()[WWW_AUTHENTICATE], "RSA_CB");
    assert!(error_message(response).await.contains("RSA_CB"));
}

#[tokio::test]
async fn pull_with_wrong_scheme_or_garbage_signature() {
    let (app, vault) = fixture().await;
    let uri = format!("/api/vaults/{vault}/items");

    let response = send(app.clone(), Method::GET, &uri, Some("HMAC_CB name=x")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let unknown = AuthHeader::rsa_cb(&Uuid::from_u128(1), b"not a signature").to_string();
    let response = send(app, Method::GET, &uri, Some(&unknown)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn malformed_vault_id_is_bad_request() {
    let (app, _vault) = fixture().await;
    let response = send(app, Method::GET, "/api/vaults/not-a-uuid/items", None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let (app, vault) = fixture().await;
    let response = send(app, Method::GET, &format!("/api/vaults/{vault}/other"), None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn pairing_requires_hmac_and_issues_kxid() {
    let (app, vault) = fixture().await;
    let uri = format!("/api/vaults/{vault}/pair");

    let response = send(app.clone(), Method::POST, &uri, None).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = send(app, Method::POST, &uri, Some("HMAC_CB name=phone")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let challenge: AuthHeader = response.headers()[WWW_AUTHENTICATE]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(challenge.is("HMAC_CB"));
    assert!(challenge.get("kxid").is_some());
}

#[tokio::test]
async fn pairing_on_unknown_vault() {
    let (app, _vault) = fixture().await;
    let uri = format!("/api/vaults/{}/pair", Uuid::from_u128(42));
    let response = send(app, Method::POST, &uri, Some("HMAC_CB name=phone")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
