//! Sync and pairing client over one established connection.
//!
//! A `SyncClient` owns the HTTP/1 sender of a single TLS connection (or any
//! other byte stream plus its channel binding) and issues requests on it
//! sequentially. The scheduler syncs every vault reachable at an address over
//! one client.

use axum::body::{Body, Bytes};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, HOST, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode};
use hyper::client::conn::http1::SendRequest;
use hyper_util::rt::TokioIo;
use pvault_core::types::Certificate;
use pvault_core::{VaultError, VaultResult, Vector};
use pvault_crypto::Blob;
use pvault_model::SharedModel;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pairing::PinPrompt;
use crate::transport::ChannelBinding;
use crate::wire::{
    advertised_limit, error_for, items_path, page_len, pair_path, parse_items, pin_proof,
    verify_pin_proof, AuthHeader, PushSummary, AUTHENTICATION_INFO, SCHEME_HMAC_CB, SCHEME_RSA_CB,
    X_MAX_BODY, X_MORE, X_VECTOR,
};

/// Result of syncing one vault with one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Node that answered
    pub node: Uuid,
    /// Pulled items that were new to us
    pub pulled: usize,
    /// Items we sent
    pub pushed: usize,
    /// Items either side refused
    pub rejected: usize,
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Reply {
    fn auth_header(&self, name: HeaderName) -> VaultResult<AuthHeader> {
        self.headers
            .get(&name)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| VaultError::Remote(format!("response lacks {name}")))?
            .parse()
    }

    fn ensure_ok(&self) -> VaultResult<()> {
        if self.status.is_success() {
            Ok(())
        } else {
            Err(error_for(self.status, &self.body))
        }
    }
}

pub struct SyncClient {
    sender: SendRequest<Body>,
    binding: ChannelBinding,
    max_body: usize,
}

impl SyncClient {
    /// Start HTTP/1 on `io`. The connection is driven by a spawned task that
    /// ends when the client is dropped.
    pub async fn handshake<IO>(io: IO, binding: ChannelBinding, max_body: usize) -> VaultResult<Self>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
            .await
            .map_err(|e| VaultError::Remote(format!("HTTP handshake: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("client connection closed: {e}");
            }
        });
        Ok(Self {
            sender,
            binding,
            max_body,
        })
    }

    pub fn binding(&self) -> &ChannelBinding {
        &self.binding
    }

    /// The underlying connection is gone; further requests will fail.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn send(
        &mut self,
        method: Method,
        path: &str,
        headers: Vec<(HeaderName, String)>,
        body: Vec<u8>,
    ) -> VaultResult<Reply> {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, crate::wire::HOST)
            .header(CONTENT_TYPE, "application/json");
        for (name, value) in headers {
            let value = HeaderValue::from_str(&value)
                .map_err(|e| VaultError::InvalidArgument(format!("header {name}: {e}")))?;
            builder = builder.header(name, value);
        }
        let request = builder
            .body(Body::from(body))
            .map_err(|e| VaultError::Platform(format!("building request: {e}")))?;

        self.sender
            .ready()
            .await
            .map_err(|e| VaultError::Remote(format!("connection not ready: {e}")))?;
        let response = self
            .sender
            .send_request(request)
            .await
            .map_err(|e| VaultError::Remote(format!("{path}: {e}")))?;

        let (parts, incoming) = response.into_parts();
        let body = axum::body::to_bytes(Body::new(incoming), self.max_body)
            .await
            .map_err(|e| VaultError::Remote(format!("reading {path} response: {e}")))?;
        Ok(Reply {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }

    /// Check the server's RSA_CB proof on a sync response.
    async fn verify_server(&self, model: &SharedModel, vault: &Uuid, reply: &Reply) -> VaultResult<Uuid> {
        let info = reply.auth_header(HeaderName::from_static(AUTHENTICATION_INFO))?;
        if !info.is(SCHEME_RSA_CB) {
            return Err(VaultError::Remote(format!("unexpected scheme {}", info.scheme)));
        }
        let (node, signature) = info.rsa_cb_parts()?;
        let valid = model
            .lock()
            .await
            .verify_channel_binding(vault, &node, self.binding.as_bytes(), &signature)?;
        if !valid {
            warn!(vault = %vault, node = %node, "server failed authentication");
            return Err(VaultError::Remote(format!("node {node} failed authentication")));
        }
        Ok(node)
    }

    /// Pull what the peer has and we lack, then push what it lacks.
    ///
    /// Pulls come back in pages bounded by our body limit. The cursor sent
    /// with each pull is our vector advanced past every item already
    /// received, so items we refuse are not fetched again in the same sync.
    /// Pushes are split to fit the peer's advertised limit.
    pub async fn sync_vault(&mut self, model: &SharedModel, vault: &Uuid) -> VaultResult<SyncReport> {
        let (authorization, mut cursor) = {
            let model = model.lock().await;
            let own = model.node_id(vault)?;
            let proof = model.sign_channel_binding(vault, self.binding.as_bytes())?;
            (AuthHeader::rsa_cb(&own, &proof).to_string(), model.get_vector(vault)?)
        };
        let path = items_path(vault);
        let mut report = SyncReport::default();
        let mut pages = 0usize;

        let (theirs, peer_limit) = loop {
            let reply = self
                .send(
                    Method::GET,
                    &path,
                    vec![
                        (AUTHORIZATION, authorization.clone()),
                        (HeaderName::from_static(X_VECTOR), cursor.to_header()),
                        (HeaderName::from_static(X_MAX_BODY), self.max_body.to_string()),
                    ],
                    Vec::new(),
                )
                .await?;
            reply.ensure_ok()?;
            report.node = self.verify_server(model, vault, &reply).await?;
            let theirs: Vector = reply
                .headers
                .get(X_VECTOR)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| VaultError::Remote("pull response lacks X-Vector".into()))?
                .parse()?;
            let more = reply.headers.contains_key(X_MORE);
            let pulled = parse_items(&reply.body)?;
            pages += 1;

            let mut received = Vector::new();
            for item in &pulled {
                received.observe(item.origin.node, item.origin.seqnr);
            }
            cursor.merge(&received);

            let imported = model.lock().await.import_items(vault, pulled)?;
            report.pulled += imported.accepted;
            report.rejected += imported.rejected;

            if !more || received.is_empty() {
                break (theirs, advertised_limit(&reply.headers));
            }
        };

        let mut outgoing = model.lock().await.get_items(vault, &theirs)?;
        let node = report.node;
        if outgoing.is_empty() {
            debug!(vault = %vault, node = %node, pulled = report.pulled, pages, "nothing to push");
            return Ok(report);
        }

        let budget = peer_limit.map_or(self.max_body, |limit| limit.min(self.max_body));
        let mut accepted = 0usize;
        while !outgoing.is_empty() {
            let take = page_len(&outgoing, budget)?;
            let chunk: Vec<_> = outgoing.drain(..take).collect();
            let count = chunk.len();
            let reply = self
                .send(
                    Method::POST,
                    &path,
                    vec![(AUTHORIZATION, authorization.clone())],
                    serde_json::to_vec(&chunk)?,
                )
                .await?;
            reply.ensure_ok()?;
            self.verify_server(model, vault, &reply).await?;
            let summary: PushSummary = serde_json::from_slice(&reply.body)
                .map_err(|e| VaultError::Remote(format!("bad push summary: {e}")))?;

            report.pushed += count;
            report.rejected += summary.rejected;
            accepted += summary.accepted;
        }
        debug!(
            vault = %vault,
            node = %node,
            pulled = report.pulled,
            pages,
            pushed = report.pushed,
            accepted,
            "vault synced"
        );
        Ok(report)
    }

    /// Pair this node into `vault` with the responder at the other end.
    /// Returns the responder's certificate, which has been added locally.
    pub async fn pair(
        &mut self,
        model: &SharedModel,
        vault: &Uuid,
        name: &str,
        prompt: &dyn PinPrompt,
    ) -> VaultResult<Certificate> {
        let path = pair_path(vault);
        let name: String = name
            .chars()
            .filter(|c| c.is_ascii_graphic() || *c == ' ')
            .collect();
        let hello = AuthHeader::new(SCHEME_HMAC_CB).with("name", name.trim());

        let reply = self
            .send(Method::POST, &path, vec![(AUTHORIZATION, hello.to_string())], Vec::new())
            .await?;
        if reply.status != StatusCode::UNAUTHORIZED {
            reply.ensure_ok()?;
            return Err(VaultError::Remote(format!(
                "expected a pairing challenge, got {}",
                reply.status
            )));
        }
        let challenge = reply.auth_header(WWW_AUTHENTICATE)?;
        if !challenge.is(SCHEME_HMAC_CB) {
            return Err(VaultError::Remote(format!("unexpected scheme {}", challenge.scheme)));
        }
        let kxid = challenge.require("kxid")?.to_string();
        info!(vault = %vault, kxid = %kxid, "pairing challenge received");

        let pin = prompt.read_pin(vault, &kxid).await?;
        let pin = pin.trim();
        let proof = pin_proof(pin, 1, self.binding.as_bytes())?;
        let certinfo = model.lock().await.get_certinfo(vault)?;
        let confirm = AuthHeader::new(SCHEME_HMAC_CB)
            .with("kxid", kxid.as_str())
            .with("signature", Blob::new(proof).to_base64());

        let reply = self
            .send(
                Method::POST,
                &path,
                vec![(AUTHORIZATION, confirm.to_string())],
                serde_json::to_vec(&certinfo)?,
            )
            .await?;
        reply.ensure_ok()?;

        let info = reply.auth_header(HeaderName::from_static(AUTHENTICATION_INFO))?;
        let answer = info.signature()?;
        if !info.is(SCHEME_HMAC_CB) || !verify_pin_proof(pin, -1, self.binding.as_bytes(), &answer) {
            warn!(vault = %vault, kxid = %kxid, "responder failed PIN proof");
            return Err(VaultError::Remote("responder failed PIN proof".into()));
        }

        let peer: Certificate = serde_json::from_slice(&reply.body)
            .map_err(|e| VaultError::Remote(format!("bad certificate from responder: {e}")))?;
        model.lock().await.add_certificate(vault, peer.clone())?;
        info!(vault = %vault, node = %peer.node, name = %peer.name, "paired");
        Ok(peer)
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("binding", &self.binding)
            .field("max_body", &self.max_body)
            .finish()
    }
}
