//! Sync and pairing server.
//!
//! Every accepted TLS connection gets its own axum router carrying that
//! connection's channel binding as an extension, served with hyper's HTTP/1
//! connection driver. Handlers hold the model lock only for model calls.
//!
//! Routes:
//!   POST /api/vaults/{vault}/pair   PIN pairing (HMAC_CB)
//!   GET  /api/vaults/{vault}/items  pull: items newer than the caller's X-Vector,
//!                                   one page at a time (X-More when cut short)
//!   POST /api/vaults/{vault}/items  push: import the caller's items

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use pvault_core::{VaultError, VaultResult, Vector};
use pvault_model::SharedModel;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::SyncEvent;
use crate::pairing::{PairingError, PairingOutcome, PairingResponder};
use crate::transport::{self, ChannelBinding};
use crate::wire::{
    advertised_limit, page_len, parse_items, status_for, AuthHeader, ErrorBody, PushSummary,
    AUTHENTICATION_INFO, SCHEME_HMAC_CB, SCHEME_RSA_CB, X_MAX_BODY, X_MORE, X_VECTOR,
};

/// State shared by every connection.
pub struct ServerContext {
    pub model: SharedModel,
    pub pairing: Arc<PairingResponder>,
    pub max_body: usize,
    pub events: broadcast::Sender<SyncEvent>,
}

impl ServerContext {
    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

/// Error response: a status and a JSON `{"error": ..}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    challenge: Option<&'static str>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            challenge: None,
        }
    }

    fn unauthorized(scheme: &'static str, message: impl Into<String>) -> Self {
        Self {
            challenge: Some(scheme),
            ..Self::new(StatusCode::UNAUTHORIZED, message)
        }
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }
}

impl From<VaultError> for ApiError {
    fn from(e: VaultError) -> Self {
        Self::new(status_for(&e), e.to_string())
    }
}

impl From<PairingError> for ApiError {
    fn from(e: PairingError) -> Self {
        match e {
            PairingError::Forbidden(msg) => Self::forbidden(msg),
            PairingError::Vault(e) => e.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response();
        if let Some(scheme) = self.challenge {
            response
                .headers_mut()
                .insert(WWW_AUTHENTICATE, HeaderValue::from_static(scheme));
        }
        response
    }
}

fn header_value(value: impl ToString) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(&value.to_string())
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("header: {e}")))
}

fn authorization(headers: &HeaderMap) -> Result<Option<AuthHeader>, ApiError> {
    let Some(value) = headers.get(AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "non-ASCII Authorization header"))?;
    value.parse::<AuthHeader>().map(Some).map_err(ApiError::from)
}

fn request_vector(headers: &HeaderMap) -> Result<Vector, ApiError> {
    match headers.get(X_VECTOR) {
        None => Ok(Vector::new()),
        Some(value) => value
            .to_str()
            .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "non-ASCII X-Vector header"))?
            .parse::<Vector>()
            .map_err(ApiError::from),
    }
}

/// Router for one connection.
pub fn router(ctx: Arc<ServerContext>, binding: ChannelBinding) -> Router {
    let max_body = ctx.max_body;
    Router::new()
        .route("/api/vaults/{vault}/pair", post(pair))
        .route("/api/vaults/{vault}/items", get(pull).post(push))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(Extension(binding))
        .with_state(ctx)
}

// ── Pairing ───────────────────────────────────────────────────────────────────

async fn pair(
    State(ctx): State<Arc<ServerContext>>,
    Extension(binding): Extension<ChannelBinding>,
    Path(vault): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let auth = authorization(&headers)?;
    let outcome = ctx.pairing.handle(&vault, &binding, auth.as_ref(), &body).await;
    match outcome {
        Ok(PairingOutcome::Challenge(challenge)) => {
            let mut response = ApiError::unauthorized(SCHEME_HMAC_CB, "PIN proof required").into_response();
            response
                .headers_mut()
                .insert(WWW_AUTHENTICATE, header_value(challenge)?);
            Ok(response)
        }
        Ok(PairingOutcome::Completed(reply)) => {
            ctx.emit(SyncEvent::PairingCompleted {
                vault,
                node: reply.peer,
            });
            let mut response = Json(reply.certinfo).into_response();
            response
                .headers_mut()
                .insert(AUTHENTICATION_INFO, header_value(reply.authentication_info)?);
            Ok(response)
        }
        Err(e) => {
            warn!(vault = %vault, "pairing failed: {e}");
            ctx.emit(SyncEvent::PairingFailed { vault });
            Err(e.into())
        }
    }
}

// ── Sync ──────────────────────────────────────────────────────────────────────

/// Check the caller's RSA_CB proof and produce ours. Returns the caller's
/// node and our `Authentication-Info` value.
async fn authenticate(
    ctx: &ServerContext,
    vault: &Uuid,
    binding: &ChannelBinding,
    headers: &HeaderMap,
) -> Result<(Uuid, AuthHeader), ApiError> {
    let auth = authorization(headers)?
        .filter(|a| a.is(SCHEME_RSA_CB))
        .ok_or_else(|| ApiError::unauthorized(SCHEME_RSA_CB, "RSA_CB authorization required"))?;
    let (node, signature) = auth
        .rsa_cb_parts()
        .map_err(|e| ApiError::unauthorized(SCHEME_RSA_CB, e.to_string()))?;

    let model = ctx.model.lock().await;
    if !model.verify_channel_binding(vault, &node, binding.as_bytes(), &signature)? {
        warn!(vault = %vault, node = %node, "sync authentication failed");
        return Err(ApiError::forbidden(format!("node {node} failed authentication")));
    }
    let own = model.node_id(vault)?;
    let proof = model.sign_channel_binding(vault, binding.as_bytes())?;
    Ok((node, AuthHeader::rsa_cb(&own, &proof)))
}

fn sync_headers(info: AuthHeader, vector: &Vector, max_body: usize) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHENTICATION_INFO, header_value(info)?);
    headers.insert(X_VECTOR, header_value(vector.to_header())?);
    headers.insert(X_MAX_BODY, header_value(max_body)?);
    Ok(headers)
}

async fn pull(
    State(ctx): State<Arc<ServerContext>>,
    Extension(binding): Extension<ChannelBinding>,
    Path(vault): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (node, info) = authenticate(&ctx, &vault, &binding, &headers).await?;
    let theirs = request_vector(&headers)?;
    let budget = advertised_limit(&headers).map_or(ctx.max_body, |limit| limit.min(ctx.max_body));

    let (mut items, ours) = {
        let model = ctx.model.lock().await;
        (model.get_items(&vault, &theirs)?, model.get_vector(&vault)?)
    };
    let pending = items.len();
    items.truncate(page_len(&items, budget)?);
    let more = items.len() < pending;
    debug!(vault = %vault, node = %node, items = items.len(), pending, "serving pull");
    ctx.emit(SyncEvent::Served { vault, node });

    let mut headers = sync_headers(info, &ours, ctx.max_body)?;
    if more {
        headers.insert(X_MORE, HeaderValue::from_static("1"));
    }
    Ok((headers, Json(items)).into_response())
}

async fn push(
    State(ctx): State<Arc<ServerContext>>,
    Extension(binding): Extension<ChannelBinding>,
    Path(vault): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (node, info) = authenticate(&ctx, &vault, &binding, &headers).await?;
    let items = parse_items(&body)?;

    let (report, ours) = {
        let mut model = ctx.model.lock().await;
        let report = model.import_items(&vault, items)?;
        (report, model.get_vector(&vault)?)
    };
    debug!(
        vault = %vault,
        node = %node,
        accepted = report.accepted,
        duplicates = report.duplicates,
        rejected = report.rejected,
        "push imported"
    );
    ctx.emit(SyncEvent::Served { vault, node });
    let summary = PushSummary {
        accepted: report.accepted,
        duplicates: report.duplicates,
        rejected: report.rejected,
    };
    Ok((sync_headers(info, &ours, ctx.max_body)?, Json(summary)).into_response())
}

// ── Connection handling ───────────────────────────────────────────────────────

/// Serve HTTP/1.1 on an established, bound connection until the peer closes.
pub async fn serve_connection<IO>(io: IO, binding: ChannelBinding, ctx: Arc<ServerContext>) -> VaultResult<()>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = TowerToHyperService::new(router(ctx, binding));
    hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .await
        .map_err(|e| VaultError::Remote(format!("serving connection: {e}")))
}

/// TLS listener accepting sync and pairing connections.
pub struct SyncServer {
    ctx: Arc<ServerContext>,
    acceptor: TlsAcceptor,
}

impl SyncServer {
    pub fn new(ctx: ServerContext) -> VaultResult<Self> {
        Ok(Self {
            ctx: Arc::new(ctx),
            acceptor: TlsAcceptor::from(transport::server_config()?),
        })
    }

    /// Accept connections until `shutdown` fires. Each connection is handled
    /// on its own task; a failing connection never stops the listener.
    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> VaultResult<()> {
        let local = listener.local_addr()?;
        info!(addr = %local, "sync server listening");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("sync server: shutdown signal received");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (tcp, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    let acceptor = self.acceptor.clone();
                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        let (tls, binding) = match transport::accept(&acceptor, tcp).await {
                            Ok(conn) => conn,
                            Err(e) => {
                                debug!(addr = %peer, "TLS accept failed: {e}");
                                return;
                            }
                        };
                        if let Err(e) = serve_connection(tls, binding, ctx).await {
                            debug!(addr = %peer, "connection ended: {e}");
                        }
                    });
                }
            }
        }
    }
}
