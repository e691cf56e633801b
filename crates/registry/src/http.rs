//! HTTP front-end for the registry
//!
//! One router served on two listeners, IPv4 and IPv6 (with V6ONLY so
//! the families stay separate). Every request goes through one mutex
//! around the service context, keeping dispatch strictly serialized.

use crate::service::{RegistryApi, RegistryService};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::info;
use weftnet_common::wire::{
    BootstrapReply, CertificateReply, CertificateRequest, DeclareReply, DeclareRequest,
    PeerListReply, TokenRequest,
};
use weftnet_common::{Error, Result};

type Shared = Arc<Mutex<RegistryService>>;

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::UnknownToken => StatusCode::FORBIDDEN,
            Error::UnauthorizedSource { .. } => StatusCode::UNAUTHORIZED,
            Error::AddressSpaceExhausted { .. } => StatusCode::CONFLICT,
            Error::InvalidConfig(_) | Error::InvalidPrefix(_) | Error::InvalidAddress(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}

pub async fn serve(service: RegistryService, port: u16) -> Result<()> {
    let shared: Shared = Arc::new(Mutex::new(service));
    let app = Router::new()
        .route("/token", post(request_token))
        .route("/certificate", post(request_certificate))
        .route("/ca", get(get_ca))
        .route("/declare", post(declare))
        .route("/peers", get(peer_list))
        .route("/bootstrap", get(bootstrap_peer))
        .layer(TraceLayer::new_for_http())
        .with_state(shared);

    let v4 = tokio::net::TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await?;
    let v6 = bind_v6_only(port)?;
    info!("Registry listening on port {} (both address families)", port);

    let serve4 = axum::serve(
        v4,
        app.clone()
            .into_make_service_with_connect_info::<SocketAddr>(),
    );
    let serve6 = axum::serve(v6, app.into_make_service_with_connect_info::<SocketAddr>());
    tokio::try_join!(async { serve4.await }, async { serve6.await })?;
    Ok(())
}

/// Bind `[::]:port` with IPV6_V6ONLY so the IPv4 listener on the same
/// port stays independent.
fn bind_v6_only(port: u16) -> Result<tokio::net::TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_only_v6(true)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)).into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    Ok(tokio::net::TcpListener::from_std(socket.into())?)
}

async fn request_token(
    State(svc): State<Shared>,
    Json(req): Json<TokenRequest>,
) -> std::result::Result<StatusCode, ApiError> {
    svc.lock().await.request_token(&req.email).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn request_certificate(
    State(svc): State<Shared>,
    Json(req): Json<CertificateRequest>,
) -> std::result::Result<Json<CertificateReply>, ApiError> {
    let cert_pem = svc
        .lock()
        .await
        .request_certificate(&req.token, &req.csr_pem)
        .await?;
    Ok(Json(CertificateReply { cert_pem }))
}

async fn get_ca(State(svc): State<Shared>) -> std::result::Result<String, ApiError> {
    Ok(svc.lock().await.ca_certificate().await?)
}

async fn declare(
    State(svc): State<Shared>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(req): Json<DeclareRequest>,
) -> std::result::Result<Json<DeclareReply>, ApiError> {
    let registered = svc.lock().await.declare(peer.ip(), &req.address).await?;
    Ok(Json(DeclareReply { registered }))
}

#[derive(Deserialize)]
struct PeersQuery {
    n: usize,
}

async fn peer_list(
    State(svc): State<Shared>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(q): Query<PeersQuery>,
) -> std::result::Result<Json<PeerListReply>, ApiError> {
    let peers = svc.lock().await.peer_list(q.n, peer.ip()).await?;
    Ok(Json(PeerListReply { peers }))
}

#[derive(Deserialize)]
struct BootstrapQuery {
    prefix: String,
}

async fn bootstrap_peer(
    State(svc): State<Shared>,
    Query(q): Query<BootstrapQuery>,
) -> std::result::Result<Json<BootstrapReply>, ApiError> {
    let blob = svc.lock().await.bootstrap_peer(&q.prefix).await?;
    Ok(Json(BootstrapReply {
        blob: BASE64.encode(blob),
    }))
}
