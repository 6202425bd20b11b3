//! HTTP surface of the escrow endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post, put},
    Json, Router,
};
use keyfleet_types::{
    BundleUpdate, DepositRequest, DepositResponse, EscrowAdvertisement, EscrowStatus,
    ShareRequest, ShareResponse,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::EscrowService;
use crate::error::TrustResult;

/// Handler: GET /v1/adv
async fn advertisement(
    State(service): State<Arc<EscrowService>>,
) -> TrustResult<Json<EscrowAdvertisement>> {
    Ok(Json(service.advertisement()?))
}

/// Handler: POST /v1/deposit
async fn deposit(
    State(service): State<Arc<EscrowService>>,
    Json(request): Json<DepositRequest>,
) -> TrustResult<Json<DepositResponse>> {
    Ok(Json(service.deposit(&request)?))
}

/// Handler: POST /v1/release
///
/// Authorization failures are answered with a signed denial and status 200;
/// only malformed input or internal failures produce an error status.
async fn release(
    State(service): State<Arc<EscrowService>>,
    Json(request): Json<ShareRequest>,
) -> TrustResult<Json<ShareResponse>> {
    Ok(Json(service.release(&request).await?))
}

/// Handler: PUT /v1/bundle
async fn update_bundle(
    State(service): State<Arc<EscrowService>>,
    Json(update): Json<BundleUpdate>,
) -> TrustResult<Json<EscrowStatus>> {
    Ok(Json(service.update_bundle(&update).await?))
}

/// Handler: GET /v1/status
async fn status(State(service): State<Arc<EscrowService>>) -> TrustResult<Json<EscrowStatus>> {
    Ok(Json(service.status().await?))
}

/// Create the escrow router.
pub fn escrow_router(service: Arc<EscrowService>) -> Router {
    Router::new()
        .route("/v1/adv", get(advertisement))
        .route("/v1/deposit", post(deposit))
        .route("/v1/release", post(release))
        .route("/v1/bundle", put(update_bundle))
        .route("/v1/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Serve the escrow API on `addr` until ctrl-c.
pub async fn serve(service: Arc<EscrowService>, addr: SocketAddr) -> TrustResult<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(endpoint = %service.endpoint_id(), "Escrow endpoint listening on http://{}", addr);

    axum::serve(listener, escrow_router(service))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down escrow endpoint");
        })
        .await?;
    Ok(())
}
