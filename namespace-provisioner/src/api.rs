//! HTTP API surface (§6). Grounded line-for-line on the teacher's
//! `domain_management_api.rs`: a `Router::new().route(...).with_state(state)`
//! wired through `ServiceBuilder`/`CorsLayer`, handlers returning
//! `Result<Json<T>, StatusCode>`. The only logic here is decode/validate,
//! call into `ClusterManager`, serialize the result — no business rules.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{delete, get, post};
use axum::Router;
use cluster_provisioner::{ClusterManager, ProvisionError, ProvisioningStatus};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ClusterManager>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/namespace/provision", post(provision_namespace))
        .route("/v1/namespace/status", get(get_namespace_status))
        .route("/v1/namespace/:id", delete(deprovision_namespace))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
}

#[derive(Debug, Deserialize)]
pub struct ProvisionRequest {
    pub namespace: String,
}

#[derive(Debug, Serialize)]
pub struct ProvisionResponse {
    pub cluster_id: String,
    pub poll_url: String,
    pub status: String,
    pub estimated_time_seconds: u32,
}

async fn provision_namespace(
    State(state): State<AppState>,
    Json(req): Json<ProvisionRequest>,
) -> Result<Json<ProvisionResponse>, StatusCode> {
    // namespace_id and namespace_name are the same tenant-facing string at
    // this boundary; the ID/name split in the data model exists for the
    // internal registry's own bookkeeping, not the public request shape.
    let namespace_id = req.namespace.clone();
    let cluster = state
        .manager
        .provision_cluster(&namespace_id, &req.namespace, "api")
        .await
        .map_err(error_to_status)?;

    Ok(Json(ProvisionResponse {
        cluster_id: cluster.id.clone(),
        poll_url: format!("/v1/namespace/status?id={}", cluster.id),
        status: "provisioning".to_string(),
        estimated_time_seconds: 120,
    }))
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub id: String,
}

async fn get_namespace_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<ProvisioningStatus>, StatusCode> {
    let status = state
        .manager
        .get_cluster_status(&query.id)
        .await
        .map_err(error_to_status)?;
    Ok(Json(status))
}

#[derive(Debug, Serialize)]
pub struct DeprovisionResponse {
    pub status: String,
}

async fn deprovision_namespace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeprovisionResponse>, StatusCode> {
    state
        .manager
        .deprovision_cluster(&id)
        .await
        .map_err(error_to_status)?;
    Ok(Json(DeprovisionResponse {
        status: "deprovisioning".to_string(),
    }))
}

fn error_to_status(err: ProvisionError) -> StatusCode {
    warn!(error = %err, "provisioner API request failed");
    StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// The internal dispatch endpoint is owned by `cluster-provisioner`'s
/// dispatcher contract (§4.4) but served here since it shares this
/// process's HTTP listener; kept separate from the public router so the
/// internal-auth header check stays out of tenant-facing request paths.
pub fn internal_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/internal/namespace/spawn", post(internal_spawn))
        .with_state(state)
}

const INTERNAL_AUTH_HEADER: &str = "x-orama-internal-auth";
const INTERNAL_AUTH_VALUE: &str = "namespace-coordination";

#[derive(Debug, Serialize)]
struct SpawnResponse {
    success: bool,
    error: Option<String>,
    pid: Option<u32>,
}

async fn internal_spawn(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(envelope): Json<cluster_provisioner::DispatchEnvelope>,
) -> Result<Json<SpawnResponse>, StatusCode> {
    let auth_ok = headers
        .get(INTERNAL_AUTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == INTERNAL_AUTH_VALUE)
        .unwrap_or(false);
    if !auth_ok {
        return Err(StatusCode::UNAUTHORIZED);
    }

    match state.manager.dispatcher().local().handle_envelope(&envelope).await {
        Ok(pid) => Ok(Json(SpawnResponse {
            success: true,
            error: None,
            pid: Some(pid),
        })),
        Err(e) => Ok(Json(SpawnResponse {
            success: false,
            error: Some(e.to_string()),
            pid: None,
        })),
    }
}
