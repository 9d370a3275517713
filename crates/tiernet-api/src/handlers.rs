//! REST API handlers.
//!
//! Each handler maps onto one operation of the hosting [`Tier`] and returns
//! JSON responses.
//!
//! [`Tier`]: tiernet_discovery::Tier

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use tiernet_discovery::{
    CLUSTER_HEADER, ChildRequest, ClusterRegistration, DeployStatusReport, DiscoveryError,
    GatewayDeployment, GatewayNamespace, JobUpdate, Selector, ServiceDescriptor,
    SubnetAssignment,
};
use tiernet_ipam::IpamError;
use tiernet_state::ExposedService;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// HTTP status for a failed tier operation.
fn status_for(error: &DiscoveryError) -> StatusCode {
    match error {
        DiscoveryError::InvalidArguments(_) => StatusCode::BAD_REQUEST,
        DiscoveryError::JobNotFound(_)
        | DiscoveryError::InstanceNotFound { .. }
        | DiscoveryError::GatewayNotFound(_) => StatusCode::NOT_FOUND,
        DiscoveryError::ConflictingReport { .. } => StatusCode::CONFLICT,
        DiscoveryError::EscalationFailed(_)
        | DiscoveryError::ResolutionFailed(_)
        | DiscoveryError::Notify(_) => StatusCode::BAD_GATEWAY,
        DiscoveryError::Ipam(e) => match e {
            IpamError::AddressSpaceExhausted(_) => StatusCode::INSUFFICIENT_STORAGE,
            IpamError::AddressConflict { .. }
            | IpamError::AlreadyReleased { .. }
            | IpamError::ReleaseAheadOfNext { .. } => StatusCode::CONFLICT,
            IpamError::MalformedAddress(_)
            | IpamError::AddressOutOfRange { .. }
            | IpamError::MisalignedAddress { .. }
            | IpamError::InvalidArguments(_) => StatusCode::BAD_REQUEST,
            IpamError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
        },
        DiscoveryError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(error: DiscoveryError) -> Response {
    error_response(&error.to_string(), status_for(&error)).into_response()
}

/// The registered cluster named by the identity header.
fn calling_cluster(state: &ApiState, headers: &HeaderMap) -> Result<String, Response> {
    let Some(cluster_id) = headers
        .get(CLUSTER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    else {
        return Err(
            error_response(&format!("missing {CLUSTER_HEADER} header"), StatusCode::BAD_REQUEST)
                .into_response(),
        );
    };
    state.tier.require_cluster(cluster_id).map_err(failure)?;
    Ok(cluster_id.to_string())
}

// ── Resolution ─────────────────────────────────────────────────

async fn lookup(state: ApiState, headers: HeaderMap, selector: Selector) -> Response {
    let cluster_id = match calling_cluster(&state, &headers) {
        Ok(cluster_id) => cluster_id,
        Err(response) => return response,
    };
    match state.tier.child_lookup(&cluster_id, &selector).await {
        Ok(Some(job)) => ApiResponse::ok(job).into_response(),
        Ok(None) => error_response("job not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => failure(e),
    }
}

/// GET /api/net/service/{name}/instances
pub async fn get_service_by_name(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> impl IntoResponse {
    lookup(state, headers, Selector::Name(name)).await
}

/// GET /api/net/service/ip/{address}/instances
pub async fn get_service_by_address(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(address): Path<String>,
) -> impl IntoResponse {
    lookup(state, headers, Selector::Address(address)).await
}

// ── Deployment status ──────────────────────────────────────────

/// POST /api/net/instance/deploy_status
pub async fn deploy_status(
    State(state): State<ApiState>,
    Json(report): Json<DeployStatusReport>,
) -> impl IntoResponse {
    match state.tier.relay().apply_deploy_status(&report).await {
        Ok(applied) => ApiResponse::ok(serde_json::json!({ "applied": applied })).into_response(),
        Err(e) => failure(e),
    }
}

/// POST /api/net/job/update
pub async fn job_update(
    State(state): State<ApiState>,
    Json(update): Json<JobUpdate>,
) -> impl IntoResponse {
    match state.tier.relay().apply_upstream_update(&update).await {
        Ok(relevant) => ApiResponse::ok(serde_json::json!({ "relevant": relevant })).into_response(),
        Err(e) => failure(e),
    }
}

// ── Subnets ────────────────────────────────────────────────────

/// GET /api/net/subnet
pub async fn get_subnet(State(state): State<ApiState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(response) = calling_cluster(&state, &headers) {
        return response;
    }
    match state.tier.request_subnet().await {
        Ok(subnet) => ApiResponse::ok(subnet).into_response(),
        Err(e) => failure(e),
    }
}

/// DELETE /api/net/subnet
pub async fn delete_subnet(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(subnet): Json<SubnetAssignment>,
) -> impl IntoResponse {
    if let Err(response) = calling_cluster(&state, &headers) {
        return response;
    }
    match state.tier.release_subnet(&subnet).await {
        Ok(()) => ApiResponse::ok("released").into_response(),
        Err(e) => failure(e),
    }
}

// ── Interest ───────────────────────────────────────────────────

/// DELETE /api/net/interest/{job_name}
pub async fn delete_interest(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(job_name): Path<String>,
) -> impl IntoResponse {
    let cluster_id = match calling_cluster(&state, &headers) {
        Ok(cluster_id) => cluster_id,
        Err(response) => return response,
    };
    match state.tier.interests().remove_interest(&job_name, &cluster_id).await {
        Ok(change) => ApiResponse::ok(serde_json::json!({
            "job_name": job_name,
            "was_present": change.was_present,
            "remaining": change.remaining,
        }))
        .into_response(),
        Err(e) => failure(e),
    }
}

// ── Clusters ───────────────────────────────────────────────────

/// POST /api/net/cluster
pub async fn register_cluster(
    State(state): State<ApiState>,
    Json(registration): Json<ClusterRegistration>,
) -> impl IntoResponse {
    match state.tier.register_cluster(&registration) {
        Ok(cluster) => (StatusCode::CREATED, ApiResponse::ok(cluster)).into_response(),
        Err(e) => failure(e),
    }
}

// ── Jobs and instances ─────────────────────────────────────────

/// Service registration body: the descriptor plus the scheduler's id.
#[derive(Deserialize)]
pub struct DeployServiceRequest {
    pub system_job_id: String,
    #[serde(flatten)]
    pub descriptor: ServiceDescriptor,
}

/// POST /api/net/service/deploy
pub async fn deploy_service(
    State(state): State<ApiState>,
    Json(req): Json<DeployServiceRequest>,
) -> impl IntoResponse {
    let registered = state
        .tier
        .registrar()
        .and_then(|registrar| registrar.register_job(&req.descriptor, &req.system_job_id));
    match registered {
        Ok(job) => (StatusCode::CREATED, ApiResponse::ok(job)).into_response(),
        Err(e) => failure(e),
    }
}

fn one() -> u32 {
    1
}

/// Instance scheduling body.
#[derive(Deserialize)]
pub struct DeployInstancesRequest {
    pub system_job_id: String,
    #[serde(default = "one")]
    pub replicas: u32,
    pub cluster_id: String,
}

/// POST /api/net/instance/deploy
pub async fn deploy_instances(
    State(state): State<ApiState>,
    Json(req): Json<DeployInstancesRequest>,
) -> impl IntoResponse {
    let added = state.tier.registrar().and_then(|registrar| {
        registrar.add_instances(&req.system_job_id, req.replicas, &req.cluster_id)
    });
    match added {
        Ok(instances) => (StatusCode::CREATED, ApiResponse::ok(instances)).into_response(),
        Err(e) => failure(e),
    }
}

/// Instance removal body.
#[derive(Deserialize)]
pub struct UndeployInstanceRequest {
    pub system_job_id: String,
    pub instance_number: u32,
}

/// POST /api/net/instance/undeploy
pub async fn undeploy_instance(
    State(state): State<ApiState>,
    Json(req): Json<UndeployInstanceRequest>,
) -> impl IntoResponse {
    let registrar = match state.tier.registrar() {
        Ok(registrar) => registrar,
        Err(e) => return failure(e),
    };
    match registrar
        .undeploy_instance(&req.system_job_id, req.instance_number)
        .await
    {
        Ok(outcome) => ApiResponse::ok(serde_json::json!({
            "job_name": outcome.job_name,
            "instance_number": outcome.removed.instance_number,
            "job_deleted": outcome.job_deleted,
            "notified": outcome.notified,
        }))
        .into_response(),
        Err(e) => failure(e),
    }
}

// ── Gateways ───────────────────────────────────────────────────

/// GET /api/net/gateway
pub async fn list_gateways(State(state): State<ApiState>) -> impl IntoResponse {
    match state.tier.gateways().and_then(|gateways| gateways.list()) {
        Ok(list) => ApiResponse::ok(list).into_response(),
        Err(e) => failure(e),
    }
}

/// POST /api/net/gateway/deploy
pub async fn deploy_gateway(
    State(state): State<ApiState>,
    Json(deployment): Json<GatewayDeployment>,
) -> impl IntoResponse {
    match state.tier.gateways().and_then(|gateways| gateways.deploy(&deployment)) {
        Ok(job) => (StatusCode::CREATED, ApiResponse::ok(job)).into_response(),
        Err(e) => failure(e),
    }
}

/// PUT /api/net/gateway/{gateway_id}/namespace
pub async fn update_gateway_namespace(
    State(state): State<ApiState>,
    Path(gateway_id): Path<String>,
    Json(namespace): Json<GatewayNamespace>,
) -> impl IntoResponse {
    let updated = state
        .tier
        .gateways()
        .and_then(|gateways| gateways.update_namespace(&gateway_id, &namespace));
    match updated {
        Ok(gateway) => ApiResponse::ok(gateway).into_response(),
        Err(e) => failure(e),
    }
}

/// Services exposed through a gateway.
#[derive(Deserialize)]
pub struct GatewayServicesRequest {
    #[serde(default)]
    pub services: Vec<ExposedService>,
}

/// PUT /api/net/gateway/{gateway_id}/service
pub async fn update_gateway_services(
    State(state): State<ApiState>,
    Path(gateway_id): Path<String>,
    Json(req): Json<GatewayServicesRequest>,
) -> impl IntoResponse {
    let updated = state
        .tier
        .gateways()
        .and_then(|gateways| gateways.update_services(&gateway_id, req.services));
    match updated {
        Ok(gateway) => ApiResponse::ok(gateway).into_response(),
        Err(e) => failure(e),
    }
}

// ── Child requests ─────────────────────────────────────────────

/// POST /api/net/nodes/{client}/requests
///
/// REST bridge for worker requests: the body is a `{kind, payload}` pair
/// where `kind` is the topic suffix.
pub async fn child_request(
    State(state): State<ApiState>,
    Path(client): Path<String>,
    Json(request): Json<ChildRequest>,
) -> impl IntoResponse {
    match state.tier.handle_child_request(&client, request).await {
        Ok(reply) => ApiResponse::ok(reply).into_response(),
        Err(e) => failure(e),
    }
}
