//! tiernet-api — REST API for tiernet tiers.
//!
//! Every route lives under `/api/net`. Responses use the
//! `{success, data, error}` envelope.
//!
//! # Root tier routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/service/{name}/instances` | Job record by name (child cluster) |
//! | GET | `/service/ip/{address}/instances` | Job record by address (child cluster) |
//! | POST | `/instance/deploy_status` | Network status forwarded by a cluster |
//! | GET | `/subnet` | Hand out a worker subnet pair |
//! | DELETE | `/subnet` | Return a worker subnet pair |
//! | DELETE | `/interest/{job_name}` | Withdraw the caller's interest |
//! | POST | `/cluster` | Register a cluster |
//! | POST | `/service/deploy` | Register a service and its RR addresses |
//! | POST | `/instance/deploy` | Add instances to a service |
//! | POST | `/instance/undeploy` | Remove one instance |
//! | GET | `/gateway` | List gateways |
//! | POST | `/gateway/deploy` | Register a gateway |
//! | PUT | `/gateway/{gateway_id}/namespace` | Gateway namespace addresses |
//! | PUT | `/gateway/{gateway_id}/service` | Services exposed by a gateway |
//!
//! Child-facing routes identify the calling cluster by the
//! `x-tiernet-cluster` header.
//!
//! # Cluster tier routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/job/update` | Change announced by the parent tier |
//! | POST | `/nodes/{client}/requests` | Request from a worker |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post, put};
use tiernet_discovery::Tier;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub tier: Arc<Tier>,
}

/// Router of the root tier.
pub fn root_router(tier: Arc<Tier>) -> Router {
    let state = ApiState { tier };

    let api_routes = Router::new()
        .route("/service/{name}/instances", get(handlers::get_service_by_name))
        .route("/service/ip/{address}/instances", get(handlers::get_service_by_address))
        .route("/service/deploy", post(handlers::deploy_service))
        .route("/instance/deploy_status", post(handlers::deploy_status))
        .route("/instance/deploy", post(handlers::deploy_instances))
        .route("/instance/undeploy", post(handlers::undeploy_instance))
        .route("/subnet", get(handlers::get_subnet).delete(handlers::delete_subnet))
        .route("/interest/{job_name}", delete(handlers::delete_interest))
        .route("/cluster", post(handlers::register_cluster))
        .route("/gateway", get(handlers::list_gateways))
        .route("/gateway/deploy", post(handlers::deploy_gateway))
        .route("/gateway/{gateway_id}/namespace", put(handlers::update_gateway_namespace))
        .route("/gateway/{gateway_id}/service", put(handlers::update_gateway_services))
        .with_state(state);

    Router::new().nest("/api/net", api_routes)
}

/// Router of a cluster tier.
pub fn cluster_router(tier: Arc<Tier>) -> Router {
    let state = ApiState { tier };

    let api_routes = Router::new()
        .route("/job/update", post(handlers::job_update))
        .route("/nodes/{client}/requests", post(handlers::child_request))
        .with_state(state);

    Router::new().nest("/api/net", api_routes)
}
