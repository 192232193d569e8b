//! Axum HTTP server for an MPC node
//!
//! Partner routes (`/mpc/round`, `/sign`, `/confirmed`) carry the protocol
//! traffic; `/admin/*` routes start runs and confirmation requests.

use crate::confirmation::ConfirmationOutcome;
use crate::error::NodeError;
use crate::mpc::PeerHandler;
use crate::node::Node;
use crate::types::{
    ConfirmRequest, ConfirmedAnnouncement, DkgStartRequest, ErrorResponse, HealthResponse,
    KeyResponse, NodeInfo, NonceBatchResponse, NonceBatchStartRequest, PartialSignature,
    ReshareStartRequest, RoundRequest, RoundResponse, SignRequest,
};
use axum::http::{header, Method};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

/// Create the router with all endpoints
pub fn create_router(node: Arc<Node>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(
            node.config()
                .node
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect::<Vec<_>>(),
        )
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        // Health & info
        .route("/health", get(health_handler))
        .route("/info", get(info_handler))
        // Partner traffic
        .route("/mpc/round", post(round_handler))
        .route("/sign", post(sign_handler))
        .route("/confirmed", post(confirmed_handler))
        // Admin
        .route("/admin/dkg", post(dkg_handler))
        .route("/admin/reshare", post(reshare_handler))
        .route("/admin/nonce-batch", post(nonce_batch_handler))
        .route("/admin/confirm", post(confirm_handler))
        .with_state(node)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health_handler(State(node): State<Arc<Node>>) -> Json<HealthResponse> {
    Json(node.health())
}

async fn info_handler(State(node): State<Arc<Node>>) -> Json<NodeInfo> {
    Json(node.info())
}

/// A partner asks for our output of one round
async fn round_handler(
    State(node): State<Arc<Node>>,
    Json(request): Json<RoundRequest>,
) -> ApiResult<RoundResponse> {
    node.handle_round_request(request)
        .await
        .map(Json)
        .map_err(node_error)
}

/// Partial signature for a request the orchestrator selected us for
async fn sign_handler(
    State(node): State<Arc<Node>>,
    Json(request): Json<SignRequest>,
) -> ApiResult<PartialSignature> {
    node.handle_sign_request(request)
        .await
        .map(Json)
        .map_err(node_error)
}

async fn confirmed_handler(
    State(node): State<Arc<Node>>,
    Json(announcement): Json<ConfirmedAnnouncement>,
) -> ApiResult<Value> {
    let req_id = announcement.req_id.clone();
    node.handle_confirmed(announcement)
        .await
        .map_err(node_error)?;
    Ok(Json(json!({ "req_id": req_id, "accepted": true })))
}

async fn dkg_handler(
    State(node): State<Arc<Node>>,
    Json(request): Json<DkgStartRequest>,
) -> ApiResult<KeyResponse> {
    node.run_dkg(request).await.map(Json).map_err(node_error)
}

async fn reshare_handler(
    State(node): State<Arc<Node>>,
    Json(request): Json<ReshareStartRequest>,
) -> ApiResult<KeyResponse> {
    node.run_reshare(request).await.map(Json).map_err(node_error)
}

async fn nonce_batch_handler(
    State(node): State<Arc<Node>>,
    Json(request): Json<NonceBatchStartRequest>,
) -> ApiResult<NonceBatchResponse> {
    node.run_nonce_batch(request)
        .await
        .map(Json)
        .map_err(node_error)
}

/// Unconfirmed outcomes (timeouts) are still a 200; the body says so
async fn confirm_handler(
    State(node): State<Arc<Node>>,
    Json(request): Json<ConfirmRequest>,
) -> ApiResult<ConfirmationOutcome> {
    node.confirm(request).await.map(Json).map_err(node_error)
}

/// HTTP status for a node error
pub fn status_for(err: &NodeError) -> StatusCode {
    match err {
        NodeError::Verification(_) | NodeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        NodeError::SchemaValidation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        NodeError::ReplayOrMisuse(_) => StatusCode::CONFLICT,
        NodeError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        NodeError::NotQualified(_) => StatusCode::FORBIDDEN,
        NodeError::InsufficientPartners { .. } => StatusCode::SERVICE_UNAVAILABLE,
        NodeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        NodeError::Network(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert a node error to an HTTP response
fn node_error(err: NodeError) -> (StatusCode, Json<ErrorResponse>) {
    let status = status_for(&err);
    if status.is_server_error() {
        tracing::warn!(code = err.error_code(), error = %err, "Request failed");
    } else {
        tracing::debug!(code = err.error_code(), error = %err, "Request refused");
    }
    (status, Json(ErrorResponse::from(&err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectionGraph;
    use crate::node::MemoryCluster;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn create_test_app() -> Router {
        let cluster = MemoryCluster::new(2, &[1, 2, 3], |config| {
            config.mpc.round_timeout_secs = 1;
            config.mpc.run_timeout_secs = 2;
        })
        .unwrap();
        create_router(cluster.node(1).unwrap().clone())
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_test_app();

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["node_id"], 1);
        assert_eq!(body["key_loaded"], false);
    }

    #[tokio::test]
    async fn test_info_without_key() {
        let app = create_test_app();

        let request = Request::builder().uri("/info").body(Body::empty()).unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["partners"], json!([1, 2, 3]));
        assert!(body.get("public_key").is_none());
        assert_eq!(body["nonces_left"], 0);
    }

    #[tokio::test]
    async fn test_confirm_without_key_is_not_found() {
        let app = create_test_app();

        let response = app
            .oneshot(post_json("/admin/confirm", json!({ "app": "echo", "params": {} })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_dkg_threshold_out_of_range() {
        let app = create_test_app();

        let response = app
            .oneshot(post_json("/admin/dkg", json!({ "t": 5 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_round_request_for_unknown_mpc() {
        let app = create_test_app();

        let response = app
            .oneshot(post_json(
                "/mpc/round",
                json!({ "mpc_id": "nobody-started-this", "round": 0, "from": 2 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_sign_request_is_rejected() {
        let app = create_test_app();

        let response = app
            .oneshot(post_json("/sign", json!({ "req_id": "r1" })))
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&NodeError::ReplayOrMisuse("nonce".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&NodeError::InsufficientPartners {
                threshold: 3,
                qualified: 1,
                graph: RejectionGraph::default(),
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&NodeError::Timeout("run".into())),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&NodeError::crypto("bad point")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
