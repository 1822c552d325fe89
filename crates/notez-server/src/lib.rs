pub mod cleanup;
pub mod config;

use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use notez_api::AppState;
use notez_api::middleware::bearer_token;
use notez_gateway::connection::run_connection;
use notez_gateway::{Gateway, GatewayError};

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

/// The full HTTP surface: REST routes, the WebSocket upgrade and a health check.
pub fn router(app_state: AppState, gateway: Gateway) -> Router {
    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(gateway);

    Router::new()
        .route("/health", get(health))
        .merge(notez_api::router(app_state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Authenticate before upgrading so a bad token never creates connection state.
/// Browsers cannot set headers on a WebSocket, so `?token=` is accepted too.
async fn ws_upgrade(
    State(gateway): State<Gateway>,
    Query(query): Query<GatewayQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string)
        .or(query.token);
    let Some(token) = token else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    match gateway.authenticate(&token).await {
        Ok(identity) => ws
            .on_upgrade(move |socket| run_connection(socket, gateway, identity))
            .into_response(),
        Err(GatewayError::Unauthenticated) => StatusCode::UNAUTHORIZED.into_response(),
        Err(e) => {
            error!("Gateway authentication failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
