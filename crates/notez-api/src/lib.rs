pub mod messages;
pub mod middleware;
pub mod notifications;
pub mod state;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

pub use state::{AppState, AppStateInner};

/// Every bearer-authenticated HTTP route.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/groups/{group_id}/messages", get(messages::history))
        .route("/groups/{group_id}/messages/search", get(messages::search))
        .route("/groups/{group_id}/stats", get(messages::stats))
        .route("/notifications", get(notifications::list))
        .route("/notifications/unread-count", get(notifications::unread_count))
        .route("/notifications/stats", get(notifications::stats))
        .route("/notifications/read-all", post(notifications::mark_all_read))
        .route("/notifications/bulk", post(notifications::bulk))
        .route(
            "/notifications/{notification_id}",
            get(notifications::get_one).delete(notifications::remove),
        )
        .route("/notifications/{notification_id}/read", post(notifications::mark_read))
        .route("/notifications/{notification_id}/archive", post(notifications::archive))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ))
        .with_state(state)
}
