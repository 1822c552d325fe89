use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use notez_types::api::{Claims, MessagePage};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: u32,
    /// Page backwards: only messages created strictly before this instant.
    pub before: Option<DateTime<Utc>>,
    /// Replies to one parent message instead of the top-level timeline.
    pub thread: Option<Uuid>,
}

fn default_history_limit() -> u32 {
    50
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
    #[serde(default = "default_search_limit")]
    pub limit: u32,
    #[serde(default)]
    pub skip: u32,
}

fn default_search_limit() -> u32 {
    20
}

/// 403 unless the caller is an active member of the group.
async fn require_member(state: &AppState, group_id: Uuid, user_id: Uuid) -> Result<(), StatusCode> {
    let member = state
        .db_call("membership lookup", move |db| db.member(group_id, user_id))
        .await?;
    if member.is_some_and(|m| m.is_active()) {
        Ok(())
    } else {
        debug!("{} is not an active member of {}", user_id, group_id);
        Err(StatusCode::FORBIDDEN)
    }
}

pub async fn history(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    require_member(&state, group_id, claims.sub).await?;

    let messages = state
        .db_call("history query", move |db| {
            db.group_messages(group_id, query.limit, query.before, query.thread)
        })
        .await?;

    Ok(Json(MessagePage {
        count: messages.len(),
        messages,
    }))
}

pub async fn search(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Query(query): Query<SearchQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let q = query.q.trim().to_string();
    if q.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    require_member(&state, group_id, claims.sub).await?;

    let messages = state
        .db_call("message search", move |db| {
            db.search_messages(group_id, &q, query.limit, query.skip)
        })
        .await?;

    Ok(Json(MessagePage {
        count: messages.len(),
        messages,
    }))
}

pub async fn stats(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    require_member(&state, group_id, claims.sub).await?;
    let stats = state
        .db_call("message stats", move |db| db.message_stats(group_id))
        .await?;
    Ok(Json(stats))
}
