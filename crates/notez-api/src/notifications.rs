use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use notez_types::api::{
    BulkNotificationRequest, BulkUpdateResponse, Claims, MarkAllReadRequest, NotificationPage,
    UnreadCountResponse,
};
use notez_types::models::{Notification, NotificationMatch, NotificationPatch, NotificationQuery};

use crate::state::AppState;

/// Upper bound on ids accepted by one bulk call.
pub const MAX_BULK_IDS: usize = 100;

#[derive(Debug, Deserialize)]
pub struct UnreadCountQuery {
    pub group_id: Option<Uuid>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<NotificationQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let recipient = claims.sub;
    let notifications = state
        .db_call("notification list", move |db| {
            db.list_notifications(recipient, &query)
        })
        .await?;

    Ok(Json(NotificationPage {
        count: notifications.len(),
        notifications,
    }))
}

pub async fn unread_count(
    State(state): State<AppState>,
    Query(query): Query<UnreadCountQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let recipient = claims.sub;
    let unread_count = state
        .db_call("unread count", move |db| {
            db.unread_count(recipient, query.group_id)
        })
        .await?;
    Ok(Json(UnreadCountResponse { unread_count }))
}

pub async fn stats(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let recipient = claims.sub;
    let stats = state
        .db_call("notification stats", move |db| db.notification_stats(recipient))
        .await?;
    Ok(Json(stats))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(notification_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let recipient = claims.sub;
    state
        .db_call("notification lookup", move |db| {
            db.notification(recipient, notification_id)
        })
        .await?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// Apply `patch` to one of the caller's notifications and return it afterwards.
async fn patch_one(
    state: &AppState,
    recipient: Uuid,
    notification_id: Uuid,
    patch: NotificationPatch,
) -> Result<Json<Notification>, StatusCode> {
    let updated = state
        .db_call("notification update", move |db| {
            let selection = NotificationMatch::ids(recipient, vec![notification_id]);
            if db.bulk_update_notifications(&selection, patch, Utc::now())? == 0 {
                return Ok(None);
            }
            db.notification(recipient, notification_id)
        })
        .await?;
    updated.map(Json).ok_or(StatusCode::NOT_FOUND)
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(notification_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Notification>, StatusCode> {
    patch_one(&state, claims.sub, notification_id, NotificationPatch::Read).await
}

pub async fn archive(
    State(state): State<AppState>,
    Path(notification_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Notification>, StatusCode> {
    patch_one(&state, claims.sub, notification_id, NotificationPatch::Archive).await
}

pub async fn remove(
    State(state): State<AppState>,
    Path(notification_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<StatusCode, StatusCode> {
    let recipient = claims.sub;
    let removed = state
        .db_call("notification delete", move |db| {
            db.bulk_update_notifications(
                &NotificationMatch::ids(recipient, vec![notification_id]),
                NotificationPatch::Delete,
                Utc::now(),
            )
        })
        .await?;
    if removed == 0 {
        Err(StatusCode::NOT_FOUND)
    } else {
        Ok(StatusCode::NO_CONTENT)
    }
}

/// Mark every unread, non-archived notification read. The body is optional
/// and may scope the update to one group.
pub async fn mark_all_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    body: Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    let req: MarkAllReadRequest = if body.iter().all(u8::is_ascii_whitespace) {
        MarkAllReadRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            debug!("Bad read-all body: {}", e);
            StatusCode::BAD_REQUEST
        })?
    };

    let recipient = claims.sub;
    let updated = state
        .db_call("mark all read", move |db| {
            db.bulk_update_notifications(
                &NotificationMatch::unread(recipient, req.group_id),
                NotificationPatch::Read,
                Utc::now(),
            )
        })
        .await?;
    info!("{} marked {} notifications read", claims.username, updated);
    Ok(Json(BulkUpdateResponse { updated }))
}

pub async fn bulk(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<BulkNotificationRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.notification_ids.len() > MAX_BULK_IDS {
        return Err(StatusCode::BAD_REQUEST);
    }
    if req.notification_ids.is_empty() {
        return Ok(Json(BulkUpdateResponse { updated: 0 }));
    }

    let recipient = claims.sub;
    let updated = state
        .db_call("bulk notification update", move |db| {
            db.bulk_update_notifications(
                &NotificationMatch::ids(recipient, req.notification_ids),
                req.action,
                Utc::now(),
            )
        })
        .await?;
    Ok(Json(BulkUpdateResponse { updated }))
}
