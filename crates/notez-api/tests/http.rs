use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use notez_api::{AppStateInner, router};
use notez_db::Database;
use notez_types::api::Claims;
use notez_types::models::{
    Delivery, Identity, MemberPermissions, Message, MessageKind, NOTIFICATION_TTL_DAYS,
    Notification, NotificationKind, Priority, Role,
};

const SECRET: &str = "api-test-secret";

struct Fixture {
    db: Arc<Database>,
    app: Router,
    group: Uuid,
    alice: Identity,
    bob: Identity,
}

fn fixture() -> Fixture {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let alice = user(&db, "alice");
    let bob = user(&db, "bob");
    let group = Uuid::new_v4();
    db.create_group(group, "chem", alice.user_id).unwrap();

    let app = router(AppStateInner::new(db.clone(), SECRET));
    Fixture {
        db,
        app,
        group,
        alice,
        bob,
    }
}

fn user(db: &Database, name: &str) -> Identity {
    let id = Uuid::new_v4();
    db.create_user(id, name).unwrap();
    Identity {
        user_id: id,
        username: name.into(),
    }
}

fn token(identity: &Identity) -> String {
    let claims = Claims {
        sub: identity.user_id,
        username: identity.username.clone(),
        exp: (Utc::now().timestamp() + 3600) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn notification(recipient: Uuid, group: Option<Uuid>, title: &str) -> Notification {
    let now = Utc::now();
    Notification {
        id: Uuid::new_v4(),
        recipient_id: recipient,
        sender_id: None,
        title: title.into(),
        body: String::new(),
        kind: NotificationKind::System,
        priority: Priority::Normal,
        group_id: group,
        related: None,
        is_read: false,
        read_at: None,
        is_archived: false,
        archived_at: None,
        delivery: Delivery::default(),
        scheduled_for: now,
        expires_at: now + Duration::days(NOTIFICATION_TTL_DAYS),
        created_at: now,
    }
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    as_user: Option<&Identity>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(identity) = as_user {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token(identity)));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_requires_bearer_token() {
    let f = fixture();
    let (status, _) = call(&f.app, Method::GET, "/notifications", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/notifications")
        .header(header::AUTHORIZATION, "Bearer not-a-jwt")
        .body(Body::empty())
        .unwrap();
    let response = f.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    f.db.set_user_active(f.bob.user_id, false).unwrap();
    let (status, _) = call(&f.app, Method::GET, "/notifications", Some(&f.bob), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_history_and_search_need_membership() {
    let f = fixture();
    for text in ["titration lab tomorrow", "bring goggles", "titration titration"] {
        let message = Message::new(f.group, &f.alice, text.into(), MessageKind::Text);
        f.db.insert_message(&message).unwrap();
    }

    let uri = format!("/groups/{}/messages", f.group);
    let (status, _) = call(&f.app, Method::GET, &uri, Some(&f.bob), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, page) = call(&f.app, Method::GET, &uri, Some(&f.alice), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["count"], 3);
    assert_eq!(page["messages"][0]["content"], "titration lab tomorrow");

    let (status, page) = call(
        &f.app,
        Method::GET,
        &format!("{}?limit=1", uri),
        Some(&f.alice),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["messages"][0]["content"], "titration titration");

    let search = format!("/groups/{}/messages/search?q=Titration", f.group);
    let (status, page) = call(&f.app, Method::GET, &search, Some(&f.alice), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["count"], 2);
    assert_eq!(page["messages"][0]["content"], "titration titration");

    let empty = format!("/groups/{}/messages/search?q=%20", f.group);
    let (status, _) = call(&f.app, Method::GET, &empty, Some(&f.alice), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    f.db.add_member(f.group, f.bob.user_id, Role::Member, &MemberPermissions::default())
        .unwrap();
    let (status, _) = call(&f.app, Method::GET, &search, Some(&f.bob), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_notification_lifecycle() {
    let f = fixture();
    let first = notification(f.bob.user_id, Some(f.group), "first");
    let second = notification(f.bob.user_id, None, "second");
    let foreign = notification(f.alice.user_id, Some(f.group), "not bob's");
    for n in [&first, &second, &foreign] {
        f.db.insert_notification(n).unwrap();
    }

    let (status, body) =
        call(&f.app, Method::GET, "/notifications/unread-count", Some(&f.bob), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["unread_count"], 2);

    // Other users' rows are invisible.
    let (status, _) = call(
        &f.app,
        Method::GET,
        &format!("/notifications/{}", foreign.id),
        Some(&f.bob),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(
        &f.app,
        Method::POST,
        &format!("/notifications/{}/read", first.id),
        Some(&f.bob),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_read"], true);

    let (status, body) = call(
        &f.app,
        Method::POST,
        &format!("/notifications/{}/archive", second.id),
        Some(&f.bob),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_archived"], true);

    let (_, page) = call(&f.app, Method::GET, "/notifications", Some(&f.bob), None).await;
    assert_eq!(page["count"], 1);
    let (_, page) = call(
        &f.app,
        Method::GET,
        "/notifications?include_archived=true",
        Some(&f.bob),
        None,
    )
    .await;
    assert_eq!(page["count"], 2);

    let (status, _) = call(
        &f.app,
        Method::DELETE,
        &format!("/notifications/{}", first.id),
        Some(&f.bob),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(
        &f.app,
        Method::DELETE,
        &format!("/notifications/{}", first.id),
        Some(&f.bob),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_mark_all_read_is_scoped_to_caller() {
    let f = fixture();
    let other_group = Uuid::new_v4();
    for (recipient, group) in [
        (f.bob.user_id, Some(f.group)),
        (f.bob.user_id, Some(other_group)),
        (f.alice.user_id, Some(f.group)),
    ] {
        f.db.insert_notification(&notification(recipient, group, "x"))
            .unwrap();
    }

    let (status, body) = call(
        &f.app,
        Method::POST,
        "/notifications/read-all",
        Some(&f.bob),
        Some(json!({ "group_id": f.group })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["updated"], 1);

    let (status, body) =
        call(&f.app, Method::POST, "/notifications/read-all", Some(&f.bob), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["updated"], 1);

    assert_eq!(f.db.unread_count(f.bob.user_id, None).unwrap(), 0);
    assert_eq!(f.db.unread_count(f.alice.user_id, None).unwrap(), 1);

    let (status, _) = call(
        &f.app,
        Method::POST,
        "/notifications/read-all",
        Some(&f.bob),
        Some(json!({ "unexpected": true })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_bulk_actions() {
    let f = fixture();
    let mine: Vec<Notification> = (0..3)
        .map(|i| notification(f.bob.user_id, None, &format!("n{}", i)))
        .collect();
    let theirs = notification(f.alice.user_id, None, "alice");
    for n in mine.iter().chain([&theirs]) {
        f.db.insert_notification(n).unwrap();
    }

    let ids: Vec<Uuid> = mine.iter().map(|n| n.id).chain([theirs.id]).collect();
    let (status, body) = call(
        &f.app,
        Method::POST,
        "/notifications/bulk",
        Some(&f.bob),
        Some(json!({ "notification_ids": ids, "action": "delete" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["updated"], 3);
    assert!(f.db.notification(f.alice.user_id, theirs.id).unwrap().is_some());

    let too_many: Vec<Uuid> = (0..101).map(|_| Uuid::new_v4()).collect();
    let (status, _) = call(
        &f.app,
        Method::POST,
        "/notifications/bulk",
        Some(&f.bob),
        Some(json!({ "notification_ids": too_many, "action": "read" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_group_and_notification_stats() {
    let f = fixture();
    let parent = Message::new(f.group, &f.alice, "kinetics".into(), MessageKind::Text);
    f.db.insert_message(&parent).unwrap();
    let mut reply = Message::new(f.group, &f.alice, "rate laws".into(), MessageKind::Text);
    reply.thread_id = Some(parent.id);
    f.db.insert_reply(&reply).unwrap();

    let uri = format!("/groups/{}/stats", f.group);
    let (status, _) = call(&f.app, Method::GET, &uri, Some(&f.bob), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(&f.app, Method::GET, &uri, Some(&f.alice), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_messages"], 2);
    assert_eq!(body["total_replies"], 1);
    assert_eq!(body["by_kind"]["text"], 2);

    let mut read = notification(f.bob.user_id, None, "seen");
    read.is_read = true;
    for n in [
        &read,
        &notification(f.bob.user_id, Some(f.group), "fresh"),
        &notification(f.alice.user_id, None, "not bob's"),
    ] {
        f.db.insert_notification(n).unwrap();
    }

    let (status, body) =
        call(&f.app, Method::GET, "/notifications/stats", Some(&f.bob), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["unread"], 1);
    assert_eq!(body["by_kind"]["system"], 2);
    assert_eq!(body["by_priority"]["normal"], 2);
}
