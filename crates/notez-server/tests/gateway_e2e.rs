use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tower::ServiceExt;
use uuid::Uuid;

use notez_api::AppStateInner;
use notez_db::Database;
use notez_gateway::{Gateway, GatewayConfig, Services};
use notez_types::api::Claims;
use notez_types::models::{MemberPermissions, Role};

const SECRET: &str = "e2e-secret";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    addr: SocketAddr,
    db: Arc<Database>,
    app: axum::Router,
}

fn build() -> Server {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let gateway = Gateway::new(
        Services::from_database(db.clone()),
        SECRET,
        GatewayConfig {
            backlog_size: 10,
            assistant_delay: Duration::from_millis(50),
        },
    );
    let app = notez_server::router(AppStateInner::new(db.clone(), SECRET), gateway);
    Server {
        addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        db,
        app,
    }
}

async fn serve(mut server: Server) -> Server {
    let listener = tokio::net::TcpListener::bind(server.addr).await.unwrap();
    server.addr = listener.local_addr().unwrap();
    let app = server.app.clone();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    server
}

fn token(user_id: Uuid, username: &str) -> String {
    let claims = Claims {
        sub: user_id,
        username: username.into(),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

async fn recv_event(client: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(3), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn send_action(client: &mut Client, action: Value) {
    client
        .send(Message::Text(action.to_string().into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_health_and_rest_auth() {
    let server = build();

    let response = server
        .app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = server
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/notifications")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_upgrade_rejects_bad_tokens() {
    let server = serve(build()).await;

    for url in [
        format!("ws://{}/gateway", server.addr),
        format!("ws://{}/gateway?token=garbage", server.addr),
        format!(
            "ws://{}/gateway?token={}",
            server.addr,
            token(Uuid::new_v4(), "ghost")
        ),
    ] {
        match connect_async(url.as_str()).await {
            Err(WsError::Http(response)) => {
                assert_eq!(response.status(), StatusCode::UNAUTHORIZED.as_u16())
            }
            Err(other) => panic!("unexpected error for {}: {}", url, other),
            Ok(_) => panic!("upgrade should have been refused for {}", url),
        }
    }
}

#[tokio::test]
async fn test_chat_round_trip_over_websocket() {
    let server = serve(build()).await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    server.db.create_user(alice, "alice").unwrap();
    server.db.create_user(bob, "bob").unwrap();
    let group = Uuid::new_v4();
    server.db.create_group(group, "physics", alice).unwrap();
    server
        .db
        .add_member(group, bob, Role::Member, &MemberPermissions::default())
        .unwrap();

    // alice authenticates with a query token, bob with a header.
    let url = format!("ws://{}/gateway?token={}", server.addr, token(alice, "alice"));
    let (mut a, _) = connect_async(url.as_str()).await.unwrap();

    let mut request = format!("ws://{}/gateway", server.addr)
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&format!("Bearer {}", token(bob, "bob"))).unwrap(),
    );
    let (mut b, _) = connect_async(request).await.unwrap();

    let ready = recv_event(&mut a).await;
    assert_eq!(ready["event"], "ready");
    assert_eq!(ready["data"]["username"], "alice");
    assert_eq!(recv_event(&mut b).await["event"], "ready");

    for client in [&mut a, &mut b] {
        send_action(client, json!({ "action": "join_room", "data": { "group_id": group } })).await;
        let backlog = recv_event(client).await;
        assert_eq!(backlog["event"], "recent_messages");
        assert_eq!(backlog["data"]["messages"], json!([]));
    }
    assert_eq!(recv_event(&mut a).await["event"], "user_joined");

    send_action(
        &mut a,
        json!({ "action": "send_message", "data": { "group_id": group, "content": "hi @bob" } }),
    )
    .await;
    let created = recv_event(&mut b).await;
    assert_eq!(created["event"], "new_message");
    assert_eq!(created["data"]["message"]["content"], "hi @bob");
    assert_eq!(created["data"]["message"]["mentions"], json!([bob]));

    let pushed = recv_event(&mut b).await;
    assert_eq!(pushed["event"], "notification");
    assert_eq!(pushed["data"]["notification"]["kind"], "chat_mention");

    // A malformed frame gets a scoped error and the socket stays usable.
    b.send(Message::Text("{not json".into())).await.unwrap();
    let error = recv_event(&mut b).await;
    assert_eq!(error["event"], "error");
    assert_eq!(error["data"]["action"], "unknown");
    assert_eq!(error["data"]["kind"], "invalid_request");

    send_action(&mut b, json!({ "action": "typing_start", "data": { "group_id": group } })).await;
    let typing = loop {
        let event = recv_event(&mut a).await;
        if event["event"] != "new_message" {
            break event;
        }
    };
    assert_eq!(typing["event"], "user_typing");
    assert_eq!(typing["data"]["username"], "bob");

    b.close(None).await.unwrap();
    let left = recv_event(&mut a).await;
    assert_eq!(left["event"], "user_left");
    assert_eq!(left["data"]["user_id"], json!(bob));
}
