use axum::body::Body;
use axum::http::{Request, StatusCode};
use colabri_sync::db::{MemoryContentStore, MemoryUpdateStoreProvider};
use colabri_sync::routes::create_app;
use colabri_sync::ws::{HubSettings, SyncHub};
use colabri_sync::AppState;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const SECRET: &str = "test-secret";

fn app(secret: Option<&str>) -> axum::Router {
    let hub = SyncHub::new(
        Arc::new(MemoryContentStore::new()),
        Arc::new(MemoryUpdateStoreProvider::new()),
        HubSettings::default(),
    );
    create_app(AppState::new(Arc::new(hub), secret), None)
}

fn token(permissions: Value) -> String {
    let claims = json!({ "sub": "tester", "exp": 4_102_444_800u64, "permissions": permissions });
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

async fn get(app: axum::Router, uri: &str, bearer: Option<&str>) -> (StatusCode, Value) {
    let mut request = Request::builder().uri(uri);
    if let Some(token) = bearer {
        request = request.header("authorization", format!("Bearer {}", token));
    }
    let response = app.oneshot(request.body(Body::empty()).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn health_is_public() {
    let (status, body) = get(app(Some(SECRET)), "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, _) = get(app(Some(SECRET)), "/api/ready", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn diagnostics_requires_a_valid_token() {
    let (status, _) = get(app(Some(SECRET)), "/api/v1/diagnostics", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = get(app(Some(SECRET)), "/api/v1/diagnostics", Some("not-a-jwt")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn diagnostics_requires_read_permission() {
    let limited = token(json!({ "yjs": ["read", "write"] }));
    let (status, body) = get(app(Some(SECRET)), "/api/v1/diagnostics", Some(&limited)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], 403);

    let allowed = token(json!({ "diagnostics": ["read"] }));
    let (status, body) = get(app(Some(SECRET)), "/api/v1/diagnostics", Some(&allowed)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["n_rooms"], 0);
    assert_eq!(body["n_conn"], 0);
}

#[tokio::test]
async fn without_secret_everything_is_allowed() {
    let (status, body) = get(app(None), "/api/v1/diagnostics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["n_doc_rooms"], 0);
}

#[tokio::test]
async fn rooms_require_a_room_grant() {
    let diagnostics_only = token(json!({ "diagnostics": ["read"] }));
    let uri = format!("/api/yjs/presence-1?token={}", diagnostics_only);
    let (status, body) = get(app(Some(SECRET)), &uri, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], 403);

    // With a grant the request gets past auth and only fails for not being an upgrade.
    let reader = token(json!({ "yjs": ["read"] }));
    let uri = format!("/api/yjs/presence-1?token={}", reader);
    let (status, _) = get(app(Some(SECRET)), &uri, None).await;
    assert_ne!(status, StatusCode::FORBIDDEN);
    assert_ne!(status, StatusCode::UNAUTHORIZED);
    assert!(status.is_client_error());
}
