use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode};
use axum::{middleware, Json, Router};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use session_gate::comms::edge_gate::{authorize_request, EdgeGate, RoutePolicy};
use session_gate::config::RoutesConfig;
use session_gate::security::session_token::{
    AuthPhase, AuthoritySettings, NewSession, TokenAuthority,
};
use session_gate::security::transit::LocalTransit;
use std::sync::Arc;
use tower::ServiceExt;

const KEY_V1: &str = include_str!("fixtures/ec_p256_v1.key.pem");
const PUB_V1: &str = include_str!("fixtures/ec_p256_v1.pub.pem");

// Stands in for the upstream: reports the path and identity headers it saw.
async fn echo(headers: HeaderMap, req: Request) -> Json<Value> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(String::from);
    Json(json!({
        "path": req.uri().path(),
        "user_id": header("x-user-id"),
        "nickname": header("x-user-nickname"),
    }))
}

fn authority() -> Arc<TokenAuthority> {
    let transit = Arc::new(LocalTransit::new(KEY_V1.as_bytes(), PUB_V1).unwrap());
    Arc::new(TokenAuthority::new(transit, AuthoritySettings::default()))
}

fn router(authority: Arc<TokenAuthority>) -> Router {
    let gate = Arc::new(EdgeGate::new(
        authority,
        RoutePolicy::from_config(&RoutesConfig::default()),
    ));
    Router::new()
        .fallback(echo)
        .layer(middleware::from_fn_with_state(gate, authorize_request))
}

async fn token(authority: &TokenAuthority, phase: AuthPhase) -> String {
    authority
        .sign(&NewSession {
            sub: "user-42".into(),
            nickname: "alice".into(),
            phase,
        })
        .await
        .unwrap()
}

async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

fn get(uri: &str) -> axum::http::request::Builder {
    Request::builder().uri(uri)
}

#[tokio::test]
async fn protected_route_without_token_is_401() {
    let (status, body) = send(router(authority()), get("/api/users/me").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "token_missing");
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn public_route_passes_without_forged_identity() {
    let req = get("/api/auth/login")
        .header("x-user-id", "client-supplied")
        .header("x-user-nickname", "client-supplied")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(router(authority()), req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["path"], "/api/auth/login");
    assert!(body["user_id"].is_null());
    assert!(body["nickname"].is_null());
}

#[tokio::test]
async fn dot_segments_cannot_escape_public_prefix() {
    for uri in [
        "/health/../api/users/me",
        "/api/auth/login/../../users/me",
        "/health/%2e%2e/api/users/me",
        "/health%2f..%2fapi/users/me",
    ] {
        let req = get(uri).header("x-user-id", "admin").body(Body::empty()).unwrap();
        let (status, body) = send(router(authority()), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(body["error"], "bad_request", "{uri}");
    }
}

#[tokio::test]
async fn valid_token_injects_identity() {
    let authority = authority();
    let token = token(&authority, AuthPhase::Full).await;
    let req = get("/api/users/me")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(router(authority), req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user_id"], "user-42");
    assert_eq!(body["nickname"], "alice");
}

#[tokio::test]
async fn spoofed_identity_is_replaced() {
    let authority = authority();
    let token = token(&authority, AuthPhase::Full).await;
    let req = get("/api/users/me")
        .header("authorization", format!("Bearer {token}"))
        .header("x-user-id", "admin")
        .header("x-user-nickname", "root")
        .body(Body::empty())
        .unwrap();

    let (_, body) = send(router(authority), req).await;
    assert_eq!(body["user_id"], "user-42");
    assert_eq!(body["nickname"], "alice");
}

#[tokio::test]
async fn unlisted_route_drops_spoofed_identity() {
    let req = get("/assets/app.js")
        .header("x-user-id", "admin")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(router(authority()), req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["user_id"].is_null());
}

#[tokio::test]
async fn garbage_token_is_invalid() {
    let req = get("/api/users/me")
        .header("authorization", "Bearer not.a.token")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(router(authority()), req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid_token");
}

#[tokio::test]
async fn pending_nickname_is_confined_to_completion_path() {
    let authority = authority();
    let token = token(&authority, AuthPhase::PendingNickname).await;
    let bearer = format!("Bearer {token}");

    let (status, body) = send(
        router(authority.clone()),
        get("/api/users/me").header("authorization", &bearer).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "policy_violation");

    let (status, body) = send(
        router(authority),
        get("/api/users/me/nickname")
            .method("PUT")
            .header("authorization", &bearer)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user_id"], "user-42");
}

#[tokio::test]
async fn pending_second_factor_is_confined_to_verify_path() {
    let authority = authority();
    let token = token(&authority, AuthPhase::PendingSecondFactor).await;
    let bearer = format!("Bearer {token}");

    let (status, _) = send(
        router(authority.clone()),
        get("/api/users/me/nickname").header("authorization", &bearer).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        router(authority),
        get("/api/auth/2fa/verify").header("authorization", &bearer).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn upgrade_route_accepts_query_token() {
    let authority = authority();
    let token = token(&authority, AuthPhase::Full).await;

    let (status, body) = send(
        router(authority.clone()),
        get(&format!("/ws?token={token}")).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user_id"], "user-42");

    // Query tokens are ignored outside upgrade routes.
    let (status, body) = send(
        router(authority),
        get(&format!("/api/users/me?token={token}")).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "token_missing");
}
