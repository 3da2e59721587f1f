#![forbid(unsafe_code)]

mod support;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use quarry_gateway::{EMPTY_QUERY_MESSAGE, router};
use serde_json::{Value, json};
use support::{app_state, token};
use tower::ServiceExt;

fn encode(raw: &str) -> String {
    raw.bytes()
        .map(|b| {
            if b.is_ascii_alphanumeric() {
                (b as char).to_string()
            } else {
                format!("%{b:02X}")
            }
        })
        .collect()
}

fn get(uri: &str, authorization: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(authorization) = authorization {
        builder = builder.header("authorization", authorization);
    }
    builder.body(Body::empty()).expect("request")
}

fn load_uri(query: &Value) -> String {
    format!("/cubejs-api/v1/load?query={}", encode(&query.to_string()))
}

async fn send(app: axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let body = serde_json::from_slice(&bytes).expect("json body");
    (status, body)
}

#[tokio::test]
async fn production_rejects_requests_without_authorization() {
    let app = router(app_state("no_auth_header", true));
    let (status, body) = send(app, get(&load_uri(&json!({})), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, json!({"error": "Authorization header isn't set"}));
}

#[tokio::test]
async fn production_rejects_invalid_tokens() {
    let app = router(app_state("invalid_token", true));
    let (status, body) = send(app, get("/cubejs-api/v1/meta", Some("not-a-jwt"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, json!({"error": "Invalid token"}));
}

#[tokio::test]
async fn empty_query_with_valid_token_is_a_user_error() {
    let app = router(app_state("empty_query", true));
    let token = token();
    let (status, body) = send(app, get(&load_uri(&json!({})), Some(&token))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"type": "UserError", "error": EMPTY_QUERY_MESSAGE}));
}

#[tokio::test]
async fn missing_query_param_is_a_user_error() {
    let app = router(app_state("missing_query", true));
    let token = token();
    let (status, body) = send(app, get("/cubejs-api/v1/load", Some(&token))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "UserError");
}

#[tokio::test]
async fn development_mode_serves_unauthenticated_requests() {
    let app = router(app_state("dev_mode", false));
    let (status, body) = send(app, get("/cubejs-api/v1/meta", Some("garbage"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cubes"][0]["name"], "orders");
}

#[tokio::test]
async fn load_returns_rows_keyed_by_member_names() {
    let app = router(app_state("load_rows", true));
    let token = token();
    let query = json!({
        "measures": ["orders.count"],
        "dimensions": ["orders.status"]
    });
    let (status, body) = send(app, get(&load_uri(&query), Some(&token))).await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(
        body["data"],
        json!([
            {"orders.status": "shipped", "orders.count": 2},
            {"orders.status": "processing", "orders.count": 1}
        ])
    );
    assert!(body["lastRefreshTime"].is_string());
    assert!(body["annotation"]["measures"]["orders.count"].is_object());
    assert_eq!(body["query"]["timezone"], "UTC");
}

#[tokio::test]
async fn load_accepts_post_bodies() {
    let app = router(app_state("load_post", true));
    let request = Request::builder()
        .method("POST")
        .uri("/cubejs-api/v1/load")
        .header("authorization", format!("Bearer {}", token()))
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"query": {"measures": ["orders.count"]}, "queryType": "multi"}).to_string(),
        ))
        .expect("request");
    let (status, body) = send(app, request).await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["queryType"], "multi");
    assert_eq!(body["results"][0]["data"], json!([{"orders.count": 3}]));
}

#[tokio::test]
async fn sql_endpoint_returns_statement_and_params() {
    let app = router(app_state("sql_endpoint", true));
    let token = token();
    let query = json!({
        "measures": ["orders.count"],
        "filters": [{"member": "orders.status", "operator": "equals", "values": ["shipped"]}]
    });
    let uri = format!("/cubejs-api/v1/sql?query={}", encode(&query.to_string()));
    let (status, body) = send(app, get(&uri, Some(&token))).await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    let statement = body["sql"]["sql"][0].as_str().expect("sql text");
    assert!(statement.starts_with("SELECT count(*) AS orders__count FROM orders"));
    assert_eq!(body["sql"]["sql"][1], json!(["shipped"]));
}

#[tokio::test]
async fn request_id_header_is_echoed() {
    let app = router(app_state("request_id", true));
    let request = Request::builder()
        .uri("/cubejs-api/v1/meta")
        .header("authorization", token())
        .header("x-request-id", "req-123")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok()),
        Some("req-123")
    );
}
