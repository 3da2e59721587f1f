#![forbid(unsafe_code)]

use crate::ApiError;
use crate::gateway::{ApiGateway, RequestContext};
use crate::subscription::SubscriptionServer;
use crate::ws::{WsHub, subscription_websocket};
use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{FromRequestParts, Query, State};
use axum::http::header::{AUTHORIZATION, HeaderName};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct AppState {
    pub gateway: ApiGateway,
    pub subscriptions: SubscriptionServer,
    pub hub: Arc<WsHub>,
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// `x-request-id`, else the trace id of a W3C `traceparent`, else a fresh UUID.
pub fn request_id_from_headers(headers: &HeaderMap) -> String {
    header_string(headers, REQUEST_ID_HEADER)
        .or_else(|| {
            header_string(headers, "traceparent").map(|traceparent| {
                traceparent
                    .split('-')
                    .nth(1)
                    .map(str::to_string)
                    .unwrap_or(traceparent)
            })
        })
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

#[async_trait]
impl FromRequestParts<AppState> for RequestContext {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if let Some(existing) = parts.extensions.get::<Self>() {
            return Ok(existing.clone());
        }

        let mut ctx = RequestContext {
            request_id: request_id_from_headers(&parts.headers),
            auth_info: None,
            is_subscription: false,
        };
        let authorization = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        match state.gateway.authenticator().check(authorization) {
            Ok(auth_info) => {
                ctx.auth_info = auth_info;
                Ok(ctx)
            }
            Err(err) => Err(error_response(&state.gateway, &err, &ctx)),
        }
    }
}

/// Authenticates every API request and echoes its request id.
pub async fn auth_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let (mut parts, body) = req.into_parts();
    let ctx = match RequestContext::from_request_parts(&mut parts, &state).await {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };

    let mut req = Request::from_parts(parts, body);
    let request_id = ctx.request_id.clone();
    req.extensions_mut().insert(ctx);

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

fn error_response(gateway: &ApiGateway, err: &ApiError, ctx: &RequestContext) -> Response {
    let (status, body) = gateway.error_reply(err, ctx);
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(body)).into_response()
}

fn respond(state: &AppState, ctx: &RequestContext, result: Result<Value, ApiError>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => error_response(&state.gateway, &err, ctx),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct QueryParams {
    query: Option<String>,
    #[serde(rename = "queryType")]
    query_type: Option<String>,
}

fn query_param(raw: Option<&str>) -> Result<Value, ApiError> {
    match raw {
        Some(raw) => Ok(serde_json::from_str(raw)?),
        None => Ok(Value::Null),
    }
}

async fn load_get(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(params): Query<QueryParams>,
) -> Response {
    let result = match query_param(params.query.as_deref()) {
        Ok(query) => {
            state
                .gateway
                .load(query, params.query_type.as_deref(), &ctx)
                .await
        }
        Err(err) => Err(err),
    };
    respond(&state, &ctx, result)
}

async fn load_post(State(state): State<AppState>, ctx: RequestContext, body: Bytes) -> Response {
    let result = match serde_json::from_slice::<Value>(&body) {
        Ok(mut body) => {
            let query = body.get_mut("query").map(Value::take).unwrap_or(Value::Null);
            let query_type = body
                .get("queryType")
                .and_then(Value::as_str)
                .map(str::to_string);
            state.gateway.load(query, query_type.as_deref(), &ctx).await
        }
        Err(err) => Err(ApiError::from(err)),
    };
    respond(&state, &ctx, result)
}

async fn sql(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(params): Query<QueryParams>,
) -> Response {
    let result = match query_param(params.query.as_deref()) {
        Ok(query) => state.gateway.sql(query, &ctx).await,
        Err(err) => Err(err),
    };
    respond(&state, &ctx, result)
}

async fn meta(State(state): State<AppState>, ctx: RequestContext) -> Response {
    let result = state.gateway.meta(&ctx).await;
    respond(&state, &ctx, result)
}

/// HTTP API under the gateway's base path plus the WebSocket endpoint at `{base}/ws`.
///
/// `/v1/subscribe` over HTTP is a plain load; clients re-issue it to poll.
pub fn router(state: AppState) -> Router {
    let base = state.gateway.base_path().trim_end_matches('/').to_string();
    let api = Router::new()
        .route(&format!("{base}/v1/load"), get(load_get).post(load_post))
        .route(&format!("{base}/v1/subscribe"), get(load_get))
        .route(&format!("{base}/v1/sql"), get(sql))
        .route(&format!("{base}/v1/meta"), get(meta))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .merge(api)
        .route(&format!("{base}/ws"), get(subscription_websocket))
        .with_state(state)
}
