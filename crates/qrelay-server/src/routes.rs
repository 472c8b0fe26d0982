// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use futures::StreamExt;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::auth::{require_api_key, AuthedUser};
use crate::error::GatewayError;
use crate::pipeline::{handle_chat, ChatReply, Dialect};
use crate::state::Gateway;

pub fn router(gw: Arc<Gateway>) -> Router {
    let api = Router::new()
        .route("/v1/messages", post(post_messages))
        .route("/v1/chat/completions", post(post_chat_completions))
        .route("/v1/messages/count_tokens", post(post_count_tokens))
        .route("/v1/models", get(get_models))
        .layer(middleware::from_fn_with_state(gw.clone(), require_api_key));

    Router::new()
        .merge(api)
        .route("/health", get(get_health))
        .layer(DefaultBodyLimit::max(gw.config.server.body_limit_bytes))
        .layer(CorsLayer::permissive())
        .with_state(gw)
}

async fn post_messages(
    State(gw): State<Arc<Gateway>>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, GatewayError> {
    let request =
        qrelay_protocol::parse_claude_request(&body).map_err(GatewayError::from_translate)?;
    let reply = handle_chat(
        gw,
        request,
        Dialect::Claude,
        user,
        conversation_header(&headers),
    )
    .await?;
    Ok(reply_response(reply))
}

async fn post_chat_completions(
    State(gw): State<Arc<Gateway>>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, GatewayError> {
    let request =
        qrelay_protocol::parse_openai_request(&body).map_err(GatewayError::from_translate)?;
    let reply = handle_chat(
        gw,
        request,
        Dialect::OpenAi,
        user,
        conversation_header(&headers),
    )
    .await?;
    Ok(reply_response(reply))
}

async fn post_count_tokens(
    Json(body): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    let request =
        qrelay_protocol::parse_claude_request(&body).map_err(GatewayError::from_translate)?;
    let input_tokens = qrelay_compress::estimate_request_tokens(&request);
    Ok(Json(json!({ "input_tokens": input_tokens })))
}

async fn get_models() -> Json<Value> {
    let data: Vec<Value> = qrelay_protocol::known_short_ids()
        .into_iter()
        .map(|id| json!({ "type": "model", "id": id, "display_name": id }))
        .collect();
    Json(json!({ "data": data, "has_more": false }))
}

async fn get_health(State(gw): State<Arc<Gateway>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "accounts": gw.pool.len(),
        "pool_stale": gw.pool.is_stale(),
    }))
}

fn conversation_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-conversation-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn reply_response(reply: ChatReply) -> Response {
    match reply {
        ChatReply::Json {
            body,
            conversation_id,
        } => (
            StatusCode::OK,
            [("x-conversation-id", conversation_id)],
            Json(body),
        )
            .into_response(),
        ChatReply::Sse {
            lines,
            conversation_id,
        } => {
            let body = Body::from_stream(lines.map(Ok::<_, Infallible>));
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE.as_str(), "text/event-stream"),
                    (header::CACHE_CONTROL.as_str(), "no-cache"),
                    ("x-conversation-id", conversation_id.as_str()),
                ],
                body,
            )
                .into_response()
        }
    }
}
