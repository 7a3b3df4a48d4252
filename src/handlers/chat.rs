// Chat endpoints: blocking, streaming (SSE), stop-generation.

use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    response::Json,
    Extension,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::middleware::AuthUser;
use crate::provider::StreamEvent;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub query: String,
    #[serde(rename = "conversationId")]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StopBody {
    #[serde(rename = "taskId")]
    pub task_id: String,
}

/// POST /api/chat - blocking completion; the exchange is persisted before
/// the response is returned.
pub async fn chat(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<ChatBody>,
) -> Result<Json<Value>, ApiError> {
    if body.query.trim().is_empty() {
        return Err(ApiError::bad_request("query is required"));
    }
    let answer = state.chat.chat(&user.id, &body.query, body.conversation_id).await?;
    Ok(Json(json!({ "success": true, "data": answer })))
}

/// POST /api/chat/stream - streaming completion over SSE. Persistence
/// happens in the background once the upstream signals the end of the
/// message; disconnecting stops the upstream read.
pub async fn chat_stream(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<ChatBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if body.query.trim().is_empty() {
        return Err(ApiError::bad_request("query is required"));
    }
    let events = state.chat.chat_stream(&user.id, &body.query, body.conversation_id).await?;

    let sse = events.map(|item| {
        let event = match item {
            Ok(ev) => Event::default().data(encode_event(&ev)),
            Err(e) => Event::default().event("error").data(e.to_string()),
        };
        Ok(event)
    });
    Ok(Sse::new(sse).keep_alive(KeepAlive::default()))
}

fn encode_event(event: &StreamEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string())
}

/// POST /api/chat/stop - forward a stop-generation request upstream.
pub async fn stop(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<StopBody>,
) -> Result<Json<Value>, ApiError> {
    state.chat.stop_generation(&body.task_id, &user.id).await?;
    Ok(Json(json!({ "success": true, "data": { "stopped": true } })))
}
