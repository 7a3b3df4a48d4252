// Conversation history endpoints, backed by the local database rather
// than the provider.

use axum::{
    extract::{Path, Query, State},
    response::Json,
    Extension,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::middleware::AuthUser;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    #[serde(rename = "pageSize")]
    pub page_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RenameBody {
    pub name: String,
}

/// GET /api/conversations - the caller's conversation list, paginated.
pub async fn history(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Value>, ApiError> {
    let page = state.chat.history(&user.id, query.page.unwrap_or(1), query.page_size).await?;
    Ok(Json(json!({ "success": true, "data": page })))
}

/// GET /api/conversations/:id
pub async fn detail(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let conversation = state.chat.conversation_detail(&conversation_id, &user.id).await?;
    Ok(Json(json!({ "success": true, "data": conversation })))
}

/// GET /api/conversations/:id/messages
pub async fn messages(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(conversation_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Value>, ApiError> {
    let page = state
        .chat
        .conversation_messages(&conversation_id, &user.id, query.page.unwrap_or(1), query.page_size)
        .await?;
    Ok(Json(json!({ "success": true, "data": page })))
}

/// PUT /api/conversations/:id/name
pub async fn rename(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(conversation_id): Path<String>,
    Json(body): Json<RenameBody>,
) -> Result<Json<Value>, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }
    let conversation =
        state.chat.rename_conversation(&conversation_id, &user.id, body.name.trim()).await?;
    Ok(Json(json!({ "success": true, "data": conversation })))
}

/// POST /api/conversations/:id/archive
pub async fn archive(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let conversation = state.chat.archive_conversation(&conversation_id, &user.id).await?;
    Ok(Json(json!({ "success": true, "data": conversation })))
}

/// DELETE /api/conversations/:id - logical removal; the row and its audit
/// trail stay in place.
pub async fn remove(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.chat.delete_conversation(&conversation_id, &user.id).await?;
    Ok(Json(json!({ "success": true, "data": { "deleted": true } })))
}
