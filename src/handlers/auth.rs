// POST /auth/login and GET /api/auth/whoami

use axum::{extract::State, response::Json, Extension};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::auth::{generate_jwt, password_digest, Claims};
use crate::config::config;
use crate::database::engine::QueryArgs;
use crate::error::ApiError;
use crate::middleware::AuthUser;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(rename = "userCode")]
    pub user_code: String,
    pub password: String,
}

/// POST /auth/login - validate credentials against the User entity and
/// hand out a JWT.
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<Value>, ApiError> {
    if payload.user_code.trim().is_empty() || payload.password.is_empty() {
        return Err(ApiError::bad_request("userCode and password are required"));
    }

    let users = state.data.entity("User");
    let user = users
        .find_first(QueryArgs::filtered(json!({ "userCode": payload.user_code })))
        .await?
        .ok_or_else(|| ApiError::unauthorized("Invalid credentials"))?;

    let stored = user.get("passwordDigest").and_then(Value::as_str).unwrap_or_default();
    if stored != password_digest(&payload.password) {
        return Err(ApiError::unauthorized("Invalid credentials"));
    }

    let id = user.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
    let user_code = user.get("userCode").and_then(Value::as_str).unwrap_or_default().to_string();
    let user_name = user.get("userName").and_then(Value::as_str).unwrap_or_default().to_string();

    let token = generate_jwt(Claims::new(id.clone(), user_code.clone(), user_name.clone()))
        .map_err(|e| {
            tracing::error!("JWT generation failed: {}", e);
            ApiError::internal_server_error("Failed to issue token")
        })?;

    info!("User {} logged in", user_code);
    Ok(Json(json!({
        "success": true,
        "data": {
            "token": token,
            "user": { "id": id, "userCode": user_code, "userName": user_name },
            "expires_in": config().security.jwt_expiry_hours * 3600
        }
    })))
}

/// GET /api/auth/whoami - echo the authenticated caller.
pub async fn whoami(Extension(user): Extension<AuthUser>) -> Json<Value> {
    Json(json!({
        "success": true,
        "data": {
            "id": user.id,
            "userCode": user.user_code,
            "userName": user.user_name
        }
    }))
}
