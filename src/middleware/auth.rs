use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{Json, Response},
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde_json::Value;

use crate::auth::Claims;
use crate::config;
use crate::data::actor::{with_actor, ActorIdentity};
use crate::error::ApiError;

/// Authenticated user context extracted from JWT
#[derive(Clone, Debug)]
pub struct AuthUser {
    pub id: String,
    pub user_code: String,
    pub user_name: String,
}

impl From<Claims> for AuthUser {
    fn from(claims: Claims) -> Self {
        Self { id: claims.id, user_code: claims.user_code, user_name: claims.user_name }
    }
}

/// JWT authentication middleware. Validates the bearer token, injects the
/// caller as an [`AuthUser`] extension, and runs the rest of the request
/// inside the ambient actor scope so audit fields pick up the right
/// identity.
pub async fn jwt_auth_middleware(
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<Value>)> {
    // Extract JWT from Authorization header
    let token = extract_jwt_from_headers(&headers).map_err(unauthorized_response)?;

    // Validate and decode JWT
    let claims = validate_jwt(&token).map_err(unauthorized_response)?;

    let actor =
        ActorIdentity::new(Some(claims.user_code.clone()), Some(claims.id.clone()));
    let auth_user = AuthUser::from(claims);
    request.extensions_mut().insert(auth_user);

    Ok(with_actor(actor, next.run(request)).await)
}

/// 401 rejection body in the standard error envelope
fn unauthorized_response(msg: String) -> (StatusCode, Json<Value>) {
    let api_error = ApiError::unauthorized(msg);
    (StatusCode::UNAUTHORIZED, Json(api_error.to_json()))
}

/// Extract JWT token from Authorization header
fn extract_jwt_from_headers(headers: &HeaderMap) -> Result<String, String> {
    let auth_header = headers
        .get("authorization")
        .or_else(|| headers.get("Authorization"))
        .ok_or_else(|| "Missing Authorization header".to_string())?;

    let auth_str = auth_header
        .to_str()
        .map_err(|_| "Invalid Authorization header format".to_string())?;

    if let Some(token) = auth_str.strip_prefix("Bearer ") {
        if token.trim().is_empty() {
            return Err("Empty JWT token".to_string());
        }
        Ok(token.to_string())
    } else {
        Err("Authorization header must use Bearer token format".to_string())
    }
}

/// Validate JWT token and extract claims
fn validate_jwt(token: &str) -> Result<Claims, String> {
    let secret = &config::config().security.jwt_secret;

    if secret.is_empty() {
        return Err("JWT secret not configured".to_string());
    }

    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    let validation = Validation::default();

    let token_data = decode::<Claims>(token, &decoding_key, &validation)
        .map_err(|e| format!("Invalid JWT token: {}", e))?;

    Ok(token_data.claims)
}
