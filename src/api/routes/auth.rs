//! Auth Routes
//!
//! Password accounts and bearer credential issuance.
//!
//! - POST /api/v1/auth/signup - Create an account
//! - POST /api/v1/auth/login - Exchange a password for a bearer token

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::api::dto::{LoginRequest, LoginResponse, SignupRequest, SignupResponse};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::auth::{hash_password, verify_password, PasswordError};

/// Longest accepted username, in characters
const MAX_USERNAME_LEN: usize = 32;

const INVALID_CREDENTIALS: &str = "Invalid credentials";

/// POST /api/v1/auth/signup
pub async fn signup(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignupRequest>,
) -> ApiResult<(StatusCode, Json<SignupResponse>)> {
    let username = validate_username(&req.username)?.to_string();

    // Argon2 runs on the blocking pool
    let password = req.password;
    let hash = tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| ApiError::Internal(format!("Password hashing task failed: {}", e)))?
        .map_err(|e| match e {
            PasswordError::TooShort => ApiError::Validation(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        })?;

    let user = state
        .store
        .create_user_with_password(&username, &hash)
        .await?;

    tracing::info!(user_id = user.id, username = %user.username, "Account created");

    Ok((
        StatusCode::CREATED,
        Json(SignupResponse {
            user_id: user.id,
            username: user.username,
        }),
    ))
}

/// POST /api/v1/auth/login
///
/// Unknown users, accounts without a password and wrong passwords all get
/// the same 401.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let credentials = state
        .store
        .find_credentials(req.username.trim())
        .await?
        .ok_or_else(|| ApiError::Unauthorized(INVALID_CREDENTIALS.to_string()))?;

    let stored = credentials
        .password_hash
        .ok_or_else(|| ApiError::Unauthorized(INVALID_CREDENTIALS.to_string()))?;

    let password = req.password;
    tokio::task::spawn_blocking(move || verify_password(&password, &stored))
        .await
        .map_err(|e| ApiError::Internal(format!("Password check task failed: {}", e)))?
        .map_err(|e| match e {
            PasswordError::Mismatch => ApiError::Unauthorized(INVALID_CREDENTIALS.to_string()),
            other => ApiError::Internal(other.to_string()),
        })?;

    let user = credentials.user;
    let claims = state.tokens.claims_for(&user);
    let token = state
        .tokens
        .sign(&claims)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    tracing::info!(user_id = user.id, username = %user.username, "Login succeeded");

    Ok(Json(LoginResponse {
        token,
        user_id: user.id,
        username: user.username,
        expires_at: claims.exp,
    }))
}

fn validate_username(name: &str) -> ApiResult<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::Validation("Username cannot be empty".to_string()));
    }
    if name.chars().count() > MAX_USERNAME_LEN {
        return Err(ApiError::Validation(format!(
            "Username cannot exceed {} characters",
            MAX_USERNAME_LEN
        )));
    }
    Ok(name)
}
