use crate::auth::{generate_token, hash_password};
use crate::db::{begin_immediate, DbPool};
use crate::error::ApiError;
use crate::models::{CreateAccountRequest, CreateAccountResponse};
use axum::{extract::State, Json};
use chrono::Utc;

pub async fn health_check() -> &'static str {
    "OK"
}

/// Identity shim for the calling layer: mints a user, their profile, and a
/// session token. The core itself only ever sees the resulting actor id.
/// Duplicate usernames are caught by the unique constraint, so concurrent
/// creators converge on one Conflict instead of racing a pre-check.
pub async fn create_account(
    State(pool): State<DbPool>,
    Json(payload): Json<CreateAccountRequest>,
) -> Result<Json<CreateAccountResponse>, ApiError> {
    if payload.username.trim().is_empty() {
        return Err(ApiError::Validation("Username cannot be empty".to_string()));
    }
    if payload.password.is_empty() {
        return Err(ApiError::Validation("Password cannot be empty".to_string()));
    }

    let password_hash = hash_password(&payload.password)
        .map_err(|e| ApiError::Internal(format!("Password hashing error: {}", e)))?;

    let now = Utc::now();
    let mut tx = begin_immediate(&pool).await?;

    let inserted =
        sqlx::query("INSERT INTO users (username, password_hash, created_at) VALUES (?, ?, ?)")
            .bind(&payload.username)
            .bind(&password_hash)
            .bind(now)
            .execute(&mut *tx)
            .await;

    let user_id = match inserted {
        Ok(result) => result.last_insert_rowid(),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            return Err(ApiError::Conflict("Username already exists".to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    sqlx::query("INSERT INTO profiles (user_id, profile_type, created_at) VALUES (?, 'dj', ?)")
        .bind(user_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

    let token = generate_token();
    sqlx::query("INSERT INTO sessions (user_id, token, created_at) VALUES (?, ?, ?)")
        .bind(user_id)
        .bind(&token)
        .bind(now)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(Json(CreateAccountResponse {
        token,
        user_id,
        username: payload.username,
    }))
}
