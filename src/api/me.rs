use axum::extract::State;
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use super::AppState;
use crate::auth::{generate_token, hash_token, Principal};
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::model::{Company, User};

#[derive(Debug, Serialize)]
pub struct Me {
    pub user: User,
    pub company: Option<Company>,
    pub unread_notifications: i64,
}

pub async fn show(State(state): State<AppState>, principal: Principal) -> ApiResult<Json<Me>> {
    let user = db::users::get(&state.pool, principal.user_id)
        .await?
        .ok_or(ApiError::Unauthorized)?;
    let company = match user.company_id {
        Some(cid) => db::companies::get(&state.pool, cid).await?,
        None => None,
    };
    let unread_notifications = db::notifications::unread_count(&state.pool, user.id).await?;
    Ok(Json(Me {
        user,
        company,
        unread_notifications,
    }))
}

/// Replaces the caller's API token; the old one stops working immediately.
pub async fn rotate_token(State(state): State<AppState>, principal: Principal) -> ApiResult<Json<Value>> {
    let token = generate_token();
    if !db::users::rotate_token(&state.pool, principal.user_id, &hash_token(&token)).await? {
        return Err(ApiError::Unauthorized);
    }
    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "user.token_rotated",
        "user",
        Some(principal.user_id),
        json!({}),
    )
    .await;
    Ok(Json(json!({ "token": token })))
}
