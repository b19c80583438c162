use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiQuery, AppState};
use crate::auth::Principal;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::model::Notification;
use crate::validation::Pagination;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub unread: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list(
    State(state): State<AppState>,
    principal: Principal,
    ApiQuery(q): ApiQuery<ListQuery>,
) -> ApiResult<Json<Vec<Notification>>> {
    let (limit, offset) = Pagination {
        limit: q.limit,
        offset: q.offset,
    }
    .resolve()?;
    let rows = db::notifications::list(&state.pool, principal.user_id, q.unread, limit, offset).await?;
    Ok(Json(rows))
}

pub async fn unread_count(State(state): State<AppState>, principal: Principal) -> ApiResult<Json<Value>> {
    let count = db::notifications::unread_count(&state.pool, principal.user_id).await?;
    Ok(Json(json!({ "count": count })))
}

pub async fn mark_read(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
) -> ApiResult<Json<Notification>> {
    let n = db::notifications::mark_read(&state.pool, principal.user_id, id)
        .await?
        .ok_or(ApiError::NotFound("notification"))?;
    Ok(Json(n))
}

pub async fn mark_all_read(State(state): State<AppState>, principal: Principal) -> ApiResult<Json<Value>> {
    let updated = db::notifications::mark_all_read(&state.pool, principal.user_id).await?;
    Ok(Json(json!({ "updated": updated })))
}

pub async fn remove(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    if !db::notifications::delete(&state.pool, principal.user_id, id).await? {
        return Err(ApiError::NotFound("notification"));
    }
    Ok(StatusCode::NO_CONTENT)
}
