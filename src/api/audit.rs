use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use super::{ApiQuery, AppState};
use crate::auth::Principal;
use crate::db;
use crate::db::audit::AuditFilter;
use crate::error::ApiResult;
use crate::model::AuditLog;
use crate::validation::Pagination;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
    pub actor_id: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list(
    State(state): State<AppState>,
    principal: Principal,
    ApiQuery(q): ApiQuery<ListQuery>,
) -> ApiResult<Json<Vec<AuditLog>>> {
    principal.require_admin()?;
    let (limit, offset) = Pagination {
        limit: q.limit,
        offset: q.offset,
    }
    .resolve()?;
    let filter = AuditFilter {
        entity_type: q.entity_type.as_deref().filter(|t| !t.is_empty()),
        entity_id: q.entity_id,
        actor_id: q.actor_id,
    };
    Ok(Json(db::audit::list(&state.pool, &filter, limit, offset).await?))
}
