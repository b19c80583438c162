use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::collections::BTreeMap;

use super::AppState;
use crate::auth::Principal;
use crate::db;
use crate::db::requests::CompanyLoad;
use crate::error::ApiResult;
use crate::model::RequestStatus;

#[derive(Debug, Serialize)]
pub struct Stats {
    /// Every status is present, zero when empty.
    pub requests_by_status: BTreeMap<&'static str, i64>,
    pub total_requests: i64,
    pub open_requests: i64,
    pub companies: Vec<CompanyLoad>,
}

pub async fn show(State(state): State<AppState>, principal: Principal) -> ApiResult<Json<Stats>> {
    principal.require_admin()?;
    let mut by_status: BTreeMap<&'static str, i64> =
        RequestStatus::ALL.iter().map(|s| (s.as_str(), 0)).collect();
    for row in db::requests::counts_by_status(&state.pool).await? {
        by_status.insert(row.status.as_str(), row.count);
    }
    let total_requests = by_status.values().sum();
    let open_requests = total_requests - by_status.get("done").copied().unwrap_or(0);
    Ok(Json(Stats {
        requests_by_status: by_status,
        total_requests,
        open_requests,
        companies: db::requests::load_by_company(&state.pool).await?,
    }))
}
