use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{ApiJson, ApiQuery, AppState};
use crate::auth::Principal;
use crate::db;
use crate::db::companies::{CompanyChanges, NewCompany};
use crate::error::{ApiError, ApiResult};
use crate::model::{Company, CompanyService, CompanyStatus, PlanTier, RequestStatus};
use crate::sanitize::{normalize_email, sanitize_text};
use crate::validation::{Validate, Validator, MAX_ACTIVE_LIMIT, MAX_NAME_LEN};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<CompanyStatus>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCompany {
    pub name: String,
    pub status: Option<CompanyStatus>,
    pub plan_tier: Option<PlanTier>,
    pub active_request_limit: Option<i64>,
    pub billing_email: Option<String>,
}

impl Validate for CreateCompany {
    fn validate(&self) -> ApiResult<()> {
        let mut v = Validator::new();
        v.required_text("name", &self.name, MAX_NAME_LEN);
        if let Some(limit) = self.active_request_limit {
            v.range("active_request_limit", limit, 0, MAX_ACTIVE_LIMIT);
        }
        if let Some(email) = &self.billing_email {
            v.email("billing_email", email);
        }
        v.finish()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateCompany {
    pub name: Option<String>,
    pub status: Option<CompanyStatus>,
    pub plan_tier: Option<PlanTier>,
    pub active_request_limit: Option<i64>,
    pub billing_email: Option<String>,
}

impl Validate for UpdateCompany {
    fn validate(&self) -> ApiResult<()> {
        let mut v = Validator::new();
        v.non_blank_if_present("name", self.name.as_deref(), MAX_NAME_LEN);
        if let Some(limit) = self.active_request_limit {
            v.range("active_request_limit", limit, 0, MAX_ACTIVE_LIMIT);
        }
        if let Some(email) = &self.billing_email {
            v.email("billing_email", email);
        }
        v.finish()
    }
}

#[derive(Debug, Serialize)]
pub struct Capacity {
    pub limit: i64,
    pub active: i64,
    pub available: i64,
}

#[derive(Debug, Deserialize)]
pub struct AddService {
    pub service_id: i64,
}

pub(super) async fn load(state: &AppState, id: i64) -> ApiResult<Company> {
    db::companies::get(&state.pool, id)
        .await?
        .ok_or(ApiError::NotFound("company"))
}

pub async fn list(
    State(state): State<AppState>,
    principal: Principal,
    ApiQuery(q): ApiQuery<ListQuery>,
) -> ApiResult<Json<Value>> {
    principal.require_admin()?;
    let key = format!("companies:list:{}", q.status.map_or("all", |s| s.as_str()));
    if let Some(hit) = state.cache.get(&key) {
        return Ok(Json(hit));
    }
    let companies = db::companies::list(&state.pool, q.status).await?;
    let body = json!(companies);
    state.cache.set(key, body.clone());
    Ok(Json(body))
}

pub async fn create(
    State(state): State<AppState>,
    principal: Principal,
    ApiJson(body): ApiJson<CreateCompany>,
) -> ApiResult<(StatusCode, Json<Company>)> {
    principal.require_admin()?;
    body.validate()?;
    let tier = body.plan_tier.unwrap_or(PlanTier::Starter);
    let company = db::companies::insert(
        &state.pool,
        &NewCompany {
            name: sanitize_text(&body.name),
            status: body.status.unwrap_or(CompanyStatus::Active),
            plan_tier: tier,
            active_request_limit: body
                .active_request_limit
                .unwrap_or_else(|| tier.default_active_limit()),
            billing_email: body.billing_email.as_deref().map(normalize_email),
            woo_customer_id: None,
            woo_subscription_id: None,
        },
    )
    .await?;
    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "company.created",
        "company",
        Some(company.id),
        json!({ "name": company.name, "plan_tier": company.plan_tier }),
    )
    .await;
    state.invalidate_companies();
    Ok((StatusCode::CREATED, Json(company)))
}

pub async fn show(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
) -> ApiResult<Json<Company>> {
    principal.ensure_company_access(id)?;
    Ok(Json(load(&state, id).await?))
}

pub async fn update(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
    ApiJson(body): ApiJson<UpdateCompany>,
) -> ApiResult<Json<Company>> {
    principal.require_admin()?;
    body.validate()?;
    let changes = CompanyChanges {
        name: body.name.as_deref().map(sanitize_text),
        status: body.status,
        plan_tier: body.plan_tier,
        active_request_limit: body.active_request_limit,
        billing_email: body.billing_email.as_deref().map(normalize_email),
        ..Default::default()
    };
    if changes.is_empty() {
        return Ok(Json(load(&state, id).await?));
    }
    let company = db::companies::update(&state.pool, id, &changes)
        .await?
        .ok_or(ApiError::NotFound("company"))?;
    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "company.updated",
        "company",
        Some(id),
        json!({
            "name": body.name,
            "status": body.status,
            "plan_tier": body.plan_tier,
            "active_request_limit": body.active_request_limit,
            "billing_email": body.billing_email,
        }),
    )
    .await;
    state.invalidate_companies();
    Ok(Json(company))
}

pub async fn remove(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    principal.require_admin()?;
    let company = load(&state, id).await?;
    let open = db::companies::count_open_requests(&state.pool, id).await?;
    if open > 0 {
        return Err(ApiError::conflict(format!(
            "company still has {open} open request(s)"
        )));
    }
    db::companies::delete(&state.pool, id).await?;
    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "company.deleted",
        "company",
        Some(id),
        json!({ "name": company.name }),
    )
    .await;
    state.invalidate_companies();
    state.invalidate_boards();
    Ok(StatusCode::NO_CONTENT)
}

pub async fn capacity(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
) -> ApiResult<Json<Capacity>> {
    principal.ensure_company_access(id)?;
    let company = load(&state, id).await?;
    let active =
        db::companies::count_requests_in_status(&state.pool, id, RequestStatus::Active).await?;
    Ok(Json(Capacity {
        limit: company.active_request_limit,
        active,
        available: (company.active_request_limit - active).max(0),
    }))
}

pub async fn list_services(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<CompanyService>>> {
    principal.ensure_company_access(id)?;
    load(&state, id).await?;
    Ok(Json(db::companies::list_services(&state.pool, id).await?))
}

pub async fn add_service(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
    ApiJson(body): ApiJson<AddService>,
) -> ApiResult<(StatusCode, Json<CompanyService>)> {
    principal.require_admin()?;
    load(&state, id).await?;
    let service = db::services::get(&state.pool, body.service_id)
        .await?
        .ok_or(ApiError::NotFound("service"))?;
    if !service.active {
        return Err(ApiError::conflict("service is no longer offered"));
    }
    let cs = db::companies::add_service(&state.pool, id, service.id).await?;
    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "company.service_added",
        "company",
        Some(id),
        json!({ "service_id": service.id, "company_service_id": cs.id }),
    )
    .await;
    state.cache.delete(super::CACHE_MRR);
    Ok((StatusCode::CREATED, Json(cs)))
}

pub async fn cancel_service(
    State(state): State<AppState>,
    principal: Principal,
    Path((id, cs_id)): Path<(i64, i64)>,
) -> ApiResult<Json<CompanyService>> {
    principal.require_admin()?;
    let cs = db::companies::cancel_service(&state.pool, id, cs_id)
        .await?
        .ok_or(ApiError::NotFound("company service"))?;
    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "company.service_cancelled",
        "company",
        Some(id),
        json!({ "company_service_id": cs_id }),
    )
    .await;
    state.cache.delete(super::CACHE_MRR);
    Ok(Json(cs))
}
