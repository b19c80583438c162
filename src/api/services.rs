use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::{ApiJson, AppState};
use crate::auth::Principal;
use crate::db;
use crate::db::services::{NewService, ServiceChanges};
use crate::error::{ApiError, ApiResult};
use crate::model::{BillingInterval, Service};
use crate::sanitize::{sanitize_opt, sanitize_text};
use crate::validation::{Validate, Validator, MAX_DESCRIPTION_LEN, MAX_NAME_LEN};

/// Upper bound for a single service price (one million in major units).
const MAX_PRICE_CENTS: i64 = 100_000_000;

#[derive(Debug, Deserialize)]
pub struct CreateService {
    pub name: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub billing_interval: BillingInterval,
}

impl Validate for CreateService {
    fn validate(&self) -> ApiResult<()> {
        let mut v = Validator::new();
        v.required_text("name", &self.name, MAX_NAME_LEN)
            .optional_text("description", self.description.as_deref(), MAX_DESCRIPTION_LEN)
            .range("price_cents", self.price_cents, 0, MAX_PRICE_CENTS);
        v.finish()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateService {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price_cents: Option<i64>,
    pub billing_interval: Option<BillingInterval>,
    pub active: Option<bool>,
}

impl Validate for UpdateService {
    fn validate(&self) -> ApiResult<()> {
        let mut v = Validator::new();
        v.non_blank_if_present("name", self.name.as_deref(), MAX_NAME_LEN)
            .optional_text("description", self.description.as_deref(), MAX_DESCRIPTION_LEN);
        if let Some(price) = self.price_cents {
            v.range("price_cents", price, 0, MAX_PRICE_CENTS);
        }
        v.finish()
    }
}

pub async fn list(State(state): State<AppState>, principal: Principal) -> ApiResult<Json<Vec<Service>>> {
    let only_active = !principal.is_admin();
    Ok(Json(db::services::list(&state.pool, only_active).await?))
}

pub async fn create(
    State(state): State<AppState>,
    principal: Principal,
    ApiJson(body): ApiJson<CreateService>,
) -> ApiResult<(StatusCode, Json<Service>)> {
    principal.require_admin()?;
    body.validate()?;
    let service = db::services::insert(
        &state.pool,
        &NewService {
            name: sanitize_text(&body.name),
            description: sanitize_opt(body.description.as_deref()),
            price_cents: body.price_cents,
            billing_interval: body.billing_interval,
        },
    )
    .await?;
    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "service.created",
        "service",
        Some(service.id),
        json!({ "name": service.name, "price_cents": service.price_cents }),
    )
    .await;
    Ok((StatusCode::CREATED, Json(service)))
}

pub async fn update(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
    ApiJson(body): ApiJson<UpdateService>,
) -> ApiResult<Json<Service>> {
    principal.require_admin()?;
    body.validate()?;
    let changes = ServiceChanges {
        name: body.name.as_deref().map(sanitize_text),
        description: body.description.as_deref().map(sanitize_text),
        price_cents: body.price_cents,
        billing_interval: body.billing_interval,
        active: body.active,
    };
    let service = db::services::update(&state.pool, id, &changes)
        .await?
        .ok_or(ApiError::NotFound("service"))?;
    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "service.updated",
        "service",
        Some(id),
        json!({
            "name": body.name,
            "price_cents": body.price_cents,
            "billing_interval": body.billing_interval,
            "active": body.active,
        }),
    )
    .await;
    // price and interval feed MRR
    state.cache.delete(super::CACHE_MRR);
    Ok(Json(service))
}

/// Services are never hard-deleted; existing subscriptions keep referencing them.
pub async fn deactivate(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
) -> ApiResult<Json<Service>> {
    principal.require_admin()?;
    let changes = ServiceChanges {
        active: Some(false),
        ..Default::default()
    };
    let service = db::services::update(&state.pool, id, &changes)
        .await?
        .ok_or(ApiError::NotFound("service"))?;
    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "service.deactivated",
        "service",
        Some(id),
        json!({ "name": service.name }),
    )
    .await;
    Ok(Json(service))
}
