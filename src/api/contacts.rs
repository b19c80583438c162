use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::{ApiJson, AppState};
use crate::auth::Principal;
use crate::db;
use crate::db::contacts::{ContactChanges, NewContact};
use crate::error::{ApiError, ApiResult};
use crate::model::Contact;
use crate::sanitize::{normalize_email, sanitize_opt, sanitize_text};
use crate::validation::{Validate, Validator, MAX_NAME_LEN};

const MAX_PHONE_LEN: usize = 50;

#[derive(Debug, Deserialize)]
pub struct CreateContact {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub is_primary: bool,
}

impl Validate for CreateContact {
    fn validate(&self) -> ApiResult<()> {
        let mut v = Validator::new();
        v.required_text("name", &self.name, MAX_NAME_LEN)
            .email("email", &self.email)
            .optional_text("phone", self.phone.as_deref(), MAX_PHONE_LEN)
            .optional_text("title", self.title.as_deref(), MAX_NAME_LEN);
        v.finish()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateContact {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub title: Option<String>,
    pub is_primary: Option<bool>,
}

impl Validate for UpdateContact {
    fn validate(&self) -> ApiResult<()> {
        let mut v = Validator::new();
        v.non_blank_if_present("name", self.name.as_deref(), MAX_NAME_LEN)
            .optional_text("phone", self.phone.as_deref(), MAX_PHONE_LEN)
            .optional_text("title", self.title.as_deref(), MAX_NAME_LEN);
        if let Some(email) = &self.email {
            v.email("email", email);
        }
        v.finish()
    }
}

/// Contact plus an access check against its company.
async fn load(state: &AppState, principal: &Principal, id: i64) -> ApiResult<Contact> {
    let contact = db::contacts::get(&state.pool, id)
        .await?
        .ok_or(ApiError::NotFound("contact"))?;
    principal.ensure_company_access(contact.company_id)?;
    Ok(contact)
}

pub async fn list(
    State(state): State<AppState>,
    principal: Principal,
    Path(company_id): Path<i64>,
) -> ApiResult<Json<Vec<Contact>>> {
    principal.ensure_company_access(company_id)?;
    super::companies::load(&state, company_id).await?;
    Ok(Json(db::contacts::list_by_company(&state.pool, company_id).await?))
}

pub async fn create(
    State(state): State<AppState>,
    principal: Principal,
    Path(company_id): Path<i64>,
    ApiJson(body): ApiJson<CreateContact>,
) -> ApiResult<(StatusCode, Json<Contact>)> {
    principal.ensure_company_access(company_id)?;
    body.validate()?;
    super::companies::load(&state, company_id).await?;
    let contact = db::contacts::insert(
        &state.pool,
        company_id,
        &NewContact {
            name: sanitize_text(&body.name),
            email: normalize_email(&body.email),
            phone: sanitize_opt(body.phone.as_deref()),
            title: sanitize_opt(body.title.as_deref()),
            is_primary: body.is_primary,
        },
    )
    .await?;
    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "contact.created",
        "contact",
        Some(contact.id),
        json!({ "company_id": company_id, "email": contact.email }),
    )
    .await;
    Ok((StatusCode::CREATED, Json(contact)))
}

pub async fn update(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
    ApiJson(body): ApiJson<UpdateContact>,
) -> ApiResult<Json<Contact>> {
    load(&state, &principal, id).await?;
    body.validate()?;
    let changes = ContactChanges {
        name: body.name.as_deref().map(sanitize_text),
        email: body.email.as_deref().map(normalize_email),
        phone: body.phone.as_deref().map(sanitize_text),
        title: body.title.as_deref().map(sanitize_text),
        is_primary: body.is_primary,
    };
    let contact = db::contacts::update(&state.pool, id, &changes)
        .await?
        .ok_or(ApiError::NotFound("contact"))?;
    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "contact.updated",
        "contact",
        Some(id),
        json!({ "company_id": contact.company_id, "is_primary": body.is_primary }),
    )
    .await;
    Ok(Json(contact))
}

pub async fn remove(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let contact = load(&state, &principal, id).await?;
    db::contacts::delete(&state.pool, id).await?;
    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "contact.deleted",
        "contact",
        Some(id),
        json!({ "company_id": contact.company_id, "email": contact.email }),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}
