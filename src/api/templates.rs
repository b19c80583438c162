use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::{ApiJson, AppState};
use crate::auth::Principal;
use crate::db;
use crate::db::templates::{NewTemplate, TemplateChanges};
use crate::error::{ApiError, ApiResult};
use crate::model::{Priority, Template};
use crate::sanitize::sanitize_text;
use crate::validation::{Validate, Validator, MAX_DESCRIPTION_LEN, MAX_NAME_LEN, MAX_TITLE_LEN};

#[derive(Debug, Deserialize)]
pub struct CreateTemplate {
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub default_priority: Option<Priority>,
    pub service_id: Option<i64>,
}

impl Validate for CreateTemplate {
    fn validate(&self) -> ApiResult<()> {
        let mut v = Validator::new();
        v.required_text("name", &self.name, MAX_NAME_LEN)
            .required_text("title", &self.title, MAX_TITLE_LEN)
            .optional_text("description", Some(&self.description), MAX_DESCRIPTION_LEN);
        v.finish()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateTemplate {
    pub name: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub default_priority: Option<Priority>,
    pub service_id: Option<i64>,
}

impl Validate for UpdateTemplate {
    fn validate(&self) -> ApiResult<()> {
        let mut v = Validator::new();
        v.non_blank_if_present("name", self.name.as_deref(), MAX_NAME_LEN)
            .non_blank_if_present("title", self.title.as_deref(), MAX_TITLE_LEN)
            .optional_text("description", self.description.as_deref(), MAX_DESCRIPTION_LEN);
        v.finish()
    }
}

async fn ensure_service(state: &AppState, service_id: Option<i64>) -> ApiResult<()> {
    if let Some(sid) = service_id {
        db::services::get(&state.pool, sid)
            .await?
            .ok_or(ApiError::NotFound("service"))?;
    }
    Ok(())
}

pub async fn list(State(state): State<AppState>, _principal: Principal) -> ApiResult<Json<Vec<Template>>> {
    Ok(Json(db::templates::list(&state.pool).await?))
}

pub async fn show(
    State(state): State<AppState>,
    _principal: Principal,
    Path(id): Path<i64>,
) -> ApiResult<Json<Template>> {
    let template = db::templates::get(&state.pool, id)
        .await?
        .ok_or(ApiError::NotFound("template"))?;
    Ok(Json(template))
}

pub async fn create(
    State(state): State<AppState>,
    principal: Principal,
    ApiJson(body): ApiJson<CreateTemplate>,
) -> ApiResult<(StatusCode, Json<Template>)> {
    principal.require_admin()?;
    body.validate()?;
    ensure_service(&state, body.service_id).await?;
    let template = db::templates::insert(
        &state.pool,
        &NewTemplate {
            name: sanitize_text(&body.name),
            title: sanitize_text(&body.title),
            description: sanitize_text(&body.description),
            default_priority: body.default_priority.unwrap_or(Priority::Medium),
            service_id: body.service_id,
        },
    )
    .await?;
    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "template.created",
        "template",
        Some(template.id),
        json!({ "name": template.name }),
    )
    .await;
    Ok((StatusCode::CREATED, Json(template)))
}

pub async fn update(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
    ApiJson(body): ApiJson<UpdateTemplate>,
) -> ApiResult<Json<Template>> {
    principal.require_admin()?;
    body.validate()?;
    ensure_service(&state, body.service_id).await?;
    let changes = TemplateChanges {
        name: body.name.as_deref().map(sanitize_text),
        title: body.title.as_deref().map(sanitize_text),
        description: body.description.as_deref().map(sanitize_text),
        default_priority: body.default_priority,
        service_id: body.service_id,
    };
    let template = db::templates::update(&state.pool, id, &changes)
        .await?
        .ok_or(ApiError::NotFound("template"))?;
    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "template.updated",
        "template",
        Some(id),
        json!({ "name": body.name, "default_priority": body.default_priority }),
    )
    .await;
    Ok(Json(template))
}

pub async fn remove(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    principal.require_admin()?;
    if !db::templates::delete(&state.pool, id).await? {
        return Err(ApiError::NotFound("template"));
    }
    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "template.deleted",
        "template",
        Some(id),
        json!({}),
    )
    .await;
    // Requests drop their template reference.
    state.invalidate_boards();
    Ok(StatusCode::NO_CONTENT)
}
