use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::{ApiJson, ApiQuery, AppState};
use crate::auth::Principal;
use crate::db;
use crate::db::workflows::{NewWorkflow, WorkflowChanges};
use crate::error::{ApiError, ApiResult};
use crate::model::{Workflow, WorkflowExecution, WorkflowTrigger};
use crate::sanitize::sanitize_text;
use crate::validation::{Pagination, Validate, Validator, MAX_COMMENT_LEN, MAX_NAME_LEN};
use crate::workflow::{WorkflowAction, WorkflowConditions};

#[derive(Debug, Deserialize)]
pub struct CreateWorkflow {
    pub name: String,
    pub trigger: WorkflowTrigger,
    #[serde(default)]
    pub conditions: WorkflowConditions,
    pub action: WorkflowAction,
    #[serde(default = "enabled")]
    pub active: bool,
}

fn enabled() -> bool {
    true
}

impl Validate for CreateWorkflow {
    fn validate(&self) -> ApiResult<()> {
        let mut v = Validator::new();
        v.required_text("name", &self.name, MAX_NAME_LEN);
        check_action(&mut v, &self.action);
        v.finish()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateWorkflow {
    pub name: Option<String>,
    pub trigger: Option<WorkflowTrigger>,
    pub conditions: Option<WorkflowConditions>,
    pub action: Option<WorkflowAction>,
    pub active: Option<bool>,
}

impl Validate for UpdateWorkflow {
    fn validate(&self) -> ApiResult<()> {
        let mut v = Validator::new();
        v.non_blank_if_present("name", self.name.as_deref(), MAX_NAME_LEN);
        if let Some(action) = &self.action {
            check_action(&mut v, action);
        }
        v.finish()
    }
}

fn check_action(v: &mut Validator, action: &WorkflowAction) {
    match action {
        WorkflowAction::Notify { message, .. } => {
            v.required_text("action.message", message, MAX_COMMENT_LEN);
        }
        WorkflowAction::SendEmail { to, subject, body } => {
            v.email("action.to", to)
                .required_text("action.subject", subject, MAX_NAME_LEN)
                .required_text("action.body", body, MAX_COMMENT_LEN);
        }
        WorkflowAction::Reassign { .. }
        | WorkflowAction::ChangeStatus { .. }
        | WorkflowAction::ChangePriority { .. } => {}
    }
}

#[derive(Debug, Deserialize)]
pub struct ExecutionsQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list(State(state): State<AppState>, principal: Principal) -> ApiResult<Json<Vec<Workflow>>> {
    principal.require_admin()?;
    Ok(Json(db::workflows::list(&state.pool).await?))
}

pub async fn show(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
) -> ApiResult<Json<Workflow>> {
    principal.require_admin()?;
    let workflow = db::workflows::get(&state.pool, id)
        .await?
        .ok_or(ApiError::NotFound("workflow"))?;
    Ok(Json(workflow))
}

pub async fn create(
    State(state): State<AppState>,
    principal: Principal,
    ApiJson(body): ApiJson<CreateWorkflow>,
) -> ApiResult<(StatusCode, Json<Workflow>)> {
    principal.require_admin()?;
    body.validate()?;
    let workflow = db::workflows::insert(
        &state.pool,
        &NewWorkflow {
            name: sanitize_text(&body.name),
            trigger: body.trigger,
            conditions: body.conditions,
            action: body.action,
            active: body.active,
        },
    )
    .await?;
    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "workflow.created",
        "workflow",
        Some(workflow.id),
        json!({
            "name": workflow.name,
            "trigger": workflow.trigger,
            "action": workflow.action.0.kind(),
        }),
    )
    .await;
    Ok((StatusCode::CREATED, Json(workflow)))
}

pub async fn update(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
    ApiJson(body): ApiJson<UpdateWorkflow>,
) -> ApiResult<Json<Workflow>> {
    principal.require_admin()?;
    body.validate()?;
    let changes = WorkflowChanges {
        name: body.name.as_deref().map(sanitize_text),
        trigger: body.trigger,
        conditions: body.conditions,
        action: body.action,
        active: body.active,
    };
    let workflow = db::workflows::update(&state.pool, id, &changes)
        .await?
        .ok_or(ApiError::NotFound("workflow"))?;
    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "workflow.updated",
        "workflow",
        Some(id),
        json!({
            "name": workflow.name,
            "trigger": workflow.trigger,
            "active": workflow.active,
        }),
    )
    .await;
    Ok(Json(workflow))
}

pub async fn remove(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    principal.require_admin()?;
    if !db::workflows::delete(&state.pool, id).await? {
        return Err(ApiError::NotFound("workflow"));
    }
    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "workflow.deleted",
        "workflow",
        Some(id),
        json!({}),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn executions(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
    ApiQuery(q): ApiQuery<ExecutionsQuery>,
) -> ApiResult<Json<Vec<WorkflowExecution>>> {
    principal.require_admin()?;
    let (limit, offset) = Pagination {
        limit: q.limit,
        offset: q.offset,
    }
    .resolve()?;
    db::workflows::get(&state.pool, id)
        .await?
        .ok_or(ApiError::NotFound("workflow"))?;
    Ok(Json(
        db::workflows::list_executions(&state.pool, id, limit, offset).await?,
    ))
}
