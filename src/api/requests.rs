use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiJson, ApiQuery, AppState};
use crate::auth::Principal;
use crate::db;
use crate::db::requests::{MoveOutcome, NewRequest, RequestChanges, RequestFilter};
use crate::email::{self, EmailTemplate};
use crate::error::{ApiError, ApiResult};
use crate::model::{
    Comment, CompanyStatus, Priority, Request, RequestStatus, Role, WorkflowTrigger,
};
use crate::notify::{self, Audience};
use crate::sanitize::sanitize_text;
use crate::transitions;
use crate::validation::{
    FieldError, Pagination, Validate, Validator, MAX_COMMENT_LEN, MAX_DESCRIPTION_LEN, MAX_TITLE_LEN,
};
use crate::workflow::RequestEvent;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<RequestStatus>,
    pub company_id: Option<i64>,
    pub assigned_to: Option<i64>,
    pub priority: Option<Priority>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub company_id: Option<i64>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub service_id: Option<i64>,
    pub template_id: Option<i64>,
    pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub service_id: Option<i64>,
    pub due_date: Option<NaiveDate>,
}

impl Validate for UpdateRequest {
    fn validate(&self) -> ApiResult<()> {
        let mut v = Validator::new();
        v.non_blank_if_present("title", self.title.as_deref(), MAX_TITLE_LEN);
        v.optional_text("description", self.description.as_deref(), MAX_DESCRIPTION_LEN);
        v.finish()
    }
}

#[derive(Debug, Deserialize)]
pub struct MoveBody {
    pub status: RequestStatus,
    pub position: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AssignBody {
    pub user_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct BoardQuery {
    pub company_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateComment {
    pub body: String,
    #[serde(default)]
    pub is_internal: bool,
}

impl Validate for CreateComment {
    fn validate(&self) -> ApiResult<()> {
        let mut v = Validator::new();
        v.required_text("body", &self.body, MAX_COMMENT_LEN);
        v.finish()
    }
}

/// Loads a request the caller may see.
async fn load(state: &AppState, principal: &Principal, id: i64) -> ApiResult<Request> {
    let request = db::requests::get(&state.pool, id)
        .await?
        .ok_or(ApiError::NotFound("request"))?;
    if principal.ensure_company_access(request.company_id).is_err() {
        // Do not reveal requests of other tenants.
        return Err(ApiError::NotFound("request"));
    }
    Ok(request)
}

/// Resolves the company filter for a caller: clients are pinned to theirs.
fn scoped_company(principal: &Principal, requested: Option<i64>) -> ApiResult<Option<i64>> {
    match principal.company_scope()? {
        None => Ok(requested),
        Some(own) => match requested {
            Some(other) if other != own => Err(ApiError::forbidden("no access to this company")),
            _ => Ok(Some(own)),
        },
    }
}

pub async fn list(
    State(state): State<AppState>,
    principal: Principal,
    ApiQuery(q): ApiQuery<ListQuery>,
) -> ApiResult<Json<Vec<Request>>> {
    let (limit, offset) = Pagination {
        limit: q.limit,
        offset: q.offset,
    }
    .resolve()?;
    let filter = RequestFilter {
        company_id: scoped_company(&principal, q.company_id)?,
        status: q.status,
        assigned_to: q.assigned_to,
        priority: q.priority,
    };
    Ok(Json(db::requests::list(&state.pool, &filter, limit, offset).await?))
}

pub async fn create(
    State(state): State<AppState>,
    principal: Principal,
    ApiJson(body): ApiJson<CreateRequest>,
) -> ApiResult<(StatusCode, Json<Request>)> {
    let company_id = match principal.company_scope()? {
        Some(own) => {
            if body.company_id.is_some_and(|c| c != own) {
                return Err(ApiError::forbidden("no access to this company"));
            }
            own
        }
        None => body.company_id.ok_or_else(|| ApiError::Validation {
            message: "invalid input".into(),
            fields: vec![FieldError::new("company_id", "is required")],
        })?,
    };
    let company = super::companies::load(&state, company_id).await?;
    if company.status == CompanyStatus::Churned {
        return Err(ApiError::conflict("company is no longer a client"));
    }

    let template = match body.template_id {
        Some(tid) => Some(
            db::templates::get(&state.pool, tid)
                .await?
                .ok_or(ApiError::NotFound("template"))?,
        ),
        None => None,
    };
    let title = body
        .title
        .clone()
        .or_else(|| template.as_ref().map(|t| t.title.clone()))
        .unwrap_or_default();
    let description = body
        .description
        .clone()
        .or_else(|| template.as_ref().map(|t| t.description.clone()))
        .unwrap_or_default();
    let mut v = Validator::new();
    v.required_text("title", &title, MAX_TITLE_LEN);
    v.optional_text("description", Some(&description), MAX_DESCRIPTION_LEN);
    v.finish()?;

    let service_id = body
        .service_id
        .or_else(|| template.as_ref().and_then(|t| t.service_id));
    if let Some(sid) = service_id {
        db::services::get(&state.pool, sid)
            .await?
            .ok_or(ApiError::NotFound("service"))?;
    }

    let request = db::requests::insert(
        &state.pool,
        &NewRequest {
            company_id,
            title: sanitize_text(&title),
            description: sanitize_text(&description),
            priority: body
                .priority
                .or_else(|| template.as_ref().map(|t| t.default_priority))
                .unwrap_or(Priority::Medium),
            service_id,
            template_id: template.as_ref().map(|t| t.id),
            due_date: body.due_date,
            created_by: principal.user_id,
        },
    )
    .await?;

    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "request.created",
        "request",
        Some(request.id),
        json!({ "company_id": company_id, "title": request.title }),
    )
    .await;
    if !principal.is_admin() {
        let mut audience = Audience::new();
        audience.add_users(&notify::admins(&state.pool).await);
        notify::send(
            &state.pool,
            &audience,
            "request_created",
            &format!("New request from {}", company.name),
            &request.title,
            Some(request.id),
        )
        .await;
    }
    state
        .workflows
        .handle(&RequestEvent::new(
            WorkflowTrigger::RequestCreated,
            request.clone(),
            Some(principal.user_id),
        ))
        .await;
    state.invalidate_boards();
    Ok((StatusCode::CREATED, Json(request)))
}

pub async fn show(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
) -> ApiResult<Json<Request>> {
    Ok(Json(load(&state, &principal, id).await?))
}

pub async fn update(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
    ApiJson(body): ApiJson<UpdateRequest>,
) -> ApiResult<Json<Request>> {
    let before = load(&state, &principal, id).await?;
    body.validate()?;
    if body.service_id.is_some() && !principal.is_admin() {
        return Err(ApiError::forbidden("only admins may change the service"));
    }
    if let Some(sid) = body.service_id {
        db::services::get(&state.pool, sid)
            .await?
            .ok_or(ApiError::NotFound("service"))?;
    }
    let changes = RequestChanges {
        title: body.title.as_deref().map(sanitize_text),
        // A blank description clears it.
        description: body.description.as_deref().map(sanitize_text),
        priority: body.priority,
        service_id: body.service_id,
        due_date: body.due_date,
    };
    let updated = db::requests::update(&state.pool, id, &changes)
        .await?
        .ok_or(ApiError::NotFound("request"))?;

    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "request.updated",
        "request",
        Some(id),
        json!({
            "title": body.title,
            "priority": body.priority,
            "service_id": body.service_id,
            "due_date": body.due_date,
        }),
    )
    .await;
    if updated.priority != before.priority {
        state
            .workflows
            .handle(&RequestEvent::new(
                WorkflowTrigger::PriorityChanged,
                updated.clone(),
                Some(principal.user_id),
            ))
            .await;
    }
    state.invalidate_boards();
    Ok(Json(updated))
}

pub async fn remove(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    principal.require_admin()?;
    let request = load(&state, &principal, id).await?;
    db::requests::delete(&state.pool, id).await?;
    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "request.deleted",
        "request",
        Some(id),
        json!({ "company_id": request.company_id, "title": request.title }),
    )
    .await;
    state.invalidate_boards();
    Ok(StatusCode::NO_CONTENT)
}

pub async fn move_request(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
    ApiJson(body): ApiJson<MoveBody>,
) -> ApiResult<Json<Request>> {
    let before = load(&state, &principal, id).await?;
    transitions::check_move(principal.role, before.status, body.status)?;
    if body.position.is_some_and(|p| p < 0) {
        return Err(ApiError::Validation {
            message: "invalid input".into(),
            fields: vec![FieldError::new("position", "must be >= 0")],
        });
    }

    let company = super::companies::load(&state, before.company_id).await?;
    let entering_active = body.status == RequestStatus::Active && before.status != RequestStatus::Active;
    if entering_active && principal.role == Role::Client && company.status != CompanyStatus::Active {
        return Err(ApiError::conflict(format!(
            "company is {}; requests cannot be activated",
            company.status.as_str()
        )));
    }

    let moved = match db::requests::move_to(
        &state.pool,
        id,
        body.status,
        body.position,
        Some(company.active_request_limit),
    )
    .await?
    {
        MoveOutcome::Moved(r) => r,
        MoveOutcome::OverCapacity { limit, active } => {
            return Err(ApiError::conflict(format!(
                "active request limit reached ({active}/{limit})"
            )))
        }
        MoveOutcome::Missing => return Err(ApiError::NotFound("request")),
    };

    if moved.status == before.status {
        state.invalidate_boards();
        return Ok(Json(moved));
    }

    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "request.moved",
        "request",
        Some(id),
        json!({ "from": before.status, "to": moved.status, "position": moved.position }),
    )
    .await;

    let (mut audience, company_users) = notify::request_watchers(&state.pool, &moved).await;
    audience.without(principal.user_id);
    notify::send(
        &state.pool,
        &audience,
        "status_changed",
        &format!("{} moved to {}", moved.title, moved.status.as_str()),
        &format!(
            "{} moved the request from {} to {}.",
            principal.full_name,
            before.status.as_str(),
            moved.status.as_str()
        ),
        Some(moved.id),
    )
    .await;
    let ctx = json!({
        "request": { "id": moved.id, "title": moved.title },
        "from_status": before.status.as_str(),
        "to_status": moved.status.as_str(),
        "request_url": state.mailer.request_url(moved.id),
    });
    for user in company_users.iter().filter(|u| u.id != principal.user_id) {
        email::queue(
            &state.pool,
            &state.mailer,
            EmailTemplate::RequestStatusChanged,
            &user.email,
            &ctx,
        )
        .await;
    }

    state
        .workflows
        .handle(&RequestEvent::status_changed(
            moved.clone(),
            before.status,
            Some(principal.user_id),
        ))
        .await;
    state.invalidate_boards();
    Ok(Json(moved))
}

pub async fn assign(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
    ApiJson(body): ApiJson<AssignBody>,
) -> ApiResult<Json<Request>> {
    principal.require_admin()?;
    load(&state, &principal, id).await?;
    if let Some(uid) = body.user_id {
        let user = db::users::get(&state.pool, uid)
            .await?
            .ok_or(ApiError::NotFound("user"))?;
        if user.role != Role::Admin {
            return Err(ApiError::Validation {
                message: "invalid input".into(),
                fields: vec![FieldError::new(
                    "user_id",
                    "assignee must be an admin",
                )],
            });
        }
    }
    let request = db::requests::assign(&state.pool, id, body.user_id)
        .await?
        .ok_or(ApiError::NotFound("request"))?;
    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "request.assigned",
        "request",
        Some(id),
        json!({ "assigned_to": body.user_id }),
    )
    .await;
    if let Some(uid) = body.user_id.filter(|uid| *uid != principal.user_id) {
        let mut audience = Audience::new();
        audience.add(Some(uid));
        notify::send(
            &state.pool,
            &audience,
            "assigned",
            &format!("You were assigned: {}", request.title),
            &format!("{} assigned this request to you.", principal.full_name),
            Some(request.id),
        )
        .await;
    }
    state.invalidate_boards();
    Ok(Json(request))
}

pub async fn board(
    State(state): State<AppState>,
    principal: Principal,
    ApiQuery(q): ApiQuery<BoardQuery>,
) -> ApiResult<Json<Value>> {
    let company_id = scoped_company(&principal, q.company_id)?;
    let key = format!(
        "board:{}",
        company_id.map_or_else(|| "all".to_string(), |c| c.to_string())
    );
    if let Some(hit) = state.cache.get(&key) {
        return Ok(Json(hit));
    }
    let requests = db::requests::board(&state.pool, company_id).await?;
    let columns: Vec<Value> = RequestStatus::ALL
        .iter()
        .map(|status| {
            let items: Vec<&Request> = requests.iter().filter(|r| r.status == *status).collect();
            json!({ "status": status, "count": items.len(), "requests": items })
        })
        .collect();
    let body = json!({ "company_id": company_id, "columns": columns });
    state.cache.set(key, body.clone());
    Ok(Json(body))
}

pub async fn list_comments(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<Comment>>> {
    load(&state, &principal, id).await?;
    Ok(Json(
        db::comments::list(&state.pool, id, principal.is_admin()).await?,
    ))
}

pub async fn add_comment(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
    ApiJson(body): ApiJson<CreateComment>,
) -> ApiResult<(StatusCode, Json<Comment>)> {
    let request = load(&state, &principal, id).await?;
    body.validate()?;
    if body.is_internal && !principal.is_admin() {
        return Err(ApiError::forbidden("only admins may post internal notes"));
    }
    let text = sanitize_text(&body.body);
    let comment =
        db::comments::insert(&state.pool, id, principal.user_id, &text, body.is_internal).await?;

    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "comment.created",
        "request",
        Some(id),
        json!({ "comment_id": comment.id, "internal": comment.is_internal }),
    )
    .await;

    // Notify the other side of the conversation.
    let mut audience = Audience::new();
    let mut emails = Vec::new();
    if principal.is_admin() {
        if !comment.is_internal {
            let company_users = notify::company_users(&state.pool, request.company_id).await;
            audience.add_users(&company_users);
            emails.extend(company_users.into_iter().map(|u| u.email));
        }
        audience.add(request.assigned_to);
    } else if request.assigned_to.is_some() {
        audience.add(request.assigned_to);
    } else {
        audience.add_users(&notify::admins(&state.pool).await);
    }
    audience.without(principal.user_id);
    notify::send(
        &state.pool,
        &audience,
        "comment_added",
        &format!("New comment on {}", request.title),
        &text,
        Some(request.id),
    )
    .await;
    let ctx = json!({
        "request": { "id": request.id, "title": request.title },
        "author_name": principal.full_name,
        "body": text,
        "request_url": state.mailer.request_url(request.id),
    });
    for to in emails.iter().filter(|e| **e != principal.email) {
        email::queue(&state.pool, &state.mailer, EmailTemplate::CommentAdded, to, &ctx).await;
    }

    state
        .workflows
        .handle(&RequestEvent::new(
            WorkflowTrigger::CommentAdded,
            request,
            Some(principal.user_id),
        ))
        .await;
    state.invalidate_boards();
    Ok((StatusCode::CREATED, Json(comment)))
}
