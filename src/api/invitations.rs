use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::{ApiJson, ApiQuery, AppState};
use crate::auth::{generate_token, hash_token, Principal};
use crate::db;
use crate::db::invitations::NewInvitation;
use crate::email::{self, EmailTemplate};
use crate::error::{ApiError, ApiResult};
use crate::model::{Invitation, Role, User};
use crate::sanitize::{normalize_email, sanitize_text};
use crate::validation::{FieldError, Validate, Validator, MAX_NAME_LEN};

#[derive(Debug, Deserialize)]
pub struct CreateInvitation {
    pub email: String,
    pub role: Role,
    pub company_id: Option<i64>,
}

impl Validate for CreateInvitation {
    fn validate(&self) -> ApiResult<()> {
        let mut v = Validator::new();
        v.email("email", &self.email);
        match (self.role, self.company_id) {
            (Role::Client, None) => {
                v.error("company_id", "is required for client invitations");
            }
            (Role::Admin, Some(_)) => {
                v.error("company_id", "must be empty for admin invitations");
            }
            _ => {}
        }
        v.finish()
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<InvitationStatus>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    Pending,
    Accepted,
}

#[derive(Debug, Deserialize)]
pub struct AcceptInvitation {
    pub token: String,
    pub full_name: String,
}

impl Validate for AcceptInvitation {
    fn validate(&self) -> ApiResult<()> {
        let mut v = Validator::new();
        v.required_text("token", &self.token, MAX_NAME_LEN)
            .required_text("full_name", &self.full_name, MAX_NAME_LEN);
        v.finish()
    }
}

/// The raw token is only ever returned here.
#[derive(Debug, Serialize)]
pub struct Issued<T> {
    #[serde(flatten)]
    pub inner: T,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct CreatedInvitation {
    pub invitation: Invitation,
}

#[derive(Debug, Serialize)]
pub struct AcceptedInvitation {
    pub user: User,
}

pub async fn create(
    State(state): State<AppState>,
    principal: Principal,
    ApiJson(body): ApiJson<CreateInvitation>,
) -> ApiResult<(StatusCode, Json<Issued<CreatedInvitation>>)> {
    principal.require_admin()?;
    body.validate()?;
    let email = normalize_email(&body.email);
    let company = match body.company_id {
        Some(cid) => Some(super::companies::load(&state, cid).await?),
        None => None,
    };

    if db::users::find_by_email(&state.pool, &email).await?.is_some() {
        return Err(ApiError::conflict("a user with this email already exists"));
    }
    let now = Utc::now();
    if db::invitations::find_pending_by_email(&state.pool, &email, now)
        .await?
        .is_some()
    {
        return Err(ApiError::conflict("an invitation for this email is already pending"));
    }

    let token = generate_token();
    let invitation = db::invitations::insert(
        &state.pool,
        &NewInvitation {
            email: &email,
            company_id: body.company_id,
            role: body.role,
            token_hash: &hash_token(&token),
            invited_by: principal.user_id,
            expires_at: now + Duration::hours(state.cfg.invitations.ttl_hours),
        },
    )
    .await?;

    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "invitation.created",
        "invitation",
        Some(invitation.id),
        json!({ "email": invitation.email, "role": invitation.role, "company_id": invitation.company_id }),
    )
    .await;

    let ctx = json!({
        "company_name": company.as_ref().map_or("the agency", |c| c.name.as_str()),
        "inviter_name": principal.full_name,
        "accept_url": format!("{}/invite?token={}", state.mailer.public_url(), token),
        "expires_at": invitation.expires_at.format("%Y-%m-%d %H:%M UTC").to_string(),
    });
    email::queue(&state.pool, &state.mailer, EmailTemplate::Invitation, &email, &ctx).await;

    Ok((
        StatusCode::CREATED,
        Json(Issued {
            inner: CreatedInvitation { invitation },
            token,
        }),
    ))
}

pub async fn list(
    State(state): State<AppState>,
    principal: Principal,
    ApiQuery(q): ApiQuery<ListQuery>,
) -> ApiResult<Json<Vec<Invitation>>> {
    principal.require_admin()?;
    let accepted = q.status.map(|s| matches!(s, InvitationStatus::Accepted));
    Ok(Json(db::invitations::list(&state.pool, accepted).await?))
}

pub async fn revoke(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    principal.require_admin()?;
    let invitation = db::invitations::get(&state.pool, id)
        .await?
        .ok_or(ApiError::NotFound("invitation"))?;
    if invitation.accepted_at.is_some() {
        return Err(ApiError::conflict("invitation has already been accepted"));
    }
    db::invitations::delete(&state.pool, id).await?;
    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "invitation.revoked",
        "invitation",
        Some(id),
        json!({ "email": invitation.email }),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}

/// Public: turns an invitation token into an account and its first API token.
pub async fn accept(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<AcceptInvitation>,
) -> ApiResult<(StatusCode, Json<Issued<AcceptedInvitation>>)> {
    body.validate()?;
    let invitation = db::invitations::find_by_token_hash(&state.pool, &hash_token(body.token.trim()))
        .await?
        .ok_or(ApiError::NotFound("invitation"))?;
    if invitation.accepted_at.is_some() {
        return Err(ApiError::conflict("invitation has already been accepted"));
    }
    if invitation.expires_at <= Utc::now() {
        return Err(ApiError::Validation {
            message: "invitation has expired".into(),
            fields: vec![FieldError::new("token", "has expired")],
        });
    }
    if db::users::find_by_email(&state.pool, &invitation.email)
        .await?
        .is_some()
    {
        return Err(ApiError::conflict("a user with this email already exists"));
    }

    let api_token = generate_token();
    let user = db::invitations::accept(
        &state.pool,
        &invitation,
        &sanitize_text(&body.full_name),
        &hash_token(&api_token),
    )
    .await?
    .ok_or_else(|| ApiError::conflict("invitation has already been accepted"))?;

    info!(user_id = user.id, role = user.role.as_str(), "invitation accepted");
    db::audit::record(
        &state.pool,
        Some(user.id),
        "invitation.accepted",
        "invitation",
        Some(invitation.id),
        json!({ "user_id": user.id, "email": user.email }),
    )
    .await;
    Ok((
        StatusCode::CREATED,
        Json(Issued {
            inner: AcceptedInvitation { user },
            token: api_token,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_invitations_need_a_company() {
        let inv = CreateInvitation {
            email: "new@client.test".into(),
            role: Role::Client,
            company_id: None,
        };
        assert!(inv.validate().is_err());
        let inv = CreateInvitation {
            company_id: Some(1),
            ..inv
        };
        assert!(inv.validate().is_ok());
        let inv = CreateInvitation {
            role: Role::Admin,
            ..inv
        };
        assert!(inv.validate().is_err());
    }
}
