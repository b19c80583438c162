//! Bearer-token authentication and role checks.
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::api::AppState;
use crate::db;
use crate::error::ApiError;
use crate::model::{Role, User};

const TOKEN_PREFIX: &str = "ap_";

/// The authenticated caller of a request.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: i64,
    pub email: String,
    pub full_name: String,
    pub role: Role,
    pub company_id: Option<i64>,
}

impl From<User> for Principal {
    fn from(u: User) -> Self {
        Self {
            user_id: u.id,
            email: u.email,
            full_name: u.full_name,
            role: u.role,
            company_id: u.company_id,
        }
    }
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ApiError::forbidden("admin access required"))
        }
    }

    /// Admins reach every company; clients only their own.
    pub fn ensure_company_access(&self, company_id: i64) -> Result<(), ApiError> {
        if self.is_admin() || self.company_id == Some(company_id) {
            Ok(())
        } else {
            Err(ApiError::forbidden("no access to this company"))
        }
    }

    /// Company a client is bound to. Admins get `None` (unscoped).
    pub fn company_scope(&self) -> Result<Option<i64>, ApiError> {
        match self.role {
            Role::Admin => Ok(None),
            Role::Client => self
                .company_id
                .map(Some)
                .ok_or_else(|| ApiError::forbidden("client account has no company")),
        }
    }
}

/// New random API token. Only its hash is stored.
pub fn generate_token() -> String {
    format!("{TOKEN_PREFIX}{}", Uuid::new_v4().simple())
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[async_trait]
impl FromRequestParts<AppState> for Principal {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(ApiError::Unauthorized)?;
        let user = db::users::find_by_token_hash(&state.pool, &hash_token(token))
            .await?
            .ok_or_else(|| {
                debug!("unknown api token");
                ApiError::Unauthorized
            })?;
        Ok(user.into())
    }
}
