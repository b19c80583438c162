use anyhow::Result;
use chrono::Utc;
use sqlx::Executor;
use sqlx::Sqlite;
use tracing::instrument;

use super::Pool;
use crate::model::{Role, User};

const COLUMNS: &str = "id, email, full_name, role, company_id, api_token_hash, created_at";

pub struct NewUser<'a> {
    pub email: &'a str,
    pub full_name: &'a str,
    pub role: Role,
    pub company_id: Option<i64>,
    pub api_token_hash: &'a str,
}

#[instrument(skip_all)]
pub async fn insert<'e, E>(exec: E, user: &NewUser<'_>) -> Result<User>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, User>(&format!(
        "INSERT INTO users (email, full_name, role, company_id, api_token_hash, created_at) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING {COLUMNS}"
    ))
    .bind(user.email)
    .bind(user.full_name)
    .bind(user.role)
    .bind(user.company_id)
    .bind(user.api_token_hash)
    .bind(Utc::now())
    .fetch_one(exec)
    .await?;
    Ok(row)
}

#[instrument(skip_all)]
pub async fn find_by_token_hash(pool: &Pool, token_hash: &str) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>(&format!(
        "SELECT {COLUMNS} FROM users WHERE api_token_hash = ?"
    ))
    .bind(token_hash)
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

#[instrument(skip_all)]
pub async fn get(pool: &Pool, id: i64) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>(&format!("SELECT {COLUMNS} FROM users WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(user)
}

#[instrument(skip_all)]
pub async fn find_by_email(pool: &Pool, email: &str) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>(&format!("SELECT {COLUMNS} FROM users WHERE email = ?"))
        .bind(email)
        .fetch_optional(pool)
        .await?;
    Ok(user)
}

pub async fn list_admins(pool: &Pool) -> Result<Vec<User>> {
    let users = sqlx::query_as::<_, User>(&format!(
        "SELECT {COLUMNS} FROM users WHERE role = 'admin' ORDER BY id"
    ))
    .fetch_all(pool)
    .await?;
    Ok(users)
}

pub async fn list_by_company(pool: &Pool, company_id: i64) -> Result<Vec<User>> {
    let users = sqlx::query_as::<_, User>(&format!(
        "SELECT {COLUMNS} FROM users WHERE company_id = ? ORDER BY id"
    ))
    .bind(company_id)
    .fetch_all(pool)
    .await?;
    Ok(users)
}

/// Replace a user's API token hash (token rotation).
pub async fn rotate_token(pool: &Pool, id: i64, token_hash: &str) -> Result<bool> {
    let res = sqlx::query("UPDATE users SET api_token_hash = ? WHERE id = ?")
        .bind(token_hash)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}
