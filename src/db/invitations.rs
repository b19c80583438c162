use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::instrument;

use super::Pool;
use super::users::{self, NewUser};
use crate::model::{Invitation, Role, User};

const COLUMNS: &str =
    "id, email, company_id, role, token_hash, invited_by, expires_at, accepted_at, created_at";

#[derive(Debug, Clone)]
pub struct NewInvitation<'a> {
    pub email: &'a str,
    pub company_id: Option<i64>,
    pub role: Role,
    pub token_hash: &'a str,
    pub invited_by: i64,
    pub expires_at: DateTime<Utc>,
}

#[instrument(skip_all)]
pub async fn insert(pool: &Pool, inv: &NewInvitation<'_>) -> Result<Invitation> {
    let row = sqlx::query_as::<_, Invitation>(&format!(
        "INSERT INTO invitations (email, company_id, role, token_hash, invited_by, expires_at, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING {COLUMNS}"
    ))
    .bind(inv.email)
    .bind(inv.company_id)
    .bind(inv.role)
    .bind(inv.token_hash)
    .bind(inv.invited_by)
    .bind(inv.expires_at)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn get(pool: &Pool, id: i64) -> Result<Option<Invitation>> {
    let row = sqlx::query_as::<_, Invitation>(&format!("SELECT {COLUMNS} FROM invitations WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

#[instrument(skip_all)]
pub async fn find_by_token_hash(pool: &Pool, token_hash: &str) -> Result<Option<Invitation>> {
    let row = sqlx::query_as::<_, Invitation>(&format!(
        "SELECT {COLUMNS} FROM invitations WHERE token_hash = ?"
    ))
    .bind(token_hash)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// An unaccepted, unexpired invitation for this address, if any.
pub async fn find_pending_by_email(pool: &Pool, email: &str, now: DateTime<Utc>) -> Result<Option<Invitation>> {
    let row = sqlx::query_as::<_, Invitation>(&format!(
        "SELECT {COLUMNS} FROM invitations \
         WHERE email = ? AND accepted_at IS NULL AND datetime(expires_at) > datetime(?) \
         ORDER BY id DESC LIMIT 1"
    ))
    .bind(email)
    .bind(now)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn list(pool: &Pool, accepted: Option<bool>) -> Result<Vec<Invitation>> {
    let filter = match accepted {
        Some(true) => " WHERE accepted_at IS NOT NULL",
        Some(false) => " WHERE accepted_at IS NULL",
        None => "",
    };
    let rows = sqlx::query_as::<_, Invitation>(&format!(
        "SELECT {COLUMNS} FROM invitations{filter} ORDER BY id DESC"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Accepts the invitation and creates its user in one transaction. Returns
/// `None` if the invitation was accepted concurrently.
#[instrument(skip_all)]
pub async fn accept(
    pool: &Pool,
    inv: &Invitation,
    full_name: &str,
    api_token_hash: &str,
) -> Result<Option<User>> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query("UPDATE invitations SET accepted_at = ? WHERE id = ? AND accepted_at IS NULL")
        .bind(Utc::now())
        .bind(inv.id)
        .execute(&mut *tx)
        .await?;
    if res.rows_affected() == 0 {
        return Ok(None);
    }
    let user = users::insert(
        &mut *tx,
        &NewUser {
            email: &inv.email,
            full_name,
            role: inv.role,
            company_id: inv.company_id,
            api_token_hash,
        },
    )
    .await?;
    tx.commit().await?;
    Ok(Some(user))
}

pub async fn delete(pool: &Pool, id: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM invitations WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use chrono::Duration;

    #[tokio::test]
    async fn accept_creates_user_once() {
        let pool = memory_pool().await.unwrap();
        let admin = users::insert(
            &pool,
            &NewUser {
                email: "admin@agency.test",
                full_name: "Admin",
                role: Role::Admin,
                company_id: None,
                api_token_hash: "admin",
            },
        )
        .await
        .unwrap();
        let now = Utc::now();
        let inv = insert(
            &pool,
            &NewInvitation {
                email: "new@agency.test",
                company_id: None,
                role: Role::Admin,
                token_hash: "tok",
                invited_by: admin.id,
                expires_at: now + Duration::hours(1),
            },
        )
        .await
        .unwrap();

        assert!(find_pending_by_email(&pool, "new@agency.test", now).await.unwrap().is_some());
        assert!(find_pending_by_email(&pool, "new@agency.test", now + Duration::hours(2))
            .await
            .unwrap()
            .is_none());

        let user = accept(&pool, &inv, "New Person", "user-token").await.unwrap().unwrap();
        assert_eq!(user.email, "new@agency.test");
        assert!(accept(&pool, &inv, "Again", "other").await.unwrap().is_none());

        let stored = find_by_token_hash(&pool, "tok").await.unwrap().unwrap();
        assert!(stored.accepted_at.is_some());
        assert_eq!(list(&pool, Some(false)).await.unwrap().len(), 0);
        assert_eq!(list(&pool, Some(true)).await.unwrap().len(), 1);
    }
}
