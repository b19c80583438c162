use anyhow::Result;
use chrono::Utc;
use tracing::instrument;

use super::Pool;
use crate::model::Notification;

const COLUMNS: &str = "id, user_id, kind, title, body, request_id, read_at, created_at";

#[derive(Debug, Clone)]
pub struct NewNotification<'a> {
    pub user_id: i64,
    pub kind: &'a str,
    pub title: &'a str,
    pub body: &'a str,
    pub request_id: Option<i64>,
}

#[instrument(skip_all)]
pub async fn insert(pool: &Pool, n: &NewNotification<'_>) -> Result<Notification> {
    let row = sqlx::query_as::<_, Notification>(&format!(
        "INSERT INTO notifications (user_id, kind, title, body, request_id, created_at) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING {COLUMNS}"
    ))
    .bind(n.user_id)
    .bind(n.kind)
    .bind(n.title)
    .bind(n.body)
    .bind(n.request_id)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn list(
    pool: &Pool,
    user_id: i64,
    unread_only: bool,
    limit: i64,
    offset: i64,
) -> Result<Vec<Notification>> {
    let filter = if unread_only { " AND read_at IS NULL" } else { "" };
    let rows = sqlx::query_as::<_, Notification>(&format!(
        "SELECT {COLUMNS} FROM notifications WHERE user_id = ?{filter} \
         ORDER BY id DESC LIMIT ? OFFSET ?"
    ))
    .bind(user_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn unread_count(pool: &Pool, user_id: i64) -> Result<i64> {
    let n: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM notifications WHERE user_id = ? AND read_at IS NULL")
            .bind(user_id)
            .fetch_one(pool)
            .await?;
    Ok(n)
}

/// Marks one of the user's notifications read; `None` if it is not theirs.
pub async fn mark_read(pool: &Pool, user_id: i64, id: i64) -> Result<Option<Notification>> {
    let row = sqlx::query_as::<_, Notification>(&format!(
        "UPDATE notifications SET read_at = COALESCE(read_at, ?) \
         WHERE id = ? AND user_id = ? RETURNING {COLUMNS}"
    ))
    .bind(Utc::now())
    .bind(id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn mark_all_read(pool: &Pool, user_id: i64) -> Result<u64> {
    let res = sqlx::query("UPDATE notifications SET read_at = ? WHERE user_id = ? AND read_at IS NULL")
        .bind(Utc::now())
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

pub async fn delete(pool: &Pool, user_id: i64, id: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM notifications WHERE id = ? AND user_id = ?")
        .bind(id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::users::{self, NewUser};
    use crate::db::memory_pool;
    use crate::model::Role;

    async fn user(pool: &Pool, email: &'static str, hash: &'static str) -> i64 {
        users::insert(
            pool,
            &NewUser {
                email,
                full_name: "U",
                role: Role::Admin,
                company_id: None,
                api_token_hash: hash,
            },
        )
        .await
        .unwrap()
        .id
    }

    fn note(user_id: i64, title: &str) -> NewNotification<'_> {
        NewNotification {
            user_id,
            kind: "status_changed",
            title,
            body: "",
            request_id: None,
        }
    }

    #[tokio::test]
    async fn reads_are_scoped_to_the_owner() {
        let pool = memory_pool().await.unwrap();
        let alice = user(&pool, "alice@example.com", "h1").await;
        let bob = user(&pool, "bob@example.com", "h2").await;

        let first = insert(&pool, &note(alice, "one")).await.unwrap();
        insert(&pool, &note(alice, "two")).await.unwrap();
        let bobs = insert(&pool, &note(bob, "three")).await.unwrap();

        assert_eq!(unread_count(&pool, alice).await.unwrap(), 2);
        assert!(mark_read(&pool, alice, bobs.id).await.unwrap().is_none());
        assert!(!delete(&pool, alice, bobs.id).await.unwrap());

        let read = mark_read(&pool, alice, first.id).await.unwrap().unwrap();
        assert!(read.read_at.is_some());
        assert_eq!(list(&pool, alice, true, 50, 0).await.unwrap().len(), 1);

        assert_eq!(mark_all_read(&pool, alice).await.unwrap(), 1);
        assert_eq!(unread_count(&pool, alice).await.unwrap(), 0);
        assert_eq!(unread_count(&pool, bob).await.unwrap(), 1);
        assert_eq!(list(&pool, alice, false, 50, 0).await.unwrap().len(), 2);
    }
}
