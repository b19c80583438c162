use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::{Row, Sqlite, Transaction};
use tracing::instrument;

use super::Pool;
use crate::model::{OutboxKind, OutboxTask};

const BASE_BACKOFF_SECS: i64 = 5;

#[instrument(skip_all)]
pub async fn enqueue(pool: &Pool, kind: OutboxKind, payload: &Value, due_at: DateTime<Utc>) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id = enqueue_tx(&mut tx, kind, payload, due_at).await?;
    tx.commit().await?;
    Ok(id)
}

/// Enqueue inside a caller's transaction so the task commits with the write
/// that caused it.
pub async fn enqueue_tx(
    tx: &mut Transaction<'_, Sqlite>,
    kind: OutboxKind,
    payload: &Value,
    due_at: DateTime<Utc>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO outbox (kind, payload, attempt, due_at, created_at) VALUES (?, ?, 0, ?, ?) RETURNING id",
    )
    .bind(kind.as_str())
    .bind(payload.to_string())
    .bind(due_at)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn next_due(pool: &Pool) -> Result<Option<OutboxTask>> {
    next_due_at(pool, Utc::now()).await
}

pub async fn next_due_at(pool: &Pool, now: DateTime<Utc>) -> Result<Option<OutboxTask>> {
    let row = sqlx::query(
        "SELECT id, kind, payload, attempt FROM outbox \
         WHERE datetime(due_at) <= datetime(?) ORDER BY datetime(due_at) ASC, id ASC LIMIT 1",
    )
    .bind(now)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let kind: String = row.get("kind");
    let payload: String = row.get("payload");
    Ok(Some(OutboxTask {
        id: row.get("id"),
        kind: OutboxKind::parse_kind(&kind).ok_or_else(|| anyhow!("unknown outbox kind {kind}"))?,
        payload: serde_json::from_str(&payload)?,
        attempt: row.get("attempt"),
    }))
}

#[instrument(skip_all)]
pub async fn delete(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM outbox WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delay before retry number `attempt + 1`: 5s * 2^attempt, capped.
/// A non-positive cap means uncapped.
pub fn backoff_delay(attempt: i32, max_cap_secs: i64) -> i64 {
    let secs = BASE_BACKOFF_SECS * (1_i64 << attempt.clamp(0, 20));
    if max_cap_secs <= 0 {
        secs
    } else {
        secs.min(max_cap_secs)
    }
}

#[instrument(skip_all)]
pub async fn backoff_with_cap(pool: &Pool, id: i64, attempt: i32, max_cap_secs: i64) -> Result<()> {
    let due_at = Utc::now() + Duration::seconds(backoff_delay(attempt, max_cap_secs));
    sqlx::query("UPDATE outbox SET attempt = ?, due_at = ? WHERE id = ?")
        .bind(attempt + 1)
        .bind(due_at)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn count_remaining(pool: &Pool) -> Result<i64> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
        .fetch_one(pool)
        .await?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use serde_json::json;

    #[test]
    fn backoff_doubles_until_cap() {
        assert_eq!(backoff_delay(0, 3600), 5);
        assert_eq!(backoff_delay(1, 3600), 10);
        assert_eq!(backoff_delay(4, 3600), 80);
        assert_eq!(backoff_delay(12, 3600), 3600);
        assert_eq!(backoff_delay(3, 0), 40);
    }

    #[tokio::test]
    async fn due_tasks_come_out_in_order_and_back_off() {
        let pool = memory_pool().await.unwrap();
        let now = Utc::now();
        let later = enqueue(&pool, OutboxKind::SendEmail, &json!({"n": 2}), now - Duration::seconds(1))
            .await
            .unwrap();
        let first = enqueue(&pool, OutboxKind::SendEmail, &json!({"n": 1}), now - Duration::seconds(60))
            .await
            .unwrap();
        enqueue(&pool, OutboxKind::SendEmail, &json!({"n": 3}), now + Duration::hours(1))
            .await
            .unwrap();

        let task = next_due(&pool).await.unwrap().unwrap();
        assert_eq!(task.id, first);
        assert_eq!(task.payload, json!({"n": 1}));
        assert_eq!(task.attempt, 0);

        backoff_with_cap(&pool, task.id, task.attempt, 60).await.unwrap();
        let task = next_due(&pool).await.unwrap().unwrap();
        assert_eq!(task.id, later);
        delete(&pool, task.id).await.unwrap();

        assert!(next_due(&pool).await.unwrap().is_none());
        let retried = next_due_at(&pool, now + Duration::seconds(30)).await.unwrap().unwrap();
        assert_eq!((retried.id, retried.attempt), (first, 1));
        assert_eq!(count_remaining(&pool).await.unwrap(), 2);
    }
}
