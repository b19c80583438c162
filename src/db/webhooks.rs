use anyhow::Result;
use chrono::Utc;
use tracing::instrument;

use super::Pool;

/// Remember a webhook delivery. Returns `false` when the id was seen before.
#[instrument(skip_all, fields(delivery_id = %delivery_id))]
pub async fn record_delivery(pool: &Pool, delivery_id: &str, topic: &str) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO webhook_deliveries (delivery_id, topic, received_at) VALUES (?, ?, ?) \
         ON CONFLICT(delivery_id) DO NOTHING",
    )
    .bind(delivery_id)
    .bind(topic)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Forget a delivery so the sender's retry is processed again.
pub async fn forget_delivery(pool: &Pool, delivery_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM webhook_deliveries WHERE delivery_id = ?")
        .bind(delivery_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;

    #[tokio::test]
    async fn duplicate_deliveries_are_detected() {
        let pool = memory_pool().await.unwrap();
        assert!(record_delivery(&pool, "d-1", "subscription.created").await.unwrap());
        assert!(!record_delivery(&pool, "d-1", "subscription.created").await.unwrap());
        forget_delivery(&pool, "d-1").await.unwrap();
        assert!(record_delivery(&pool, "d-1", "subscription.created").await.unwrap());
    }
}
