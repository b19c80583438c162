use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite};
use tracing::{instrument, warn};

use super::Pool;
use crate::model::AuditLog;

const COLUMNS: &str = "id, actor_id, action, entity_type, entity_id, details, created_at";

#[derive(Debug, Clone, Copy, Default)]
pub struct AuditFilter<'a> {
    pub entity_type: Option<&'a str>,
    pub entity_id: Option<i64>,
    pub actor_id: Option<i64>,
}

pub async fn insert(
    pool: &Pool,
    actor_id: Option<i64>,
    action: &str,
    entity_type: &str,
    entity_id: Option<i64>,
    details: &Value,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO audit_logs (actor_id, action, entity_type, entity_id, details, created_at) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(actor_id)
    .bind(action)
    .bind(entity_type)
    .bind(entity_id)
    .bind(details.to_string())
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Append an audit entry. The write being audited has already happened, so a
/// failure here is logged and dropped.
pub async fn record(
    pool: &Pool,
    actor_id: Option<i64>,
    action: &str,
    entity_type: &str,
    entity_id: Option<i64>,
    details: Value,
) {
    if let Err(err) = insert(pool, actor_id, action, entity_type, entity_id, &details).await {
        warn!(?err, action, entity_type, ?entity_id, "failed to write audit log");
    }
}

/// Newest first.
#[instrument(skip_all)]
pub async fn list(pool: &Pool, f: &AuditFilter<'_>, limit: i64, offset: i64) -> Result<Vec<AuditLog>> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {COLUMNS} FROM audit_logs WHERE 1 = 1"));
    if let Some(t) = f.entity_type {
        qb.push(" AND entity_type = ").push_bind(t.to_string());
    }
    if let Some(id) = f.entity_id {
        qb.push(" AND entity_id = ").push_bind(id);
    }
    if let Some(actor) = f.actor_id {
        qb.push(" AND actor_id = ").push_bind(actor);
    }
    qb.push(" ORDER BY id DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);
    let rows = qb.build_query_as::<AuditLog>().fetch_all(pool).await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use serde_json::json;

    #[tokio::test]
    async fn filters_and_orders_newest_first() {
        let pool = memory_pool().await.unwrap();
        record(&pool, Some(1), "company.created", "company", Some(10), json!({"name": "Acme"})).await;
        record(&pool, Some(2), "request.moved", "request", Some(5), json!({"to": "active"})).await;
        record(&pool, None, "company.updated", "company", Some(10), json!({})).await;

        let all = list(&pool, &AuditFilter::default(), 50, 0).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].action, "company.updated");

        let company = list(
            &pool,
            &AuditFilter {
                entity_type: Some("company"),
                entity_id: Some(10),
                actor_id: None,
            },
            50,
            0,
        )
        .await
        .unwrap();
        assert_eq!(company.len(), 2);
        assert_eq!(company[1].details.0, json!({"name": "Acme"}));

        let page = list(&pool, &AuditFilter::default(), 1, 1).await.unwrap();
        assert_eq!(page[0].action, "request.moved");
    }
}
