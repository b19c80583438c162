use anyhow::Result;
use chrono::Utc;
use tracing::instrument;

use super::Pool;
use crate::model::Comment;

const COLUMNS: &str = "id, request_id, author_id, body, is_internal, created_at";

#[instrument(skip_all)]
pub async fn insert(
    pool: &Pool,
    request_id: i64,
    author_id: i64,
    body: &str,
    is_internal: bool,
) -> Result<Comment> {
    let mut tx = pool.begin().await?;
    let row = sqlx::query_as::<_, Comment>(&format!(
        "INSERT INTO request_comments (request_id, author_id, body, is_internal, created_at) \
         VALUES (?, ?, ?, ?, ?) RETURNING {COLUMNS}"
    ))
    .bind(request_id)
    .bind(author_id)
    .bind(body)
    .bind(is_internal)
    .bind(Utc::now())
    .fetch_one(&mut *tx)
    .await?;
    sqlx::query("UPDATE requests SET updated_at = ? WHERE id = ?")
        .bind(row.created_at)
        .bind(request_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(row)
}

/// Comments of a request, oldest first. Internal notes only when asked for.
pub async fn list(pool: &Pool, request_id: i64, include_internal: bool) -> Result<Vec<Comment>> {
    let sql = if include_internal {
        format!("SELECT {COLUMNS} FROM request_comments WHERE request_id = ? ORDER BY created_at, id")
    } else {
        format!(
            "SELECT {COLUMNS} FROM request_comments WHERE request_id = ? AND is_internal = 0 \
             ORDER BY created_at, id"
        )
    };
    let rows = sqlx::query_as::<_, Comment>(&sql)
        .bind(request_id)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::companies::{self, NewCompany};
    use crate::db::requests::{self, NewRequest};
    use crate::db::users::{self, NewUser};
    use crate::db::memory_pool;
    use crate::model::{CompanyStatus, PlanTier, Priority, Role};

    #[tokio::test]
    async fn internal_comments_are_hidden_on_request() {
        let pool = memory_pool().await.unwrap();
        let company = companies::insert(
            &pool,
            &NewCompany {
                name: "Acme".into(),
                status: CompanyStatus::Active,
                plan_tier: PlanTier::Growth,
                active_request_limit: 2,
                billing_email: None,
                woo_customer_id: None,
                woo_subscription_id: None,
            },
        )
        .await
        .unwrap();
        let admin = users::insert(
            &pool,
            &NewUser {
                email: "a@agency.test",
                full_name: "Admin",
                role: Role::Admin,
                company_id: None,
                api_token_hash: "h",
            },
        )
        .await
        .unwrap();
        let req = requests::insert(
            &pool,
            &NewRequest {
                company_id: company.id,
                title: "Landing page".into(),
                description: String::new(),
                priority: Priority::High,
                service_id: None,
                template_id: None,
                due_date: None,
                created_by: admin.id,
            },
        )
        .await
        .unwrap();

        insert(&pool, req.id, admin.id, "visible", false).await.unwrap();
        insert(&pool, req.id, admin.id, "note to self", true).await.unwrap();

        assert_eq!(list(&pool, req.id, true).await.unwrap().len(), 2);
        let public = list(&pool, req.id, false).await.unwrap();
        assert_eq!(public.len(), 1);
        assert_eq!(public[0].body, "visible");
    }
}
