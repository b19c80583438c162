use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::{Executor, QueryBuilder, Sqlite};
use tracing::instrument;

use super::Pool;
use crate::model::{Company, CompanyService, CompanyStatus, PlanTier, RequestStatus};

const COLUMNS: &str = "id, name, status, plan_tier, active_request_limit, billing_email, \
                       woo_customer_id, woo_subscription_id, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct NewCompany {
    pub name: String,
    pub status: CompanyStatus,
    pub plan_tier: PlanTier,
    pub active_request_limit: i64,
    pub billing_email: Option<String>,
    pub woo_customer_id: Option<i64>,
    pub woo_subscription_id: Option<i64>,
}

/// Partial update; `None` leaves a column untouched.
#[derive(Debug, Clone, Default)]
pub struct CompanyChanges {
    pub name: Option<String>,
    pub status: Option<CompanyStatus>,
    pub plan_tier: Option<PlanTier>,
    pub active_request_limit: Option<i64>,
    pub billing_email: Option<String>,
    pub woo_customer_id: Option<i64>,
    pub woo_subscription_id: Option<i64>,
}

impl CompanyChanges {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.status.is_none()
            && self.plan_tier.is_none()
            && self.active_request_limit.is_none()
            && self.billing_email.is_none()
            && self.woo_customer_id.is_none()
            && self.woo_subscription_id.is_none()
    }
}

#[instrument(skip_all)]
pub async fn insert<'e, E>(exec: E, c: &NewCompany) -> Result<Company>
where
    E: Executor<'e, Database = Sqlite>,
{
    let now = Utc::now();
    let company = sqlx::query_as::<_, Company>(&format!(
        "INSERT INTO companies (name, status, plan_tier, active_request_limit, billing_email, \
         woo_customer_id, woo_subscription_id, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING {COLUMNS}"
    ))
    .bind(&c.name)
    .bind(c.status)
    .bind(c.plan_tier)
    .bind(c.active_request_limit)
    .bind(&c.billing_email)
    .bind(c.woo_customer_id)
    .bind(c.woo_subscription_id)
    .bind(now)
    .bind(now)
    .fetch_one(exec)
    .await?;
    Ok(company)
}

#[instrument(skip_all)]
pub async fn get(pool: &Pool, id: i64) -> Result<Option<Company>> {
    let c = sqlx::query_as::<_, Company>(&format!("SELECT {COLUMNS} FROM companies WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(c)
}

#[instrument(skip_all)]
pub async fn find_by_subscription(pool: &Pool, subscription_id: i64) -> Result<Option<Company>> {
    let c = sqlx::query_as::<_, Company>(&format!(
        "SELECT {COLUMNS} FROM companies WHERE woo_subscription_id = ?"
    ))
    .bind(subscription_id)
    .fetch_optional(pool)
    .await?;
    Ok(c)
}

#[instrument(skip_all)]
pub async fn list(pool: &Pool, status: Option<CompanyStatus>) -> Result<Vec<Company>> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {COLUMNS} FROM companies"));
    if let Some(status) = status {
        qb.push(" WHERE status = ").push_bind(status);
    }
    qb.push(" ORDER BY name COLLATE NOCASE, id");
    let rows = qb.build_query_as::<Company>().fetch_all(pool).await?;
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn update(pool: &Pool, id: i64, ch: &CompanyChanges) -> Result<Option<Company>> {
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE companies SET updated_at = ");
    qb.push_bind(Utc::now());
    if let Some(name) = &ch.name {
        qb.push(", name = ").push_bind(name.clone());
    }
    if let Some(status) = ch.status {
        qb.push(", status = ").push_bind(status);
    }
    if let Some(tier) = ch.plan_tier {
        qb.push(", plan_tier = ").push_bind(tier);
    }
    if let Some(limit) = ch.active_request_limit {
        qb.push(", active_request_limit = ").push_bind(limit);
    }
    if let Some(email) = &ch.billing_email {
        qb.push(", billing_email = ").push_bind(email.clone());
    }
    if let Some(cid) = ch.woo_customer_id {
        qb.push(", woo_customer_id = ").push_bind(cid);
    }
    if let Some(sid) = ch.woo_subscription_id {
        qb.push(", woo_subscription_id = ").push_bind(sid);
    }
    qb.push(" WHERE id = ").push_bind(id);
    qb.push(format!(" RETURNING {COLUMNS}"));
    let row = qb.build_query_as::<Company>().fetch_optional(pool).await?;
    Ok(row)
}

#[instrument(skip_all)]
pub async fn delete(pool: &Pool, id: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM companies WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

pub async fn count_requests_in_status<'e, E>(exec: E, company_id: i64, status: RequestStatus) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM requests WHERE company_id = ? AND status = ?")
        .bind(company_id)
        .bind(status)
        .fetch_one(exec)
        .await?;
    Ok(n)
}

pub async fn count_open_requests(pool: &Pool, company_id: i64) -> Result<i64> {
    let n: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM requests WHERE company_id = ? AND status != 'done'")
            .bind(company_id)
            .fetch_one(pool)
            .await?;
    Ok(n)
}

// --- company services (subscriptions to catalog services) ---

const CS_COLUMNS: &str = "id, company_id, service_id, status, started_at, cancelled_at";

#[instrument(skip_all)]
pub async fn add_service(pool: &Pool, company_id: i64, service_id: i64) -> Result<CompanyService> {
    let row = sqlx::query_as::<_, CompanyService>(&format!(
        "INSERT INTO company_services (company_id, service_id, status, started_at) \
         VALUES (?, ?, 'active', ?) RETURNING {CS_COLUMNS}"
    ))
    .bind(company_id)
    .bind(service_id)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn list_services(pool: &Pool, company_id: i64) -> Result<Vec<CompanyService>> {
    let rows = sqlx::query_as::<_, CompanyService>(&format!(
        "SELECT {CS_COLUMNS} FROM company_services WHERE company_id = ? ORDER BY id"
    ))
    .bind(company_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Marks an active company service cancelled. Returns the row as it is now,
/// or `None` when it does not belong to the company.
#[instrument(skip_all)]
pub async fn cancel_service(pool: &Pool, company_id: i64, cs_id: i64) -> Result<Option<CompanyService>> {
    let row = sqlx::query_as::<_, CompanyService>(&format!(
        "UPDATE company_services \
         SET status = 'cancelled', cancelled_at = COALESCE(cancelled_at, ?) \
         WHERE id = ? AND company_id = ? RETURNING {CS_COLUMNS}"
    ))
    .bind(Utc::now())
    .bind(cs_id)
    .bind(company_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PlanRevenue {
    pub plan_tier: PlanTier,
    pub companies: i64,
    pub mrr_cents: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MrrSummary {
    pub mrr_cents: i64,
    pub active_companies: i64,
    pub by_plan: Vec<PlanRevenue>,
}

/// Monthly recurring revenue: active monthly services of active companies.
#[instrument(skip_all)]
pub async fn mrr(pool: &Pool) -> Result<MrrSummary> {
    let by_plan = sqlx::query_as::<_, (PlanTier, i64, i64)>(
        "SELECT c.plan_tier, COUNT(DISTINCT c.id), COALESCE(SUM(s.price_cents), 0) \
         FROM companies c \
         JOIN company_services cs ON cs.company_id = c.id AND cs.status = 'active' \
         JOIN services s ON s.id = cs.service_id AND s.billing_interval = 'monthly' \
         WHERE c.status = 'active' \
         GROUP BY c.plan_tier ORDER BY c.plan_tier",
    )
    .fetch_all(pool)
    .await?;

    let active_companies: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM companies WHERE status = 'active'")
            .fetch_one(pool)
            .await?;

    let by_plan: Vec<PlanRevenue> = by_plan
        .into_iter()
        .map(|(plan_tier, companies, mrr_cents)| PlanRevenue {
            plan_tier,
            companies,
            mrr_cents,
        })
        .collect();
    Ok(MrrSummary {
        mrr_cents: by_plan.iter().map(|p| p.mrr_cents).sum(),
        active_companies,
        by_plan,
    })
}
