use anyhow::Result;
use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite};
use tracing::instrument;

use super::Pool;
use crate::model::{BillingInterval, Service};

const COLUMNS: &str = "id, name, description, price_cents, billing_interval, active, created_at";

#[derive(Debug, Clone)]
pub struct NewService {
    pub name: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub billing_interval: BillingInterval,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price_cents: Option<i64>,
    pub billing_interval: Option<BillingInterval>,
    pub active: Option<bool>,
}

#[instrument(skip_all)]
pub async fn insert(pool: &Pool, s: &NewService) -> Result<Service> {
    let row = sqlx::query_as::<_, Service>(&format!(
        "INSERT INTO services (name, description, price_cents, billing_interval, active, created_at) \
         VALUES (?, ?, ?, ?, 1, ?) RETURNING {COLUMNS}"
    ))
    .bind(&s.name)
    .bind(&s.description)
    .bind(s.price_cents)
    .bind(s.billing_interval)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn get(pool: &Pool, id: i64) -> Result<Option<Service>> {
    let row = sqlx::query_as::<_, Service>(&format!("SELECT {COLUMNS} FROM services WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn list(pool: &Pool, only_active: bool) -> Result<Vec<Service>> {
    let sql = if only_active {
        format!("SELECT {COLUMNS} FROM services WHERE active = 1 ORDER BY name COLLATE NOCASE")
    } else {
        format!("SELECT {COLUMNS} FROM services ORDER BY name COLLATE NOCASE")
    };
    let rows = sqlx::query_as::<_, Service>(&sql).fetch_all(pool).await?;
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn update(pool: &Pool, id: i64, ch: &ServiceChanges) -> Result<Option<Service>> {
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE services SET id = id");
    if let Some(name) = &ch.name {
        qb.push(", name = ").push_bind(name.clone());
    }
    if let Some(desc) = &ch.description {
        qb.push(", description = ").push_bind(desc.clone());
    }
    if let Some(price) = ch.price_cents {
        qb.push(", price_cents = ").push_bind(price);
    }
    if let Some(interval) = ch.billing_interval {
        qb.push(", billing_interval = ").push_bind(interval);
    }
    if let Some(active) = ch.active {
        qb.push(", active = ").push_bind(active);
    }
    qb.push(" WHERE id = ").push_bind(id);
    qb.push(format!(" RETURNING {COLUMNS}"));
    let row = qb.build_query_as::<Service>().fetch_optional(pool).await?;
    Ok(row)
}
