use anyhow::Result;
use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite};
use tracing::instrument;

use super::Pool;
use crate::model::{Priority, Template};

const COLUMNS: &str = "id, name, title, description, default_priority, service_id, created_at";

#[derive(Debug, Clone)]
pub struct NewTemplate {
    pub name: String,
    pub title: String,
    pub description: String,
    pub default_priority: Priority,
    pub service_id: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct TemplateChanges {
    pub name: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub default_priority: Option<Priority>,
    pub service_id: Option<i64>,
}

#[instrument(skip_all)]
pub async fn insert(pool: &Pool, t: &NewTemplate) -> Result<Template> {
    let row = sqlx::query_as::<_, Template>(&format!(
        "INSERT INTO templates (name, title, description, default_priority, service_id, created_at) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING {COLUMNS}"
    ))
    .bind(&t.name)
    .bind(&t.title)
    .bind(&t.description)
    .bind(t.default_priority)
    .bind(t.service_id)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn get(pool: &Pool, id: i64) -> Result<Option<Template>> {
    let row = sqlx::query_as::<_, Template>(&format!("SELECT {COLUMNS} FROM templates WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn list(pool: &Pool) -> Result<Vec<Template>> {
    let rows = sqlx::query_as::<_, Template>(&format!(
        "SELECT {COLUMNS} FROM templates ORDER BY name COLLATE NOCASE"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn update(pool: &Pool, id: i64, ch: &TemplateChanges) -> Result<Option<Template>> {
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE templates SET id = id");
    if let Some(name) = &ch.name {
        qb.push(", name = ").push_bind(name.clone());
    }
    if let Some(title) = &ch.title {
        qb.push(", title = ").push_bind(title.clone());
    }
    if let Some(desc) = &ch.description {
        qb.push(", description = ").push_bind(desc.clone());
    }
    if let Some(p) = ch.default_priority {
        qb.push(", default_priority = ").push_bind(p);
    }
    if let Some(sid) = ch.service_id {
        qb.push(", service_id = ").push_bind(sid);
    }
    qb.push(" WHERE id = ").push_bind(id);
    qb.push(format!(" RETURNING {COLUMNS}"));
    let row = qb.build_query_as::<Template>().fetch_optional(pool).await?;
    Ok(row)
}

pub async fn delete(pool: &Pool, id: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM templates WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}
