use anyhow::Result;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, Transaction};
use tracing::instrument;

use super::{companies, Pool};
use crate::model::{Priority, Request, RequestStatus};

const COLUMNS: &str = "id, company_id, title, description, status, priority, assigned_to, \
                       service_id, template_id, position, due_date, created_by, created_at, \
                       updated_at, completed_at";

#[derive(Debug, Clone)]
pub struct NewRequest {
    pub company_id: i64,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub service_id: Option<i64>,
    pub template_id: Option<i64>,
    pub due_date: Option<NaiveDate>,
    pub created_by: i64,
}

#[derive(Debug, Clone, Default)]
pub struct RequestChanges {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub service_id: Option<i64>,
    pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestFilter {
    pub company_id: Option<i64>,
    pub status: Option<RequestStatus>,
    pub assigned_to: Option<i64>,
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone)]
pub enum MoveOutcome {
    Moved(Request),
    OverCapacity { limit: i64, active: i64 },
    Missing,
}

async fn next_position(
    tx: &mut Transaction<'_, Sqlite>,
    company_id: i64,
    status: RequestStatus,
) -> Result<i64> {
    let max: Option<i64> =
        sqlx::query_scalar("SELECT MAX(position) FROM requests WHERE company_id = ? AND status = ?")
            .bind(company_id)
            .bind(status)
            .fetch_one(&mut **tx)
            .await?;
    Ok(max.map_or(0, |m| m + 1))
}

/// New requests land at the bottom of the company's queue column.
#[instrument(skip_all)]
pub async fn insert(pool: &Pool, r: &NewRequest) -> Result<Request> {
    let mut tx = pool.begin().await?;
    let position = next_position(&mut tx, r.company_id, RequestStatus::Queue).await?;
    let now = Utc::now();
    let row = sqlx::query_as::<_, Request>(&format!(
        "INSERT INTO requests (company_id, title, description, status, priority, service_id, \
         template_id, position, due_date, created_by, created_at, updated_at) \
         VALUES (?, ?, ?, 'queue', ?, ?, ?, ?, ?, ?, ?, ?) RETURNING {COLUMNS}"
    ))
    .bind(r.company_id)
    .bind(&r.title)
    .bind(&r.description)
    .bind(r.priority)
    .bind(r.service_id)
    .bind(r.template_id)
    .bind(position)
    .bind(r.due_date)
    .bind(r.created_by)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(row)
}

#[instrument(skip_all)]
pub async fn get(pool: &Pool, id: i64) -> Result<Option<Request>> {
    let row = sqlx::query_as::<_, Request>(&format!("SELECT {COLUMNS} FROM requests WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

#[instrument(skip_all)]
pub async fn list(pool: &Pool, f: &RequestFilter, limit: i64, offset: i64) -> Result<Vec<Request>> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {COLUMNS} FROM requests WHERE 1 = 1"));
    if let Some(cid) = f.company_id {
        qb.push(" AND company_id = ").push_bind(cid);
    }
    if let Some(status) = f.status {
        qb.push(" AND status = ").push_bind(status);
    }
    if let Some(uid) = f.assigned_to {
        qb.push(" AND assigned_to = ").push_bind(uid);
    }
    if let Some(p) = f.priority {
        qb.push(" AND priority = ").push_bind(p);
    }
    qb.push(" ORDER BY updated_at DESC, id DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);
    let rows = qb.build_query_as::<Request>().fetch_all(pool).await?;
    Ok(rows)
}

/// Every request of the board (optionally one company), column then position.
#[instrument(skip_all)]
pub async fn board(pool: &Pool, company_id: Option<i64>) -> Result<Vec<Request>> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {COLUMNS} FROM requests"));
    if let Some(cid) = company_id {
        qb.push(" WHERE company_id = ").push_bind(cid);
    }
    qb.push(
        " ORDER BY CASE status WHEN 'queue' THEN 0 WHEN 'active' THEN 1 WHEN 'review' THEN 2 ELSE 3 END, \
         position, id",
    );
    let rows = qb.build_query_as::<Request>().fetch_all(pool).await?;
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn update(pool: &Pool, id: i64, ch: &RequestChanges) -> Result<Option<Request>> {
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE requests SET updated_at = ");
    qb.push_bind(Utc::now());
    if let Some(title) = &ch.title {
        qb.push(", title = ").push_bind(title.clone());
    }
    if let Some(desc) = &ch.description {
        qb.push(", description = ").push_bind(desc.clone());
    }
    if let Some(p) = ch.priority {
        qb.push(", priority = ").push_bind(p);
    }
    if let Some(sid) = ch.service_id {
        qb.push(", service_id = ").push_bind(sid);
    }
    if let Some(due) = ch.due_date {
        qb.push(", due_date = ").push_bind(due);
    }
    qb.push(" WHERE id = ").push_bind(id);
    qb.push(format!(" RETURNING {COLUMNS}"));
    let row = qb.build_query_as::<Request>().fetch_optional(pool).await?;
    Ok(row)
}

/// Move a request to `to`, at `position` or the end of that column.
///
/// With `capacity` set and `to == active`, the move is refused when the
/// company already has `capacity` requests in `active` (the request itself
/// not counted). Status checks against the transition table are the
/// caller's job.
#[instrument(skip_all, fields(request_id = id, to = to.as_str()))]
pub async fn move_to(
    pool: &Pool,
    id: i64,
    to: RequestStatus,
    position: Option<i64>,
    capacity: Option<i64>,
) -> Result<MoveOutcome> {
    let mut tx = pool.begin().await?;
    let current = sqlx::query_as::<_, Request>(&format!("SELECT {COLUMNS} FROM requests WHERE id = ?"))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(current) = current else {
        return Ok(MoveOutcome::Missing);
    };

    if let (RequestStatus::Active, Some(limit)) = (to, capacity) {
        if current.status != RequestStatus::Active {
            let active =
                companies::count_requests_in_status(&mut *tx, current.company_id, RequestStatus::Active)
                    .await?;
            if active >= limit {
                return Ok(MoveOutcome::OverCapacity { limit, active });
            }
        }
    }

    // Close the gap left in the source column.
    sqlx::query(
        "UPDATE requests SET position = position - 1 \
         WHERE company_id = ? AND status = ? AND position > ? AND id != ?",
    )
    .bind(current.company_id)
    .bind(current.status)
    .bind(current.position)
    .bind(id)
    .execute(&mut *tx)
    .await?;

    let end = {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(position) FROM requests WHERE company_id = ? AND status = ? AND id != ?",
        )
        .bind(current.company_id)
        .bind(to)
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        max.map_or(0, |m| m + 1)
    };
    let target = position.map_or(end, |p| p.clamp(0, end));
    sqlx::query(
        "UPDATE requests SET position = position + 1 \
         WHERE company_id = ? AND status = ? AND position >= ? AND id != ?",
    )
    .bind(current.company_id)
    .bind(to)
    .bind(target)
    .bind(id)
    .execute(&mut *tx)
    .await?;

    let now = Utc::now();
    let completed_at = if to == RequestStatus::Done {
        current.completed_at.or(Some(now))
    } else {
        None
    };
    let moved = sqlx::query_as::<_, Request>(&format!(
        "UPDATE requests SET status = ?, position = ?, completed_at = ?, updated_at = ? \
         WHERE id = ? RETURNING {COLUMNS}"
    ))
    .bind(to)
    .bind(target)
    .bind(completed_at)
    .bind(now)
    .bind(id)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(MoveOutcome::Moved(moved))
}

#[instrument(skip_all)]
pub async fn assign(pool: &Pool, id: i64, user_id: Option<i64>) -> Result<Option<Request>> {
    let row = sqlx::query_as::<_, Request>(&format!(
        "UPDATE requests SET assigned_to = ?, updated_at = ? WHERE id = ? RETURNING {COLUMNS}"
    ))
    .bind(user_id)
    .bind(Utc::now())
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Priority-only write used by workflow actions.
#[instrument(skip_all)]
pub async fn set_priority(pool: &Pool, id: i64, priority: Priority) -> Result<Option<Request>> {
    let row = sqlx::query_as::<_, Request>(&format!(
        "UPDATE requests SET priority = ?, updated_at = ? WHERE id = ? RETURNING {COLUMNS}"
    ))
    .bind(priority)
    .bind(Utc::now())
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

#[instrument(skip_all)]
pub async fn delete(pool: &Pool, id: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM requests WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusCount {
    pub status: RequestStatus,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq, sqlx::FromRow)]
pub struct CompanyLoad {
    pub company_id: i64,
    pub company_name: String,
    pub open_requests: i64,
    pub active_requests: i64,
    pub active_request_limit: i64,
}

#[instrument(skip_all)]
pub async fn counts_by_status(pool: &Pool) -> Result<Vec<StatusCount>> {
    let rows: Vec<(RequestStatus, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM requests GROUP BY status")
            .fetch_all(pool)
            .await?;
    Ok(RequestStatus::ALL
        .iter()
        .map(|s| StatusCount {
            status: *s,
            count: rows
                .iter()
                .find(|(st, _)| st == s)
                .map_or(0, |(_, n)| *n),
        })
        .collect())
}

#[instrument(skip_all)]
pub async fn load_by_company(pool: &Pool) -> Result<Vec<CompanyLoad>> {
    let rows = sqlx::query_as::<_, CompanyLoad>(
        "SELECT c.id AS company_id, c.name AS company_name, \
                COALESCE(SUM(CASE WHEN r.status != 'done' THEN 1 ELSE 0 END), 0) AS open_requests, \
                COALESCE(SUM(CASE WHEN r.status = 'active' THEN 1 ELSE 0 END), 0) AS active_requests, \
                c.active_request_limit \
         FROM companies c LEFT JOIN requests r ON r.company_id = c.id \
         GROUP BY c.id ORDER BY open_requests DESC, c.name COLLATE NOCASE",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
