use anyhow::Result;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite};
use tracing::instrument;

use super::Pool;
use crate::model::{Workflow, WorkflowExecution, WorkflowTrigger};
use crate::workflow::{WorkflowAction, WorkflowConditions};

const COLUMNS: &str = "id, name, trigger, conditions, action, active, created_at, updated_at";
const EXEC_COLUMNS: &str = "id, workflow_id, request_id, success, error, executed_at";

#[derive(Debug, Clone)]
pub struct NewWorkflow {
    pub name: String,
    pub trigger: WorkflowTrigger,
    pub conditions: WorkflowConditions,
    pub action: WorkflowAction,
    pub active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowChanges {
    pub name: Option<String>,
    pub trigger: Option<WorkflowTrigger>,
    pub conditions: Option<WorkflowConditions>,
    pub action: Option<WorkflowAction>,
    pub active: Option<bool>,
}

#[instrument(skip_all)]
pub async fn insert(pool: &Pool, w: &NewWorkflow) -> Result<Workflow> {
    let now = Utc::now();
    let row = sqlx::query_as::<_, Workflow>(&format!(
        "INSERT INTO workflows (name, trigger, conditions, action, active, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING {COLUMNS}"
    ))
    .bind(&w.name)
    .bind(w.trigger)
    .bind(Json(&w.conditions))
    .bind(Json(&w.action))
    .bind(w.active)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn get(pool: &Pool, id: i64) -> Result<Option<Workflow>> {
    let row = sqlx::query_as::<_, Workflow>(&format!("SELECT {COLUMNS} FROM workflows WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn list(pool: &Pool) -> Result<Vec<Workflow>> {
    let rows = sqlx::query_as::<_, Workflow>(&format!("SELECT {COLUMNS} FROM workflows ORDER BY id"))
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Active workflows for a trigger in evaluation (id) order.
#[instrument(skip_all)]
pub async fn list_active_by_trigger(pool: &Pool, trigger: WorkflowTrigger) -> Result<Vec<Workflow>> {
    let rows = sqlx::query_as::<_, Workflow>(&format!(
        "SELECT {COLUMNS} FROM workflows WHERE active = 1 AND trigger = ? ORDER BY id"
    ))
    .bind(trigger)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn update(pool: &Pool, id: i64, ch: &WorkflowChanges) -> Result<Option<Workflow>> {
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE workflows SET updated_at = ");
    qb.push_bind(Utc::now());
    if let Some(name) = &ch.name {
        qb.push(", name = ").push_bind(name.clone());
    }
    if let Some(trigger) = ch.trigger {
        qb.push(", trigger = ").push_bind(trigger);
    }
    if let Some(conditions) = &ch.conditions {
        qb.push(", conditions = ").push_bind(Json(conditions.clone()));
    }
    if let Some(action) = &ch.action {
        qb.push(", action = ").push_bind(Json(action.clone()));
    }
    if let Some(active) = ch.active {
        qb.push(", active = ").push_bind(active);
    }
    qb.push(" WHERE id = ").push_bind(id);
    qb.push(format!(" RETURNING {COLUMNS}"));
    let row = qb.build_query_as::<Workflow>().fetch_optional(pool).await?;
    Ok(row)
}

pub async fn delete(pool: &Pool, id: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM workflows WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

pub async fn record_execution(
    pool: &Pool,
    workflow_id: i64,
    request_id: i64,
    error: Option<&str>,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO workflow_executions (workflow_id, request_id, success, error, executed_at) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(workflow_id)
    .bind(request_id)
    .bind(error.is_none())
    .bind(error)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Newest first.
pub async fn list_executions(
    pool: &Pool,
    workflow_id: i64,
    limit: i64,
    offset: i64,
) -> Result<Vec<WorkflowExecution>> {
    let rows = sqlx::query_as::<_, WorkflowExecution>(&format!(
        "SELECT {EXEC_COLUMNS} FROM workflow_executions WHERE workflow_id = ? \
         ORDER BY id DESC LIMIT ? OFFSET ?"
    ))
    .bind(workflow_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::model::{Priority, RequestStatus};
    use crate::workflow::NotifyTarget;

    #[tokio::test]
    async fn json_columns_round_trip_and_filter_by_trigger() {
        let pool = memory_pool().await.unwrap();
        let escalate = insert(
            &pool,
            &NewWorkflow {
                name: "Escalate urgent".into(),
                trigger: WorkflowTrigger::RequestCreated,
                conditions: WorkflowConditions {
                    priority: Some(Priority::Urgent),
                    ..Default::default()
                },
                action: WorkflowAction::Notify {
                    target: NotifyTarget::Admins,
                    message: "Urgent: {{request.title}}".into(),
                },
                active: true,
            },
        )
        .await
        .unwrap();
        insert(
            &pool,
            &NewWorkflow {
                name: "Done mail".into(),
                trigger: WorkflowTrigger::StatusChanged,
                conditions: WorkflowConditions {
                    to_status: Some(RequestStatus::Done),
                    ..Default::default()
                },
                action: WorkflowAction::ChangePriority {
                    priority: Priority::Low,
                },
                active: false,
            },
        )
        .await
        .unwrap();

        let created = list_active_by_trigger(&pool, WorkflowTrigger::RequestCreated)
            .await
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].conditions.0.priority, Some(Priority::Urgent));
        assert!(list_active_by_trigger(&pool, WorkflowTrigger::StatusChanged)
            .await
            .unwrap()
            .is_empty());

        let updated = update(
            &pool,
            escalate.id,
            &WorkflowChanges {
                action: Some(WorkflowAction::Reassign { user_id: 9 }),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(updated.action.0, WorkflowAction::Reassign { user_id: 9 });
        assert_eq!(updated.name, "Escalate urgent");

        record_execution(&pool, escalate.id, 1, None).await.unwrap();
        record_execution(&pool, escalate.id, 2, Some("boom")).await.unwrap();
        let runs = list_executions(&pool, escalate.id, 10, 0).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(!runs[0].success);
        assert_eq!(runs[0].error.as_deref(), Some("boom"));
        assert!(runs[1].success);
    }
}
