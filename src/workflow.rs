//! Rule-based automation on request events.
//!
//! A workflow pairs a trigger with optional conditions and one action. When
//! a request event fires, every active workflow for that trigger is checked
//! in id order; matching ones run their action and each run is recorded in
//! `workflow_executions`. Action failures are recorded and logged, never
//! returned to the caller. Actions performed here do not raise new events,
//! so workflows cannot chain into each other.

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::db::{self, Pool};
use crate::email::{self, EmailTemplate, Mailer};
use crate::model::{Priority, Request, RequestStatus, Role, Workflow, WorkflowTrigger};
use crate::transitions;

/// All present fields must match; an empty set matches every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConditions {
    pub from_status: Option<RequestStatus>,
    pub to_status: Option<RequestStatus>,
    pub priority: Option<Priority>,
    pub company_id: Option<i64>,
    pub service_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyTarget {
    Assignee,
    Admins,
    Company,
    User { id: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowAction {
    Notify { target: NotifyTarget, message: String },
    Reassign { user_id: i64 },
    ChangeStatus { status: RequestStatus },
    ChangePriority { priority: Priority },
    SendEmail { to: String, subject: String, body: String },
}

impl WorkflowAction {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowAction::Notify { .. } => "notify",
            WorkflowAction::Reassign { .. } => "reassign",
            WorkflowAction::ChangeStatus { .. } => "change_status",
            WorkflowAction::ChangePriority { .. } => "change_priority",
            WorkflowAction::SendEmail { .. } => "send_email",
        }
    }
}

/// Something that happened to a request, as seen after the change.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub trigger: WorkflowTrigger,
    pub request: Request,
    /// Status before the change, for `status_changed`.
    pub from_status: Option<RequestStatus>,
    pub actor_id: Option<i64>,
}

impl RequestEvent {
    pub fn new(trigger: WorkflowTrigger, request: Request, actor_id: Option<i64>) -> Self {
        Self {
            trigger,
            request,
            from_status: None,
            actor_id,
        }
    }

    pub fn status_changed(request: Request, from: RequestStatus, actor_id: Option<i64>) -> Self {
        Self {
            trigger: WorkflowTrigger::StatusChanged,
            request,
            from_status: Some(from),
            actor_id,
        }
    }

    /// Handlebars context for messages and email bodies.
    pub fn context(&self) -> Value {
        json!({
            "trigger": self.trigger.as_str(),
            "from_status": self.from_status.map(|s| s.as_str()),
            "request": {
                "id": self.request.id,
                "title": self.request.title,
                "description": self.request.description,
                "status": self.request.status.as_str(),
                "priority": self.request.priority.as_str(),
                "company_id": self.request.company_id,
                "assigned_to": self.request.assigned_to,
            },
        })
    }
}

pub fn matches(workflow: &Workflow, event: &RequestEvent) -> bool {
    if !workflow.active || workflow.trigger != event.trigger {
        return false;
    }
    let c = &workflow.conditions.0;
    let r = &event.request;
    if c.from_status.is_some() && c.from_status != event.from_status {
        return false;
    }
    if c.to_status.is_some_and(|s| s != r.status) {
        return false;
    }
    if c.priority.is_some_and(|p| p != r.priority) {
        return false;
    }
    if c.company_id.is_some_and(|id| id != r.company_id) {
        return false;
    }
    if c.service_id.is_some() && c.service_id != r.service_id {
        return false;
    }
    true
}

pub struct WorkflowEngine {
    pool: Pool,
    mailer: Arc<Mailer>,
}

impl WorkflowEngine {
    pub fn new(pool: Pool, mailer: Arc<Mailer>) -> Self {
        Self { pool, mailer }
    }

    /// Runs every matching workflow for `event`. Returns how many ran.
    #[instrument(skip_all, fields(trigger = event.trigger.as_str(), request_id = event.request.id))]
    pub async fn handle(&self, event: &RequestEvent) -> usize {
        let workflows = match db::workflows::list_active_by_trigger(&self.pool, event.trigger).await {
            Ok(w) => w,
            Err(err) => {
                warn!(?err, "failed to load workflows");
                return 0;
            }
        };
        let mut ran = 0;
        for wf in workflows.iter().filter(|wf| matches(wf, event)) {
            ran += 1;
            let outcome = self.execute(&wf.action.0, event, &wf.name).await;
            let error = match &outcome {
                Ok(()) => {
                    info!(workflow_id = wf.id, action = wf.action.0.kind(), "workflow executed");
                    None
                }
                Err(err) => {
                    warn!(?err, workflow_id = wf.id, action = wf.action.0.kind(), "workflow action failed");
                    Some(format!("{err:#}"))
                }
            };
            if let Err(err) =
                db::workflows::record_execution(&self.pool, wf.id, event.request.id, error.as_deref()).await
            {
                warn!(?err, workflow_id = wf.id, "failed to record workflow execution");
            }
        }
        debug!(ran, "workflows evaluated");
        ran
    }

    async fn execute(&self, action: &WorkflowAction, event: &RequestEvent, title: &str) -> Result<()> {
        let request = &event.request;
        match action {
            WorkflowAction::Notify { target, message } => {
                let body = self.mailer.render_inline(message, &event.context())?;
                let recipients = self.recipients(target, request).await?;
                for user_id in recipients {
                    db::notifications::insert(
                        &self.pool,
                        &db::notifications::NewNotification {
                            user_id,
                            kind: "workflow",
                            title,
                            body: &body,
                            request_id: Some(request.id),
                        },
                    )
                    .await?;
                }
            }
            WorkflowAction::Reassign { user_id } => {
                let user = db::users::get(&self.pool, *user_id)
                    .await?
                    .ok_or_else(|| anyhow!("user {user_id} not found"))?;
                if user.role != Role::Admin {
                    bail!("user {user_id} is not an admin");
                }
                db::requests::assign(&self.pool, request.id, Some(user.id))
                    .await?
                    .ok_or_else(|| anyhow!("request {} no longer exists", request.id))?;
            }
            WorkflowAction::ChangeStatus { status } => {
                let current = db::requests::get(&self.pool, request.id)
                    .await?
                    .ok_or_else(|| anyhow!("request {} no longer exists", request.id))?;
                transitions::validate_transition(current.status, *status)?;
                let company = db::companies::get(&self.pool, current.company_id)
                    .await?
                    .ok_or_else(|| anyhow!("company {} not found", current.company_id))?;
                match db::requests::move_to(
                    &self.pool,
                    request.id,
                    *status,
                    None,
                    Some(company.active_request_limit),
                )
                .await?
                {
                    db::requests::MoveOutcome::Moved(_) => {}
                    db::requests::MoveOutcome::OverCapacity { limit, active } => {
                        bail!("company at capacity ({active}/{limit} active)")
                    }
                    db::requests::MoveOutcome::Missing => {
                        bail!("request {} no longer exists", request.id)
                    }
                }
            }
            WorkflowAction::ChangePriority { priority } => {
                db::requests::set_priority(&self.pool, request.id, *priority)
                    .await?
                    .ok_or_else(|| anyhow!("request {} no longer exists", request.id))?;
            }
            WorkflowAction::SendEmail { to, subject, body } => {
                let ctx = event.context();
                let vars = json!({
                    "subject": self.mailer.render_inline(subject, &ctx)?,
                    "body": self.mailer.render_inline(body, &ctx)?,
                });
                let msg = self.mailer.render(EmailTemplate::Workflow, to, &vars)?;
                email::enqueue(&self.pool, &msg).await?;
            }
        }
        Ok(())
    }

    async fn recipients(&self, target: &NotifyTarget, request: &Request) -> Result<Vec<i64>> {
        let ids = match target {
            NotifyTarget::Assignee => request.assigned_to.into_iter().collect(),
            NotifyTarget::Admins => db::users::list_admins(&self.pool)
                .await?
                .into_iter()
                .map(|u| u.id)
                .collect(),
            NotifyTarget::Company => db::users::list_by_company(&self.pool, request.company_id)
                .await?
                .into_iter()
                .map(|u| u.id)
                .collect(),
            NotifyTarget::User { id } => vec![*id],
        };
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sqlx::types::Json;

    fn request(status: RequestStatus, priority: Priority) -> Request {
        let now = Utc::now();
        Request {
            id: 1,
            company_id: 10,
            title: "Homepage".into(),
            description: String::new(),
            status,
            priority,
            assigned_to: None,
            service_id: Some(3),
            template_id: None,
            position: 0,
            due_date: None,
            created_by: 1,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn workflow(trigger: WorkflowTrigger, conditions: WorkflowConditions) -> Workflow {
        let now = Utc::now();
        Workflow {
            id: 1,
            name: "rule".into(),
            trigger,
            conditions: Json(conditions),
            action: Json(WorkflowAction::ChangePriority {
                priority: Priority::Urgent,
            }),
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn empty_conditions_match_on_trigger_only() {
        let wf = workflow(WorkflowTrigger::RequestCreated, WorkflowConditions::default());
        let created = RequestEvent::new(
            WorkflowTrigger::RequestCreated,
            request(RequestStatus::Queue, Priority::Low),
            None,
        );
        assert!(matches(&wf, &created));

        let commented = RequestEvent::new(
            WorkflowTrigger::CommentAdded,
            request(RequestStatus::Queue, Priority::Low),
            None,
        );
        assert!(!matches(&wf, &commented));
    }

    #[test]
    fn status_conditions_use_event_transition() {
        let wf = workflow(
            WorkflowTrigger::StatusChanged,
            WorkflowConditions {
                from_status: Some(RequestStatus::Active),
                to_status: Some(RequestStatus::Review),
                ..Default::default()
            },
        );
        let hit = RequestEvent::status_changed(
            request(RequestStatus::Review, Priority::Medium),
            RequestStatus::Active,
            None,
        );
        assert!(matches(&wf, &hit));
        let miss = RequestEvent::status_changed(
            request(RequestStatus::Review, Priority::Medium),
            RequestStatus::Done,
            None,
        );
        assert!(!matches(&wf, &miss));
    }

    #[test]
    fn inactive_or_mismatched_fields_do_not_match() {
        let mut wf = workflow(
            WorkflowTrigger::RequestCreated,
            WorkflowConditions {
                priority: Some(Priority::High),
                company_id: Some(10),
                service_id: Some(3),
                ..Default::default()
            },
        );
        let ev = RequestEvent::new(
            WorkflowTrigger::RequestCreated,
            request(RequestStatus::Queue, Priority::High),
            None,
        );
        assert!(matches(&wf, &ev));
        wf.conditions.0.service_id = Some(4);
        assert!(!matches(&wf, &ev));
        wf.conditions.0.service_id = None;
        wf.active = false;
        assert!(!matches(&wf, &ev));
    }

    #[test]
    fn actions_use_tagged_json() {
        let action: WorkflowAction = serde_json::from_value(json!({
            "type": "notify",
            "target": {"type": "user", "id": 4},
            "message": "{{request.title}} needs review"
        }))
        .unwrap();
        assert_eq!(
            action,
            WorkflowAction::Notify {
                target: NotifyTarget::User { id: 4 },
                message: "{{request.title}} needs review".into()
            }
        );
        let cond: WorkflowConditions = serde_json::from_value(json!({"to_status": "done"})).unwrap();
        assert_eq!(cond.to_status, Some(RequestStatus::Done));
        assert!(cond.priority.is_none());
    }
}
