use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::FromRow;

use crate::workflow::{WorkflowAction, WorkflowConditions};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Client => "client",
        }
    }
}

/// Pipeline column of a request, in board order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RequestStatus {
    Queue,
    Active,
    Review,
    Done,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 4] = [
        RequestStatus::Queue,
        RequestStatus::Active,
        RequestStatus::Review,
        RequestStatus::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Queue => "queue",
            RequestStatus::Active => "active",
            RequestStatus::Review => "review",
            RequestStatus::Done => "done",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "queue" => Some(RequestStatus::Queue),
            "active" => Some(RequestStatus::Active),
            "review" => Some(RequestStatus::Review),
            "done" => Some(RequestStatus::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CompanyStatus {
    Active,
    Paused,
    Churned,
}

impl CompanyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompanyStatus::Active => "active",
            CompanyStatus::Paused => "paused",
            CompanyStatus::Churned => "churned",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PlanTier {
    Starter,
    Growth,
    Scale,
    Enterprise,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Starter => "starter",
            PlanTier::Growth => "growth",
            PlanTier::Scale => "scale",
            PlanTier::Enterprise => "enterprise",
        }
    }

    /// Concurrent `active` requests a tier gets when no explicit limit is set.
    pub fn default_active_limit(&self) -> i64 {
        match self {
            PlanTier::Starter => 1,
            PlanTier::Growth => 2,
            PlanTier::Scale => 3,
            PlanTier::Enterprise => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum BillingInterval {
    OneTime,
    Monthly,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum WorkflowTrigger {
    RequestCreated,
    StatusChanged,
    PriorityChanged,
    CommentAdded,
}

impl WorkflowTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowTrigger::RequestCreated => "request_created",
            WorkflowTrigger::StatusChanged => "status_changed",
            WorkflowTrigger::PriorityChanged => "priority_changed",
            WorkflowTrigger::CommentAdded => "comment_added",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutboxKind {
    SendEmail,
}

impl OutboxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxKind::SendEmail => "send_email",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "send_email" => Some(OutboxKind::SendEmail),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub full_name: String,
    pub role: Role,
    pub company_id: Option<i64>,
    #[serde(skip)]
    pub api_token_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Company {
    pub id: i64,
    pub name: String,
    pub status: CompanyStatus,
    pub plan_tier: PlanTier,
    pub active_request_limit: i64,
    pub billing_email: Option<String>,
    pub woo_customer_id: Option<i64>,
    pub woo_subscription_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Contact {
    pub id: i64,
    pub company_id: i64,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub title: Option<String>,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Service {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub billing_interval: BillingInterval,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CompanyService {
    pub id: i64,
    pub company_id: i64,
    pub service_id: i64,
    pub status: SubscriptionStatus,
    pub started_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Request {
    pub id: i64,
    pub company_id: i64,
    pub title: String,
    pub description: String,
    pub status: RequestStatus,
    pub priority: Priority,
    pub assigned_to: Option<i64>,
    pub service_id: Option<i64>,
    pub template_id: Option<i64>,
    pub position: i64,
    pub due_date: Option<NaiveDate>,
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Comment {
    pub id: i64,
    pub request_id: i64,
    pub author_id: i64,
    pub body: String,
    pub is_internal: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Template {
    pub id: i64,
    pub name: String,
    pub title: String,
    pub description: String,
    pub default_priority: Priority,
    pub service_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Workflow {
    pub id: i64,
    pub name: String,
    pub trigger: WorkflowTrigger,
    pub conditions: Json<WorkflowConditions>,
    pub action: Json<WorkflowAction>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowExecution {
    pub id: i64,
    pub workflow_id: i64,
    pub request_id: i64,
    pub success: bool,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Notification {
    pub id: i64,
    pub user_id: i64,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub request_id: Option<i64>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invitation {
    pub id: i64,
    pub email: String,
    pub company_id: Option<i64>,
    pub role: Role,
    #[serde(skip)]
    pub token_hash: String,
    pub invited_by: i64,
    pub expires_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditLog {
    pub id: i64,
    pub actor_id: Option<i64>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<i64>,
    pub details: Json<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxTask {
    pub id: i64,
    pub kind: OutboxKind,
    pub payload: Value,
    pub attempt: i32,
}
