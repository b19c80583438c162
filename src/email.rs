//! Transactional email: handlebars rendering, delivery backends and the
//! outbox hand-off.
//!
//! Nothing in the request path talks to the email provider. Handlers render
//! a [`EmailMessage`] and [`queue`] it; the outbox worker delivers it later
//! through an [`EmailSender`].

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use handlebars::{no_escape, Handlebars};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config;
use crate::db::{self, Pool};
use crate::model::OutboxKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailTemplate {
    Invitation,
    RequestStatusChanged,
    CommentAdded,
    Workflow,
}

impl EmailTemplate {
    pub const ALL: [EmailTemplate; 4] = [
        EmailTemplate::Invitation,
        EmailTemplate::RequestStatusChanged,
        EmailTemplate::CommentAdded,
        EmailTemplate::Workflow,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EmailTemplate::Invitation => "invitation",
            EmailTemplate::RequestStatusChanged => "request_status_changed",
            EmailTemplate::CommentAdded => "comment_added",
            EmailTemplate::Workflow => "workflow",
        }
    }

    /// (subject, html, text)
    fn sources(&self) -> (&'static str, &'static str, &'static str) {
        match self {
            EmailTemplate::Invitation => (
                "You're invited to {{company_name}} on the client portal",
                "<p>Hi,</p>\
                 <p>{{inviter_name}} invited you to join <strong>{{company_name}}</strong>.</p>\
                 <p><a href=\"{{accept_url}}\">Accept the invitation</a> before {{expires_at}}.</p>",
                "Hi,\n\n{{inviter_name}} invited you to join {{company_name}}.\n\
                 Accept the invitation before {{expires_at}}:\n{{accept_url}}\n",
            ),
            EmailTemplate::RequestStatusChanged => (
                "[{{request.title}}] moved to {{to_status}}",
                "<p>Your request <strong>{{request.title}}</strong> moved from \
                 {{from_status}} to <strong>{{to_status}}</strong>.</p>\
                 <p><a href=\"{{request_url}}\">Open the request</a></p>",
                "Your request \"{{request.title}}\" moved from {{from_status}} to {{to_status}}.\n\
                 {{request_url}}\n",
            ),
            EmailTemplate::CommentAdded => (
                "New comment on {{request.title}}",
                "<p><strong>{{author_name}}</strong> commented on \
                 <strong>{{request.title}}</strong>:</p><blockquote>{{body}}</blockquote>\
                 <p><a href=\"{{request_url}}\">Reply in the portal</a></p>",
                "{{author_name}} commented on \"{{request.title}}\":\n\n{{body}}\n\n{{request_url}}\n",
            ),
            EmailTemplate::Workflow => ("{{subject}}", "<div>{{body}}</div>", "{{body}}\n"),
        }
    }
}

/// Renders the built-in templates plus ad-hoc strings (workflow bodies).
///
/// HTML parts are escaped; subjects and text parts are not.
pub struct Mailer {
    html: Handlebars<'static>,
    plain: Handlebars<'static>,
    public_url: String,
}

impl fmt::Debug for Mailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailer")
            .field("public_url", &self.public_url)
            .finish_non_exhaustive()
    }
}

impl Mailer {
    pub fn new(public_url: &str) -> Result<Self> {
        let mut html = Handlebars::new();
        let mut plain = Handlebars::new();
        plain.register_escape_fn(no_escape);
        for t in EmailTemplate::ALL {
            let (subject, body_html, body_text) = t.sources();
            plain
                .register_template_string(&format!("{}.subject", t.name()), subject)
                .with_context(|| format!("bad subject template {}", t.name()))?;
            plain
                .register_template_string(&format!("{}.text", t.name()), body_text)
                .with_context(|| format!("bad text template {}", t.name()))?;
            html.register_template_string(&format!("{}.html", t.name()), body_html)
                .with_context(|| format!("bad html template {}", t.name()))?;
        }
        Ok(Self {
            html,
            plain,
            public_url: public_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    pub fn request_url(&self, request_id: i64) -> String {
        format!("{}/requests/{request_id}", self.public_url)
    }

    pub fn render(&self, template: EmailTemplate, to: &str, ctx: &Value) -> Result<EmailMessage> {
        let name = template.name();
        Ok(EmailMessage {
            to: to.to_string(),
            subject: self.plain.render(&format!("{name}.subject"), ctx)?,
            html: self.html.render(&format!("{name}.html"), ctx)?,
            text: self.plain.render(&format!("{name}.text"), ctx)?,
        })
    }

    /// Renders a template string that is not registered, without escaping.
    pub fn render_inline(&self, source: &str, ctx: &Value) -> Result<String> {
        Ok(self.plain.render_template(source, ctx)?)
    }
}

/// Puts a rendered message on the outbox for the delivery worker.
pub async fn enqueue(pool: &Pool, msg: &EmailMessage) -> Result<i64> {
    db::outbox::enqueue(pool, OutboxKind::SendEmail, &json!(msg), Utc::now()).await
}

/// Render and enqueue, logging instead of failing: email is a side effect of
/// the write that triggered it.
pub async fn queue(pool: &Pool, mailer: &Mailer, template: EmailTemplate, to: &str, ctx: &Value) {
    let msg = match mailer.render(template, to, ctx) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(?err, template = template.name(), "failed to render email");
            return;
        }
    };
    if let Err(err) = enqueue(pool, &msg).await {
        warn!(?err, template = template.name(), "failed to enqueue email");
    }
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, msg: &EmailMessage) -> Result<()>;
}

/// Posts messages as JSON to a transactional email API.
#[derive(Clone)]
pub struct HttpEmailSender {
    http: Client,
    api_url: String,
    api_key: String,
    from: String,
}

impl fmt::Debug for HttpEmailSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpEmailSender")
            .field("api_url", &self.api_url)
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

impl HttpEmailSender {
    pub fn new(api_url: String, api_key: String, from: String) -> Result<Self> {
        let http = Client::builder()
            .user_agent("agency-portal/0.1")
            .build()
            .context("reqwest client")?;
        Ok(Self {
            http,
            api_url,
            api_key,
            from,
        })
    }

    pub fn build_request(&self, msg: &EmailMessage) -> Result<reqwest::Request> {
        self.http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "from": self.from,
                "to": msg.to,
                "subject": msg.subject,
                "html": msg.html,
                "text": msg.text,
            }))
            .build()
            .context("failed to build email request")
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    async fn send(&self, msg: &EmailMessage) -> Result<()> {
        let request = self.build_request(msg)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach email provider")?;
        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!(%body, "rate limited by email provider");
            return Err(anyhow!("received 429 from email provider: {body}"));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("email provider error {status}: {body}"));
        }
        info!(to = %msg.to, subject = %msg.subject, "email sent");
        Ok(())
    }
}

/// Used when email is disabled: the message only shows up in the log.
#[derive(Debug, Default, Clone)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, msg: &EmailMessage) -> Result<()> {
        info!(to = %msg.to, subject = %msg.subject, "email delivery disabled; message dropped");
        Ok(())
    }
}

pub fn sender_from_config(cfg: &config::Email) -> Result<Arc<dyn EmailSender>> {
    if cfg.enabled {
        Ok(Arc::new(HttpEmailSender::new(
            cfg.api_url.clone(),
            cfg.api_key.clone(),
            cfg.from.clone(),
        )?))
    } else {
        Ok(Arc::new(LogEmailSender))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_status_change_with_escaping_only_in_html() {
        let mailer = Mailer::new("https://portal.example.com/").unwrap();
        let ctx = json!({
            "request": {"title": "Fix <nav> & footer"},
            "from_status": "active",
            "to_status": "review",
            "request_url": mailer.request_url(7),
        });
        let msg = mailer
            .render(EmailTemplate::RequestStatusChanged, "c@acme.test", &ctx)
            .unwrap();
        assert_eq!(msg.to, "c@acme.test");
        assert_eq!(msg.subject, "[Fix <nav> & footer] moved to review");
        assert!(msg.html.contains("Fix &lt;nav&gt; &amp; footer"));
        assert!(msg.text.contains("https://portal.example.com/requests/7"));
    }

    #[test]
    fn inline_templates_see_the_context() {
        let mailer = Mailer::new("http://localhost").unwrap();
        let out = mailer
            .render_inline("{{request.title}} is {{request.status}}", &json!({"request": {"title": "Logo", "status": "done"}}))
            .unwrap();
        assert_eq!(out, "Logo is done");
    }

    #[test]
    fn http_sender_builds_authenticated_post() {
        let sender = HttpEmailSender::new(
            "https://mail.example.com/v1/send".into(),
            "key-123".into(),
            "portal@agency.test".into(),
        )
        .unwrap();
        let msg = EmailMessage {
            to: "c@acme.test".into(),
            subject: "Hi".into(),
            html: "<p>Hi</p>".into(),
            text: "Hi".into(),
        };
        let req = sender.build_request(&msg).unwrap();
        assert_eq!(req.method(), reqwest::Method::POST);
        assert_eq!(req.url().as_str(), "https://mail.example.com/v1/send");
        assert_eq!(
            req.headers().get("authorization").unwrap().to_str().unwrap(),
            "Bearer key-123"
        );
        let body: Value = serde_json::from_slice(req.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body["from"], "portal@agency.test");
        assert_eq!(body["to"], "c@acme.test");
    }

    #[tokio::test]
    async fn queue_puts_message_on_outbox() {
        let pool = db::memory_pool().await.unwrap();
        let mailer = Mailer::new("http://localhost").unwrap();
        queue(
            &pool,
            &mailer,
            EmailTemplate::Workflow,
            "ops@agency.test",
            &json!({"subject": "Escalation", "body": "Urgent request"}),
        )
        .await;
        let task = db::outbox::next_due(&pool).await.unwrap().unwrap();
        assert_eq!(task.kind, OutboxKind::SendEmail);
        let msg: EmailMessage = serde_json::from_value(task.payload).unwrap();
        assert_eq!(msg.subject, "Escalation");
        assert_eq!(msg.text, "Urgent request\n");
    }
}
