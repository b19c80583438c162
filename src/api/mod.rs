//! HTTP surface: shared state, router and cross-cutting middleware.

use anyhow::Result;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Request, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::auth::{bearer_token, hash_token};
use crate::billing::BillingService;
use crate::cache::TtlCache;
use crate::config::Config;
use crate::db::Pool;
use crate::email::Mailer;
use crate::error::ApiError;
use crate::rate_limit::{RateDecision, RateLimiter, RateRule};
use crate::workflow::WorkflowEngine;

mod audit;
mod billing;
mod companies;
mod contacts;
mod invitations;
mod me;
mod notifications;
mod requests;
mod services;
mod stats;
mod templates;
mod webhooks;
mod workflows;

pub const CACHE_MRR: &str = "billing:mrr";
pub const CACHE_COMPANIES: &str = "companies:*";
pub const CACHE_BOARDS: &str = "board:*";

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub cfg: Arc<Config>,
    pub cache: Arc<TtlCache<Value>>,
    pub limiter: Arc<RateLimiter>,
    pub billing: Arc<dyn BillingService>,
    pub mailer: Arc<Mailer>,
    pub workflows: Arc<WorkflowEngine>,
}

impl AppState {
    pub fn new(pool: Pool, cfg: Config, billing: Arc<dyn BillingService>) -> Result<Self> {
        let mailer = Arc::new(Mailer::new(&cfg.app.public_url)?);
        let cache = Arc::new(TtlCache::new(Duration::from_secs(cfg.cache.default_ttl_seconds)));
        Ok(Self {
            workflows: Arc::new(WorkflowEngine::new(pool.clone(), mailer.clone())),
            pool,
            cfg: Arc::new(cfg),
            cache,
            limiter: Arc::new(RateLimiter::new()),
            billing,
            mailer,
        })
    }

    fn rule(&self, public: bool) -> RateRule {
        let rl = &self.cfg.rate_limit;
        RateRule {
            max_requests: if public {
                rl.public_max_requests
            } else {
                rl.max_requests
            },
            window: Duration::from_secs(rl.window_seconds),
        }
    }

    pub fn invalidate_companies(&self) {
        self.cache.delete_pattern(CACHE_COMPANIES);
        self.cache.delete(CACHE_MRR);
    }

    pub fn invalidate_boards(&self) {
        self.cache.delete_pattern(CACHE_BOARDS);
    }
}

pub fn router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/api/me", get(me::show))
        .route("/api/me/token", post(me::rotate_token))
        .route("/api/companies", get(companies::list).post(companies::create))
        .route(
            "/api/companies/:id",
            get(companies::show)
                .patch(companies::update)
                .delete(companies::remove),
        )
        .route("/api/companies/:id/capacity", get(companies::capacity))
        .route(
            "/api/companies/:id/services",
            get(companies::list_services).post(companies::add_service),
        )
        .route(
            "/api/companies/:id/services/:cs_id",
            delete(companies::cancel_service),
        )
        .route(
            "/api/companies/:id/contacts",
            get(contacts::list).post(contacts::create),
        )
        .route("/api/contacts/:id", patch(contacts::update).delete(contacts::remove))
        .route("/api/companies/:id/billing", get(billing::show))
        .route("/api/companies/:id/billing/sync", post(billing::sync))
        .route("/api/billing/mrr", get(billing::mrr))
        .route("/api/requests", get(requests::list).post(requests::create))
        .route(
            "/api/requests/:id",
            get(requests::show)
                .patch(requests::update)
                .delete(requests::remove),
        )
        .route("/api/requests/:id/move", post(requests::move_request))
        .route("/api/requests/:id/assign", post(requests::assign))
        .route(
            "/api/requests/:id/comments",
            get(requests::list_comments).post(requests::add_comment),
        )
        .route("/api/board", get(requests::board))
        .route("/api/services", get(services::list).post(services::create))
        .route(
            "/api/services/:id",
            patch(services::update).delete(services::deactivate),
        )
        .route("/api/templates", get(templates::list).post(templates::create))
        .route(
            "/api/templates/:id",
            get(templates::show)
                .patch(templates::update)
                .delete(templates::remove),
        )
        .route("/api/workflows", get(workflows::list).post(workflows::create))
        .route(
            "/api/workflows/:id",
            get(workflows::show)
                .patch(workflows::update)
                .delete(workflows::remove),
        )
        .route("/api/workflows/:id/executions", get(workflows::executions))
        .route("/api/notifications", get(notifications::list))
        .route("/api/notifications/unread-count", get(notifications::unread_count))
        .route("/api/notifications/read-all", post(notifications::mark_all_read))
        .route("/api/notifications/:id/read", post(notifications::mark_read))
        .route("/api/notifications/:id", delete(notifications::remove))
        .route("/api/invitations", get(invitations::list).post(invitations::create))
        .route("/api/invitations/:id", delete(invitations::revoke))
        .route("/api/audit-logs", get(audit::list))
        .route("/api/stats", get(stats::show))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit_private));

    let public = Router::new()
        .route("/api/invitations/accept", post(invitations::accept))
        .route("/api/webhooks/woocommerce", post(webhooks::woocommerce))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit_public));

    Router::new()
        .route("/api/health", get(health))
        .merge(authenticated)
        .merge(public)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// First hop of `X-Forwarded-For`, if any.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

fn rate_key(headers: &HeaderMap, public: bool) -> String {
    if !public {
        if let Some(token) = bearer_token(headers) {
            return format!("token:{}", hash_token(token));
        }
    }
    let scope = if public { "public" } else { "ip" };
    match client_ip(headers) {
        Some(ip) => format!("{scope}:{ip}"),
        None => format!("{scope}:anonymous"),
    }
}

fn apply_rate_headers(headers: &mut HeaderMap, d: &RateDecision) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(d.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(d.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(d.reset_secs()));
}

async fn enforce_rate_limit(state: &AppState, req: Request, next: Next, public: bool) -> Response {
    let key = rate_key(req.headers(), public);
    let decision = state.limiter.check(&key, state.rule(public));
    if !decision.allowed {
        debug!(%key, "rate limited");
        let mut resp = ApiError::RateLimited {
            retry_after_secs: decision.reset_secs().max(1),
        }
        .into_response();
        apply_rate_headers(resp.headers_mut(), &decision);
        return resp;
    }
    let mut resp = next.run(req).await;
    apply_rate_headers(resp.headers_mut(), &decision);
    resp
}

async fn rate_limit_private(State(state): State<AppState>, req: Request, next: Next) -> Response {
    enforce_rate_limit(&state, req, next, false).await
}

async fn rate_limit_public(State(state): State<AppState>, req: Request, next: Next) -> Response {
    enforce_rate_limit(&state, req, next, true).await
}

/// `Json` whose rejections use the API error body.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

/// `Query` whose rejections use the API error body.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::validation(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::validation(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_keys_prefer_token_then_forwarded_ip() {
        let mut headers = HeaderMap::new();
        assert_eq!(rate_key(&headers, false), "ip:anonymous");
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        assert_eq!(rate_key(&headers, false), "ip:203.0.113.9");
        assert_eq!(rate_key(&headers, true), "public:203.0.113.9");
        headers.insert("authorization", HeaderValue::from_static("Bearer ap_x"));
        assert_eq!(rate_key(&headers, false), format!("token:{}", hash_token("ap_x")));
        assert_eq!(rate_key(&headers, true), "public:203.0.113.9");
    }
}
