#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

use agency_portal::api::{self, AppState};
use agency_portal::auth::{generate_token, hash_token};
use agency_portal::billing::{BillingService, Subscription};
use agency_portal::config::{self, Config};
use agency_portal::db::{self, users, Pool};
use agency_portal::model::Role;

/// In-memory stand-in for WooCommerce.
#[derive(Clone, Default)]
pub struct RecordingBilling {
    pub subscriptions: Arc<Mutex<HashMap<i64, Subscription>>>,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingBilling {
    pub fn put(&self, sub: Subscription) {
        self.subscriptions.lock().unwrap().insert(sub.id, sub);
    }
}

#[async_trait]
impl BillingService for RecordingBilling {
    async fn get_subscription(&self, subscription_id: i64) -> Result<Subscription> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("get_subscription:{subscription_id}"));
        self.subscriptions
            .lock()
            .unwrap()
            .get(&subscription_id)
            .cloned()
            .ok_or_else(|| anyhow!("woocommerce error 404 Not Found"))
    }

    async fn list_customer_subscriptions(&self, customer_id: i64) -> Result<Vec<Subscription>> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("list_customer_subscriptions:{customer_id}"));
        let mut subs: Vec<Subscription> = self
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.customer_id == customer_id)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.id);
        Ok(subs)
    }
}

pub struct TestApp {
    pub router: Router,
    pub pool: Pool,
    pub billing: RecordingBilling,
    pub cfg: Config,
}

pub fn test_config() -> Config {
    serde_yaml::from_str(config::example()).unwrap()
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(test_config()).await
}

pub async fn spawn_app_with(cfg: Config) -> TestApp {
    let pool = db::memory_pool().await.unwrap();
    let billing = RecordingBilling::default();
    let state = AppState::new(pool.clone(), cfg.clone(), Arc::new(billing.clone())).unwrap();
    TestApp {
        router: api::router(state),
        pool,
        billing,
        cfg,
    }
}

impl TestApp {
    /// Creates a user directly and returns `(user_id, token)`.
    pub async fn user(&self, email: &str, role: Role, company_id: Option<i64>) -> (i64, String) {
        let token = generate_token();
        let user = users::insert(
            &self.pool,
            &users::NewUser {
                email,
                full_name: email.split('@').next().unwrap_or(email),
                role,
                company_id,
                api_token_hash: &hash_token(&token),
            },
        )
        .await
        .unwrap();
        (user.id, token)
    }

    pub async fn admin(&self) -> (i64, String) {
        self.user("admin@agency.test", Role::Admin, None).await
    }

    pub async fn call(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let req = match body {
            Some(body) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        self.send(req).await
    }

    pub async fn send(&self, req: Request<Body>) -> (StatusCode, Value) {
        let resp = self.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    pub async fn get(&self, uri: &str, token: &str) -> (StatusCode, Value) {
        self.call(Method::GET, uri, Some(token), None).await
    }

    pub async fn post(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        self.call(Method::POST, uri, Some(token), Some(body)).await
    }

    /// Creates a company through the API and returns its id.
    pub async fn company(&self, admin_token: &str, name: &str) -> i64 {
        let (status, body) = self
            .post("/api/companies", admin_token, serde_json::json!({ "name": name }))
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["id"].as_i64().unwrap()
    }
}
