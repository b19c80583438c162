//! WooCommerce Subscriptions integration.
//!
//! [`BillingService`] is the seam the API and webhook handlers depend on;
//! [`WooCommerceClient`] is the REST implementation. [`apply_subscription`]
//! turns a subscription into company state and is shared by the webhook and
//! the manual sync endpoint.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::fmt;
use tracing::{info, instrument, warn};

use crate::config::{self, Config};
use crate::db::companies::{self, CompanyChanges, NewCompany};
use crate::db::Pool;
use crate::model::{Company, CompanyStatus, PlanTier};

pub mod model;

pub use model::Subscription;

const API_PREFIX: &str = "wp-json/wc/v3/";

#[async_trait]
pub trait BillingService: Send + Sync {
    async fn get_subscription(&self, subscription_id: i64) -> Result<Subscription>;

    async fn list_customer_subscriptions(&self, customer_id: i64) -> Result<Vec<Subscription>>;
}

#[derive(Clone)]
pub struct WooCommerceClient {
    http: Client,
    base_url: Url,
    consumer_key: String,
    consumer_secret: String,
}

impl fmt::Debug for WooCommerceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WooCommerceClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl WooCommerceClient {
    pub fn new(base_url: &str, consumer_key: String, consumer_secret: String) -> Result<Self> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).with_context(|| format!("invalid WooCommerce URL {base}"))?;
        let http = Client::builder()
            .user_agent("agency-portal/0.1")
            .build()
            .context("reqwest client")?;
        Ok(Self {
            http,
            base_url,
            consumer_key,
            consumer_secret,
        })
    }

    pub fn from_config(cfg: &config::WooCommerce) -> Result<Self> {
        Self::new(
            &cfg.base_url,
            cfg.consumer_key.clone(),
            cfg.consumer_secret.clone(),
        )
    }

    pub fn build_request(&self, path: &str, query: &[(&str, String)]) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(API_PREFIX)
            .and_then(|u| u.join(path))
            .context("invalid WooCommerce endpoint")?;
        self.http
            .get(endpoint)
            .basic_auth(&self.consumer_key, Some(&self.consumer_secret))
            .query(query)
            .build()
            .context("failed to build WooCommerce request")
    }

    async fn execute<T: DeserializeOwned>(&self, request: reqwest::Request) -> Result<T> {
        let url = request.url().path().to_string();
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach WooCommerce")?;
        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!(%url, %body, "rate limited by WooCommerce");
            return Err(anyhow!("received 429 from WooCommerce: {body}"));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%url, %status, %body, "WooCommerce API error");
            return Err(anyhow!("woocommerce error {status}: {body}"));
        }
        res.json::<T>().await.context("invalid WooCommerce response JSON")
    }
}

#[async_trait]
impl BillingService for WooCommerceClient {
    #[instrument(skip(self))]
    async fn get_subscription(&self, subscription_id: i64) -> Result<Subscription> {
        let request = self.build_request(&format!("subscriptions/{subscription_id}"), &[])?;
        self.execute(request).await
    }

    #[instrument(skip(self))]
    async fn list_customer_subscriptions(&self, customer_id: i64) -> Result<Vec<Subscription>> {
        let request = self.build_request(
            "subscriptions",
            &[("customer", customer_id.to_string()), ("per_page", "100".into())],
        )?;
        self.execute(request).await
    }
}

/// Company status for a WooCommerce subscription status.
pub fn map_subscription_status(status: &str) -> Option<CompanyStatus> {
    match status {
        "active" | "pending-cancel" => Some(CompanyStatus::Active),
        "on-hold" | "pending" => Some(CompanyStatus::Paused),
        "cancelled" | "expired" | "trash" => Some(CompanyStatus::Churned),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct Applied {
    pub company: Company,
    pub created: bool,
}

/// Provision or update the company linked to `sub`.
///
/// A first sighting creates the company; later ones update status and plan.
/// Unknown subscription statuses leave the status alone (new companies start
/// paused). `force_status` overrides the mapping, e.g. for deletions.
#[instrument(skip_all, fields(subscription_id = sub.id))]
pub async fn apply_subscription(
    pool: &Pool,
    cfg: &Config,
    sub: &Subscription,
    force_status: Option<CompanyStatus>,
) -> Result<Applied> {
    let status = force_status.or_else(|| map_subscription_status(&sub.status));
    if status.is_none() {
        warn!(status = %sub.status, "unmapped subscription status");
    }
    let plan = sub.plan_product_id().and_then(|p| cfg.plan_for_product(p));
    let billing_email = Some(sub.billing.email.trim().to_lowercase()).filter(|e| !e.is_empty());

    match companies::find_by_subscription(pool, sub.id).await? {
        None => {
            let (tier, limit) = plan.unwrap_or((PlanTier::Starter, PlanTier::Starter.default_active_limit()));
            let company = companies::insert(
                pool,
                &NewCompany {
                    name: sub.company_name(),
                    status: status.unwrap_or(CompanyStatus::Paused),
                    plan_tier: tier,
                    active_request_limit: limit,
                    billing_email,
                    woo_customer_id: Some(sub.customer_id).filter(|id| *id > 0),
                    woo_subscription_id: Some(sub.id),
                },
            )
            .await?;
            info!(company_id = company.id, "provisioned company from subscription");
            Ok(Applied {
                company,
                created: true,
            })
        }
        Some(existing) => {
            let changes = CompanyChanges {
                status: status.filter(|s| *s != existing.status),
                plan_tier: plan.map(|(t, _)| t).filter(|t| *t != existing.plan_tier),
                active_request_limit: plan
                    .map(|(_, l)| l)
                    .filter(|l| *l != existing.active_request_limit),
                billing_email: billing_email.filter(|e| existing.billing_email.as_deref() != Some(e.as_str())),
                ..Default::default()
            };
            if changes.is_empty() {
                return Ok(Applied {
                    company: existing,
                    created: false,
                });
            }
            let company = companies::update(pool, existing.id, &changes)
                .await?
                .ok_or_else(|| anyhow!("company {} vanished during update", existing.id))?;
            info!(company_id = company.id, status = company.status.as_str(), "company updated from subscription");
            Ok(Applied {
                company,
                created: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::model::CompanyStatus;
    use model::{BillingAddress, LineItem};

    pub(crate) fn subscription(id: i64, status: &str, product_id: i64) -> Subscription {
        Subscription {
            id,
            customer_id: 77,
            status: status.into(),
            billing: BillingAddress {
                first_name: "Dana".into(),
                last_name: "Reyes".into(),
                company: String::new(),
                email: "Dana@Example.com".into(),
            },
            line_items: vec![LineItem {
                product_id,
                name: "Plan".into(),
                quantity: 1,
                total: "499.00".into(),
            }],
            total: "499.00".into(),
            currency: "USD".into(),
            billing_period: "month".into(),
            next_payment_date_gmt: None,
        }
    }

    #[test]
    fn status_mapping() {
        assert_eq!(map_subscription_status("active"), Some(CompanyStatus::Active));
        assert_eq!(map_subscription_status("pending-cancel"), Some(CompanyStatus::Active));
        assert_eq!(map_subscription_status("on-hold"), Some(CompanyStatus::Paused));
        assert_eq!(map_subscription_status("expired"), Some(CompanyStatus::Churned));
        assert_eq!(map_subscription_status("switched"), None);
    }

    #[test]
    fn build_request_uses_basic_auth_and_api_prefix() {
        let client = WooCommerceClient::new("https://shop.example.com/store", "ck".into(), "cs".into()).unwrap();
        let req = client
            .build_request("subscriptions", &[("customer", "5".into())])
            .unwrap();
        assert_eq!(
            req.url().as_str(),
            "https://shop.example.com/store/wp-json/wc/v3/subscriptions?customer=5"
        );
        let auth = req.headers().get("authorization").unwrap().to_str().unwrap();
        assert!(auth.starts_with("Basic "));
    }

    #[test]
    fn company_name_falls_back_to_person() {
        let mut sub = subscription(1, "active", 101);
        assert_eq!(sub.company_name(), "Dana Reyes");
        sub.billing.company = "Reyes Bakery".into();
        assert_eq!(sub.company_name(), "Reyes Bakery");
        sub.billing = BillingAddress::default();
        assert_eq!(sub.company_name(), "Subscription #1");
    }

    #[tokio::test]
    async fn apply_provisions_then_updates() {
        let pool = memory_pool().await.unwrap();
        let cfg: Config = serde_yaml::from_str(config::example()).unwrap();

        let first = apply_subscription(&pool, &cfg, &subscription(500, "active", 103), None)
            .await
            .unwrap();
        assert!(first.created);
        assert_eq!(first.company.plan_tier, PlanTier::Scale);
        assert_eq!(first.company.active_request_limit, 4);
        assert_eq!(first.company.billing_email.as_deref(), Some("dana@example.com"));

        let again = apply_subscription(&pool, &cfg, &subscription(500, "on-hold", 102), None)
            .await
            .unwrap();
        assert!(!again.created);
        assert_eq!(again.company.id, first.company.id);
        assert_eq!(again.company.status, CompanyStatus::Paused);
        assert_eq!(again.company.plan_tier, PlanTier::Growth);
        assert_eq!(again.company.active_request_limit, 2);

        let gone = apply_subscription(
            &pool,
            &cfg,
            &subscription(500, "active", 102),
            Some(CompanyStatus::Churned),
        )
        .await
        .unwrap();
        assert_eq!(gone.company.status, CompanyStatus::Churned);
    }
}
