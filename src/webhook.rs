//! Signed WooCommerce webhook deliveries.
//!
//! WooCommerce signs each delivery with `base64(HMAC-SHA256(secret, body))`
//! in `X-WC-Webhook-Signature`. When a webhook is first saved it sends a
//! form-encoded ping (`webhook_id=..`) which is acknowledged and dropped.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::billing::{self, Subscription};
use crate::config::Config;
use crate::db::{self, Pool};
use crate::model::CompanyStatus;

pub const SIGNATURE_HEADER: &str = "x-wc-webhook-signature";
pub const TOPIC_HEADER: &str = "x-wc-webhook-topic";
pub const DELIVERY_HEADER: &str = "x-wc-webhook-delivery-id";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing webhook signature")]
    MissingSignature,
    #[error("webhook signature mismatch")]
    BadSignature,
    #[error("malformed webhook payload: {0}")]
    Malformed(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
}

impl Topic {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "subscription.created" => Some(Topic::SubscriptionCreated),
            "subscription.updated" => Some(Topic::SubscriptionUpdated),
            "subscription.deleted" => Some(Topic::SubscriptionDeleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ping,
    Duplicate,
    Ignored { topic: String },
    Applied { company_id: i64, created: bool },
}

pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Constant-time check of a base64 signature against `body`.
pub fn verify_signature(secret: &str, body: &[u8], signature: Option<&str>) -> Result<(), WebhookError> {
    let signature = signature
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(WebhookError::MissingSignature)?;
    let expected = STANDARD
        .decode(signature)
        .map_err(|_| WebhookError::BadSignature)?;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::BadSignature)?;
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| WebhookError::BadSignature)
}

pub fn is_ping(body: &[u8]) -> bool {
    body.starts_with(b"webhook_id=")
}

/// Process one verified delivery.
///
/// A delivery id is recorded before processing and forgotten again if
/// processing fails, so WooCommerce's retry gets a second chance.
#[instrument(skip_all, fields(topic = %topic))]
pub async fn handle_delivery(
    pool: &Pool,
    cfg: &Config,
    topic: &str,
    delivery_id: Option<&str>,
    body: &[u8],
) -> Result<Outcome, WebhookError> {
    if is_ping(body) {
        info!("webhook ping acknowledged");
        return Ok(Outcome::Ping);
    }
    let Some(parsed) = Topic::parse(topic) else {
        info!(topic, "ignoring webhook topic");
        return Ok(Outcome::Ignored {
            topic: topic.to_string(),
        });
    };
    let sub: Subscription =
        serde_json::from_slice(body).map_err(|e| WebhookError::Malformed(e.to_string()))?;

    if let Some(id) = delivery_id {
        if !db::webhooks::record_delivery(pool, id, topic).await? {
            info!(delivery_id = id, "duplicate webhook delivery");
            return Ok(Outcome::Duplicate);
        }
    }

    let force = match parsed {
        Topic::SubscriptionDeleted => Some(CompanyStatus::Churned),
        Topic::SubscriptionCreated | Topic::SubscriptionUpdated => None,
    };
    match billing::apply_subscription(pool, cfg, &sub, force).await {
        Ok(applied) => {
            db::audit::record(
                pool,
                None,
                if applied.created {
                    "company.provisioned"
                } else {
                    "company.billing_updated"
                },
                "company",
                Some(applied.company.id),
                serde_json::json!({
                    "source": "woocommerce_webhook",
                    "topic": topic,
                    "subscription_id": sub.id,
                    "subscription_status": sub.status,
                    "company_status": applied.company.status,
                    "plan_tier": applied.company.plan_tier,
                }),
            )
            .await;
            Ok(Outcome::Applied {
                company_id: applied.company.id,
                created: applied.created,
            })
        }
        Err(err) => {
            warn!(?err, subscription_id = sub.id, "failed to apply subscription webhook");
            if let Some(id) = delivery_id {
                if let Err(forget_err) = db::webhooks::forget_delivery(pool, id).await {
                    warn!(?forget_err, "failed to release webhook delivery id");
                }
            }
            Err(WebhookError::Internal(err))
        }
    }
}
