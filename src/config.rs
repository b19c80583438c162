//! Configuration loader and validator for the agency portal.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::model::PlanTier;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub rate_limit: RateLimit,
    pub cache: Cache,
    pub woocommerce: WooCommerce,
    pub email: Email,
    pub invitations: Invitations,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub bind: String,
    pub data_dir: String,
    /// Base URL used to build links in outgoing emails.
    pub public_url: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
}

/// Fixed-window request limits per caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window_seconds: u64,
    /// Limit applied to unauthenticated routes (webhooks, invitation accept).
    pub public_max_requests: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cache {
    pub default_ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
}

/// WooCommerce REST credentials and plan mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WooCommerce {
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub webhook_secret: String,
    #[serde(default)]
    pub plans: Vec<PlanMapping>,
}

/// Maps a WooCommerce subscription product to a plan tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanMapping {
    pub product_id: i64,
    pub tier: PlanTier,
    pub active_request_limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Email {
    pub enabled: bool,
    pub api_url: String,
    pub api_key: String,
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Invitations {
    pub ttl_hours: i64,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Plan tier and request limit for a subscription product, if mapped.
    pub fn plan_for_product(&self, product_id: i64) -> Option<(PlanTier, i64)> {
        self.woocommerce
            .plans
            .iter()
            .find(|p| p.product_id == product_id)
            .map(|p| {
                (
                    p.tier,
                    p.active_request_limit
                        .unwrap_or_else(|| p.tier.default_active_limit()),
                )
            })
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.bind.trim().is_empty() {
        return Err(ConfigError::Invalid("app.bind must be non-empty"));
    }
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    if cfg.rate_limit.max_requests == 0 {
        return Err(ConfigError::Invalid("rate_limit.max_requests must be > 0"));
    }
    if cfg.rate_limit.public_max_requests == 0 {
        return Err(ConfigError::Invalid(
            "rate_limit.public_max_requests must be > 0",
        ));
    }
    if cfg.rate_limit.window_seconds == 0 {
        return Err(ConfigError::Invalid("rate_limit.window_seconds must be > 0"));
    }

    if cfg.cache.default_ttl_seconds == 0 {
        return Err(ConfigError::Invalid("cache.default_ttl_seconds must be > 0"));
    }
    if cfg.cache.sweep_interval_seconds == 0 {
        return Err(ConfigError::Invalid(
            "cache.sweep_interval_seconds must be > 0",
        ));
    }

    if cfg.woocommerce.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("woocommerce.base_url must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.woocommerce.base_url).is_err() {
        return Err(ConfigError::Invalid("woocommerce.base_url must be a valid URL"));
    }
    if cfg.woocommerce.webhook_secret.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "woocommerce.webhook_secret must be non-empty",
        ));
    }
    for plan in &cfg.woocommerce.plans {
        if matches!(plan.active_request_limit, Some(n) if n < 0) {
            return Err(ConfigError::Invalid(
                "woocommerce.plans[].active_request_limit must be >= 0",
            ));
        }
    }

    if cfg.email.enabled {
        if cfg.email.api_url.trim().is_empty() {
            return Err(ConfigError::Invalid("email.api_url must be non-empty"));
        }
        if cfg.email.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid("email.api_key must be non-empty"));
        }
    }
    if cfg.email.from.trim().is_empty() {
        return Err(ConfigError::Invalid("email.from must be non-empty"));
    }

    if cfg.invitations.ttl_hours <= 0 {
        return Err(ConfigError::Invalid("invitations.ttl_hours must be > 0"));
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  bind: "0.0.0.0:8080"
  data_dir: "./data"
  public_url: "https://portal.example.com"
  poll_interval_ms: 500
  max_backoff_seconds: 300

rate_limit:
  max_requests: 120
  window_seconds: 60
  public_max_requests: 20

cache:
  default_ttl_seconds: 300
  sweep_interval_seconds: 60

woocommerce:
  base_url: "https://shop.example.com/"
  consumer_key: "ck_YOUR_CONSUMER_KEY"
  consumer_secret: "cs_YOUR_CONSUMER_SECRET"
  webhook_secret: "YOUR_WEBHOOK_SECRET"
  plans:
    - product_id: 101
      tier: starter
    - product_id: 102
      tier: growth
    - product_id: 103
      tier: scale
      active_request_limit: 4

email:
  enabled: false
  api_url: "https://api.resend.com/emails"
  api_key: "YOUR_EMAIL_API_KEY"
  from: "Studio <hello@example.com>"

invitations:
  ttl_hours: 168
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.woocommerce.plans.len(), 3);
    }

    #[test]
    fn invalid_rate_limit() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.rate_limit.max_requests = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("rate_limit.max_requests")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.rate_limit.window_seconds = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_woocommerce() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.woocommerce.webhook_secret = "  ".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("webhook_secret")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.woocommerce.base_url = "not a url".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn email_key_required_only_when_enabled() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.email.api_key = "".into();
        validate(&cfg).unwrap();

        cfg.email.enabled = true;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("email.api_key")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn plan_for_product_uses_tier_default_limit() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        assert_eq!(cfg.plan_for_product(101), Some((PlanTier::Starter, 1)));
        assert_eq!(cfg.plan_for_product(103), Some((PlanTier::Scale, 4)));
        assert_eq!(cfg.plan_for_product(999), None);
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        let mut f = fs::File::create(&p).unwrap();
        f.write_all(example().as_bytes()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.invitations.ttl_hours, 168);
    }
}
