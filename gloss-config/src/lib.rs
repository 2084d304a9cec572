use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Args;
use serde::{Deserialize, Serialize};

/// Service configuration for the Gloss backend.
///
/// Values are resolved in three layers: built-in defaults, an optional
/// JSON config file, and environment variables (highest precedence).
#[derive(Debug, Clone, Serialize, Deserialize, Args)]
pub struct GlossConfig {
    #[clap(long, default_value = "3000")]
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[clap(long, default_value_os_t = default_db_path())]
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Public base URL used for checkout success/cancel redirects.
    #[clap(long, default_value_t = default_base_url())]
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[clap(long)]
    pub stripe_secret_key: Option<String>,
    #[clap(long)]
    pub stripe_webhook_secret: Option<String>,
    #[clap(long)]
    pub stripe_monthly_price_id: Option<String>,
    #[clap(long)]
    pub stripe_annual_price_id: Option<String>,
    #[clap(long)]
    pub stripe_lifetime_price_id: Option<String>,
    #[clap(long)]
    pub openai_api_key: Option<String>,
    #[clap(long, default_value_t = default_openai_model())]
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    /// Daily explanation quota for free-tier users.
    #[clap(long, default_value = "10")]
    #[serde(default = "default_free_daily_limit")]
    pub free_daily_limit: u32,
    /// Daily explanation quota for premium-equivalent users.
    #[clap(long, default_value = "500")]
    #[serde(default = "default_premium_daily_limit")]
    pub premium_daily_limit: u32,
    /// Response cache time-to-live, in seconds. Defaults to 30 days.
    #[clap(long, default_value = "2592000")]
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_listen_port() -> u16 {
    3000
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/gloss/entitlements.redb")
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_free_daily_limit() -> u32 {
    10
}

fn default_premium_daily_limit() -> u32 {
    500
}

fn default_cache_ttl_secs() -> u64 {
    2_592_000
}

impl Default for GlossConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            db_path: default_db_path(),
            base_url: default_base_url(),
            stripe_secret_key: None,
            stripe_webhook_secret: None,
            stripe_monthly_price_id: None,
            stripe_annual_price_id: None,
            stripe_lifetime_price_id: None,
            openai_api_key: None,
            openai_model: default_openai_model(),
            free_daily_limit: default_free_daily_limit(),
            premium_daily_limit: default_premium_daily_limit(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl GlossConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: GlossConfig = serde_json::from_slice(&std::fs::read(path)?)?;
        Ok(config)
    }

    /// Load configuration: JSON file if present, otherwise defaults,
    /// with environment variables applied on top.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let base = if path.as_ref().exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };
        Ok(base.apply_env())
    }

    fn apply_env(mut self) -> Self {
        if let Ok(v) = std::env::var("GLOSS_LISTEN_PORT") {
            if let Ok(port) = v.parse() {
                self.listen_port = port;
            }
        }
        if let Ok(v) = std::env::var("GLOSS_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GLOSS_BASE_URL") {
            self.base_url = v;
        }
        if let Ok(v) = std::env::var("STRIPE_SECRET_KEY") {
            self.stripe_secret_key = Some(v);
        }
        if let Ok(v) = std::env::var("STRIPE_WEBHOOK_SECRET") {
            self.stripe_webhook_secret = Some(v);
        }
        if let Ok(v) = std::env::var("STRIPE_MONTHLY_PRICE_ID") {
            self.stripe_monthly_price_id = Some(v);
        }
        if let Ok(v) = std::env::var("STRIPE_ANNUAL_PRICE_ID") {
            self.stripe_annual_price_id = Some(v);
        }
        if let Ok(v) = std::env::var("STRIPE_LIFETIME_PRICE_ID") {
            self.stripe_lifetime_price_id = Some(v);
        }
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            self.openai_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("OPENAI_MODEL") {
            self.openai_model = v;
        }
        if let Ok(v) = std::env::var("GLOSS_FREE_DAILY_LIMIT") {
            if let Ok(limit) = v.parse() {
                self.free_daily_limit = limit;
            }
        }
        if let Ok(v) = std::env::var("GLOSS_PREMIUM_DAILY_LIMIT") {
            if let Ok(limit) = v.parse() {
                self.premium_daily_limit = limit;
            }
        }
        if let Ok(v) = std::env::var("GLOSS_CACHE_TTL_SECS") {
            if let Ok(ttl) = v.parse() {
                self.cache_ttl_secs = ttl;
            }
        }
        self
    }
}
