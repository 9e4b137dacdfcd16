use config::{Config, ConfigError, Environment, File};
use rust_decimal::{prelude::FromPrimitive, Decimal};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

use crate::services::pricing::PricingPolicy;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1))]
    pub db_max_connections: u32,
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Rate limiting: bucket capacity; refills fully over one window
    #[serde(default = "default_true_bool")]
    pub rate_limit_enabled: bool,
    #[serde(default = "default_rate_limit_requests")]
    #[validate(range(min = 1))]
    pub rate_limit_requests_per_window: u32,
    #[serde(default = "default_rate_limit_window_secs")]
    #[validate(range(min = 1))]
    pub rate_limit_window_seconds: u64,
    #[serde(default = "default_true_bool")]
    pub rate_limit_enable_headers: bool,
    /// Comma-separated `prefix:limit:window_secs` overrides
    #[serde(default)]
    pub rate_limit_path_policies: Option<String>,
    #[serde(default = "default_rate_limit_idle_ttl_secs")]
    pub rate_limit_idle_ttl_secs: u64,
    #[serde(default = "default_rate_limit_eviction_interval_secs")]
    #[validate(range(min = 1))]
    pub rate_limit_eviction_interval_secs: u64,

    /// ISO 4217 currency for new checkout sessions
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub default_currency: String,

    /// Tax rate applied to the discounted subtotal
    #[serde(default = "default_tax_rate")]
    #[validate(custom = "validate_tax_rate")]
    pub default_tax_rate: f64,

    /// Country code shipments ship domestically within
    #[serde(default = "default_store_country")]
    #[validate(length(equal = 2))]
    pub store_country: String,
    #[serde(default = "default_domestic_shipping_fee")]
    #[validate(custom = "validate_money")]
    pub domestic_shipping_fee: f64,
    #[serde(default = "default_international_shipping_fee")]
    #[validate(custom = "validate_money")]
    pub international_shipping_fee: f64,
    #[serde(default)]
    pub free_shipping_threshold: Option<f64>,

    /// Checkout session lifetime before the sweeper expires it
    #[serde(default = "default_checkout_session_ttl_secs")]
    #[validate(range(min = 60))]
    pub checkout_session_ttl_secs: u64,
    #[serde(default = "default_session_sweep_interval_secs")]
    #[validate(range(min = 1))]
    pub session_sweep_interval_secs: u64,
    #[serde(default = "default_session_sweep_batch_size")]
    #[validate(range(min = 1))]
    pub session_sweep_batch_size: u64,

    /// Confirmed-but-orderless sessions older than this are reconciled
    #[serde(default = "default_orphan_grace_period_secs")]
    #[validate(range(min = 1))]
    pub orphan_grace_period_secs: u64,
    #[serde(default = "default_orphan_sweep_interval_secs")]
    #[validate(range(min = 1))]
    pub orphan_sweep_interval_secs: u64,
    /// `revert` or `retry`
    #[serde(default = "default_orphan_policy")]
    #[validate(custom = "validate_orphan_policy")]
    pub orphan_policy: String,

    /// Payment provider base URL; payment initiation is disabled when unset
    #[serde(default)]
    pub payment_provider_url: Option<String>,
    #[serde(default)]
    pub payment_provider_api_key: Option<String>,
    #[serde(default = "default_payment_provider_timeout_secs")]
    pub payment_provider_timeout_secs: u64,

    /// HMAC secret for inbound payment webhooks; verification is skipped when unset
    #[serde(default)]
    pub payment_webhook_secret: Option<String>,
    #[serde(default = "default_payment_webhook_tolerance_secs")]
    pub payment_webhook_tolerance_secs: u64,

    /// Bearer token for administrative order status updates; the route rejects all calls when unset
    #[serde(default)]
    pub admin_api_token: Option<String>,

    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,
}

/// What the orphan sweeper does with a session confirmed without an order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrphanPolicy {
    /// Clear the confirmation so the customer may confirm again.
    Revert,
    /// Re-run order creation, reverting when stock is no longer available.
    Retry,
}

impl std::str::FromStr for OrphanPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "revert" => Ok(OrphanPolicy::Revert),
            "retry" => Ok(OrphanPolicy::Retry),
            other => Err(format!("unknown orphan policy '{}'", other)),
        }
    }
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            rate_limit_enabled: true,
            rate_limit_requests_per_window: default_rate_limit_requests(),
            rate_limit_window_seconds: default_rate_limit_window_secs(),
            rate_limit_enable_headers: true,
            rate_limit_path_policies: None,
            rate_limit_idle_ttl_secs: default_rate_limit_idle_ttl_secs(),
            rate_limit_eviction_interval_secs: default_rate_limit_eviction_interval_secs(),
            default_currency: default_currency(),
            default_tax_rate: default_tax_rate(),
            store_country: default_store_country(),
            domestic_shipping_fee: default_domestic_shipping_fee(),
            international_shipping_fee: default_international_shipping_fee(),
            free_shipping_threshold: None,
            checkout_session_ttl_secs: default_checkout_session_ttl_secs(),
            session_sweep_interval_secs: default_session_sweep_interval_secs(),
            session_sweep_batch_size: default_session_sweep_batch_size(),
            orphan_grace_period_secs: default_orphan_grace_period_secs(),
            orphan_sweep_interval_secs: default_orphan_sweep_interval_secs(),
            orphan_policy: default_orphan_policy(),
            payment_provider_url: None,
            payment_provider_api_key: None,
            payment_provider_timeout_secs: default_payment_provider_timeout_secs(),
            payment_webhook_secret: None,
            payment_webhook_tolerance_secs: default_payment_webhook_tolerance_secs(),
            admin_api_token: None,
            event_channel_capacity: default_event_channel_capacity(),
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn checkout_session_ttl(&self) -> Duration {
        Duration::from_secs(self.checkout_session_ttl_secs)
    }

    pub fn orphan_grace_period(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_period_secs)
    }

    /// Validated at load time; falls back to `Revert` for hand-built configs.
    pub fn orphan_policy(&self) -> OrphanPolicy {
        self.orphan_policy.parse().unwrap_or(OrphanPolicy::Revert)
    }

    /// Builds the pricing policy from the configured rates and fees.
    pub fn pricing_policy(&self) -> Result<PricingPolicy, AppConfigError> {
        Ok(PricingPolicy {
            tax_rate: to_decimal("default_tax_rate", self.default_tax_rate)?,
            store_country: self.store_country.to_ascii_uppercase(),
            domestic_shipping_fee: to_decimal("domestic_shipping_fee", self.domestic_shipping_fee)?,
            international_shipping_fee: to_decimal(
                "international_shipping_fee",
                self.international_shipping_fee,
            )?,
            free_shipping_threshold: self
                .free_shipping_threshold
                .map(|value| to_decimal("free_shipping_threshold", value))
                .transpose()?,
        })
    }
}

fn to_decimal(field: &'static str, value: f64) -> Result<Decimal, AppConfigError> {
    Decimal::from_f64(value)
        .map(|d| d.round_dp(4).normalize())
        .ok_or(AppConfigError::InvalidValue(field))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Configuration value for {0} is not representable")]
    InvalidValue(&'static str),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true_bool() -> bool {
    true
}

fn default_db_max_connections() -> u32 {
    20
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    10
}
fn default_db_idle_timeout_secs() -> u64 {
    300
}
fn default_db_acquire_timeout_secs() -> u64 {
    10
}

fn default_rate_limit_requests() -> u32 {
    100
}
fn default_rate_limit_window_secs() -> u64 {
    60
}
fn default_rate_limit_idle_ttl_secs() -> u64 {
    600
}
fn default_rate_limit_eviction_interval_secs() -> u64 {
    60
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_tax_rate() -> f64 {
    0.11
}

fn default_store_country() -> String {
    "US".to_string()
}

fn default_domestic_shipping_fee() -> f64 {
    5.0
}

fn default_international_shipping_fee() -> f64 {
    20.0
}

fn default_checkout_session_ttl_secs() -> u64 {
    3600
}
fn default_session_sweep_interval_secs() -> u64 {
    60
}
fn default_session_sweep_batch_size() -> u64 {
    500
}

fn default_orphan_grace_period_secs() -> u64 {
    300
}
fn default_orphan_sweep_interval_secs() -> u64 {
    120
}
fn default_orphan_policy() -> String {
    "revert".to_string()
}

fn default_payment_provider_timeout_secs() -> u64 {
    10
}
fn default_payment_webhook_tolerance_secs() -> u64 {
    300
}

fn default_event_channel_capacity() -> usize {
    1024
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_tax_rate(rate: f64) -> Result<(), ValidationError> {
    if !rate.is_finite() || rate < 0.0 || rate > 1.0 {
        let mut err = ValidationError::new("default_tax_rate");
        err.message = Some("default_tax_rate must be a finite value between 0.0 and 1.0".into());
        return Err(err);
    }
    Ok(())
}

fn validate_money(amount: f64) -> Result<(), ValidationError> {
    if !amount.is_finite() || amount < 0.0 {
        let mut err = ValidationError::new("money");
        err.message = Some("amount must be a finite, non-negative value".into());
        return Err(err);
    }
    Ok(())
}

fn validate_orphan_policy(value: &str) -> Result<(), ValidationError> {
    value.parse::<OrphanPolicy>().map(|_| ()).map_err(|_| {
        let mut err = ValidationError::new("orphan_policy");
        err.message = Some("Must be one of: revert, retry".into());
        err
    })
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("marketplace_api={},tower_http=info", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    load_config_from(Path::new(CONFIG_DIR), &run_env)
}

pub fn load_config_from(config_dir: &Path, run_env: &str) -> Result<AppConfig, AppConfigError> {
    info!("Loading configuration for environment: {}", run_env);

    if !config_dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir.display()
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://marketplace.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", run_env)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::from(config_dir.join("default")).required(false))
        .add_source(File::from(config_dir.join(run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
