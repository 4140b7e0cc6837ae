use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

use crate::money::{Currency, ExchangeRates, MoneyError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_CURRENCY: &str = "USD";
const CONFIG_DIR: &str = "config";

/// Pricing and discount settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PricingConfig {
    /// Currency of newly created orders
    #[validate(custom = "validate_currency")]
    #[serde(default = "default_currency")]
    pub default_currency: String,

    /// Compare min-spent thresholds against gross (true) or net prices
    #[serde(default = "default_true")]
    pub display_gross_prices: bool,

    /// Rates used to convert fixed discounts listed in another currency
    #[validate]
    #[serde(default)]
    pub exchange_rates: Vec<ExchangeRateConfig>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            default_currency: default_currency(),
            display_gross_prices: true,
            exchange_rates: Vec::new(),
        }
    }
}

impl PricingConfig {
    pub fn currency(&self) -> Result<Currency, MoneyError> {
        Currency::new(&self.default_currency)
    }

    pub fn exchange_rates(&self) -> Result<ExchangeRates, MoneyError> {
        let mut rates = ExchangeRates::new();
        for rate in &self.exchange_rates {
            rates.insert(Currency::new(&rate.from)?, Currency::new(&rate.to)?, rate.rate);
        }
        Ok(rates)
    }
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ExchangeRateConfig {
    #[validate(custom = "validate_currency")]
    pub from: String,
    #[validate(custom = "validate_currency")]
    pub to: String,
    #[validate(custom = "validate_positive_rate")]
    pub rate: Decimal,
}

/// Fulfillment workflow settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct FulfillmentConfig {
    /// New fulfillments skip the approval step
    #[serde(default = "default_true")]
    pub auto_approve: bool,

    /// Approving a fulfillment does not require a fully paid order
    #[serde(default = "default_true")]
    pub allow_unpaid: bool,

    /// Default for requests that do not say whether stock may be oversold
    #[serde(default)]
    pub allow_stock_to_be_exceeded: bool,
}

impl Default for FulfillmentConfig {
    fn default() -> Self {
        Self {
            auto_approve: true,
            allow_unpaid: true,
            allow_stock_to_be_exceeded: false,
        }
    }
}

/// Order lifecycle settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct OrdersConfig {
    /// Placed orders skip the unconfirmed status
    #[serde(default = "default_true")]
    pub automatically_confirm_all_new_orders: bool,
}

impl Default for OrdersConfig {
    fn default() -> Self {
        Self {
            automatically_confirm_all_new_orders: true,
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Application environment
    #[validate(length(min = 1))]
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging level
    #[validate(custom = "validate_log_level")]
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    #[validate]
    #[serde(default)]
    pub pricing: PricingConfig,

    #[validate]
    #[serde(default)]
    pub fulfillment: FulfillmentConfig,

    #[validate]
    #[serde(default)]
    pub orders: OrdersConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            log_level: default_log_level(),
            log_json: false,
            pricing: PricingConfig::default(),
            fulfillment: FulfillmentConfig::default(),
            orders: OrdersConfig::default(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_true() -> bool {
    true
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ValidationError::new("invalid_log_level")),
    }
}

fn validate_currency(code: &str) -> Result<(), ValidationError> {
    Currency::new(code)
        .map(|_| ())
        .map_err(|_| ValidationError::new("invalid_currency"))
}

fn validate_positive_rate(rate: &Decimal) -> Result<(), ValidationError> {
    if *rate <= Decimal::ZERO {
        return Err(ValidationError::new("rate_not_positive"));
    }
    Ok(())
}

/// Initializes tracing with the given level, honouring `RUST_LOG` when set.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("commerce_orders={}", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Environment variables prefixed with `APP__`
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    load_config_from(Path::new(CONFIG_DIR), &run_env)
}

/// Same as [`load_config`] with an explicit config directory and profile.
pub fn load_config_from(dir: &Path, run_env: &str) -> Result<AppConfig, AppConfigError> {
    info!("Loading configuration for environment: {}", run_env);

    if !dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            dir.display()
        );
    }

    let config = Config::builder()
        .set_default("environment", run_env)?
        .add_source(File::with_name(&dir.join("default").to_string_lossy()).required(false))
        .add_source(File::with_name(&dir.join(run_env).to_string_lossy()).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    Ok(app_config)
}
