//! Application configuration module
//! Handles environment variable loading, configuration validation, and application settings

use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheSettings,
    pub logging: LoggingConfig,
    pub gateway: GatewayConfig,
    pub settlement: SettlementConfig,
    pub webhook: WebhookConfig,
    pub sweeps: SweepConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
}

/// Redis settings for the session projection and job locks
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub redis_url: String,
    pub session_ttl: u64, // seconds
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

/// Payment gateway credentials and behaviour
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub invoice_code: String,
    pub timeout_secs: u64,
    pub token_safety_margin_secs: u64,
    pub receipt_enabled: bool,
    pub receipt_receiver_type: String,
}

/// Fixed conversion applied when a session is created
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub currency: String,
    /// Settlement minor units per one unit of the cart currency.
    pub rate: Decimal,
}

/// Webhook authentication and callback addressing
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub public_callback_base_url: String,
    pub internal_token: String,
}

/// Periodic job settings
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub reconcile_enabled: bool,
    pub reconcile_interval: Duration,
    pub reconcile_batch_size: i64,
    pub reconcile_min_age: Duration,
    pub check_cooldown: Duration,
    pub cleanup_enabled: bool,
    pub cleanup_interval: Duration,
    pub cleanup_batch_size: i64,
    pub pending_expiry: Duration,
    pub audit_retention: Duration,
    pub closed_session_retention: Duration,
    pub processed_session_retention: Option<Duration>,
    pub ledger_retention: Option<Duration>,
    pub claim_lease: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            reconcile_enabled: true,
            reconcile_interval: Duration::from_secs(60),
            reconcile_batch_size: 25,
            reconcile_min_age: Duration::from_secs(30),
            check_cooldown: Duration::from_secs(20),
            cleanup_enabled: true,
            cleanup_interval: Duration::from_secs(6 * 3600),
            cleanup_batch_size: 500,
            pending_expiry: Duration::from_secs(30 * 60),
            audit_retention: days(90),
            closed_session_retention: days(30),
            processed_session_retention: Some(days(365)),
            ledger_retention: Some(days(365)),
            claim_lease: Duration::from_secs(300),
        }
    }
}

fn days(n: u64) -> Duration {
    Duration::from_secs(n * 24 * 3600)
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database: DatabaseConfig::from_env()?,
            cache: CacheSettings::from_env()?,
            logging: LoggingConfig::from_env()?,
            gateway: GatewayConfig::from_env()?,
            settlement: SettlementConfig::from_env()?,
            webhook: WebhookConfig::from_env()?,
            sweeps: SweepConfig::from_env()?,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.database.validate()?;
        self.cache.validate()?;
        self.logging.validate()?;
        self.gateway.validate()?;
        self.settlement.validate()?;
        self.webhook.validate()?;
        self.sweeps.validate()?;

        Ok(())
    }
}

fn required(name: &str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingVariable(name.to_string())),
    }
}

fn parsed_or<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(default),
    }
}

fn secs_or(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parsed_or(name, default.as_secs())?))
}

/// Optional retention window in days; `0` or `none` keeps rows forever.
fn retention_days(name: &str, default: Option<Duration>) -> Result<Option<Duration>, ConfigError> {
    match env::var(name) {
        Ok(raw) => {
            let raw = raw.trim().to_lowercase();
            if raw == "none" || raw == "0" {
                return Ok(None);
            }
            let n: u64 = raw
                .parse()
                .map_err(|_| ConfigError::InvalidValue(name.to_string()))?;
            Ok(Some(days(n)))
        }
        Err(_) => Ok(default),
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parsed_or("SERVER_PORT", 8000)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL").unwrap_or_default(),
            max_connections: parsed_or("DB_MAX_CONNECTIONS", 20)?,
            min_connections: parsed_or("DB_MIN_CONNECTIONS", 5)?,
            connection_timeout: parsed_or("DB_CONNECTION_TIMEOUT", 30)?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl CacheSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(CacheSettings {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            session_ttl: parsed_or("SESSION_CACHE_TTL", 900)?,
            max_connections: parsed_or("CACHE_MAX_CONNECTIONS", 10)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // Basic validation of Redis URL format
        if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://") {
            return Err(ConfigError::InvalidValue(
                "REDIS_URL must start with redis:// or rediss://".to_string(),
            ));
        }

        if self.session_ttl == 0 {
            return Err(ConfigError::InvalidValue("SESSION_CACHE_TTL".to_string()));
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(GatewayConfig {
            base_url: env::var("GATEWAY_BASE_URL")
                .unwrap_or_else(|_| "https://merchant.qpay.mn".to_string()),
            username: required("GATEWAY_USERNAME")?,
            password: required("GATEWAY_PASSWORD")?,
            invoice_code: required("GATEWAY_INVOICE_CODE")?,
            timeout_secs: parsed_or("GATEWAY_TIMEOUT_SECS", 15)?,
            token_safety_margin_secs: parsed_or("GATEWAY_TOKEN_SAFETY_MARGIN_SECS", 60)?,
            receipt_enabled: parsed_or("RECEIPT_ENABLED", false)?,
            receipt_receiver_type: env::var("RECEIPT_RECEIVER_TYPE")
                .unwrap_or_else(|_| "CITIZEN".to_string()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "GATEWAY_BASE_URL must be a valid URL".to_string(),
            ));
        }

        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue("GATEWAY_TIMEOUT_SECS".to_string()));
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SettlementConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(SettlementConfig {
            currency: env::var("SETTLEMENT_CURRENCY").unwrap_or_else(|_| "MNT".to_string()),
            rate: parsed_or("SETTLEMENT_RATE", Decimal::ONE)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate <= Decimal::ZERO {
            return Err(ConfigError::InvalidValue(
                "SETTLEMENT_RATE must be positive".to_string(),
            ));
        }

        if self.currency.trim().is_empty() {
            return Err(ConfigError::InvalidValue("SETTLEMENT_CURRENCY".to_string()));
        }

        Ok(())
    }
}

impl WebhookConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(WebhookConfig {
            public_callback_base_url: required("PUBLIC_CALLBACK_BASE_URL")?,
            internal_token: required("INTERNAL_WEBHOOK_TOKEN")?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if url::Url::parse(&self.public_callback_base_url).is_err() {
            return Err(ConfigError::InvalidValue(
                "PUBLIC_CALLBACK_BASE_URL must be a valid URL".to_string(),
            ));
        }

        if self.internal_token.len() < 16 {
            return Err(ConfigError::InvalidValue(
                "INTERNAL_WEBHOOK_TOKEN must be at least 16 characters".to_string(),
            ));
        }

        Ok(())
    }
}

impl SweepConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(SweepConfig {
            reconcile_enabled: parsed_or("RECONCILE_ENABLED", defaults.reconcile_enabled)?,
            reconcile_interval: secs_or("RECONCILE_INTERVAL_SECS", defaults.reconcile_interval)?,
            reconcile_batch_size: parsed_or("RECONCILE_BATCH_SIZE", defaults.reconcile_batch_size)?,
            reconcile_min_age: secs_or("RECONCILE_MIN_AGE_SECS", defaults.reconcile_min_age)?,
            check_cooldown: secs_or("SESSION_CHECK_COOLDOWN_SECS", defaults.check_cooldown)?,
            cleanup_enabled: parsed_or("CLEANUP_ENABLED", defaults.cleanup_enabled)?,
            cleanup_interval: secs_or("CLEANUP_INTERVAL_SECS", defaults.cleanup_interval)?,
            cleanup_batch_size: parsed_or("CLEANUP_BATCH_SIZE", defaults.cleanup_batch_size)?,
            pending_expiry: secs_or("PENDING_EXPIRY_SECS", defaults.pending_expiry)?,
            audit_retention: retention_days("AUDIT_RETENTION_DAYS", Some(defaults.audit_retention))?
                .unwrap_or(defaults.audit_retention),
            closed_session_retention: retention_days(
                "CLOSED_SESSION_RETENTION_DAYS",
                Some(defaults.closed_session_retention),
            )?
            .unwrap_or(defaults.closed_session_retention),
            processed_session_retention: retention_days(
                "PROCESSED_SESSION_RETENTION_DAYS",
                defaults.processed_session_retention,
            )?,
            ledger_retention: retention_days("LEDGER_RETENTION_DAYS", defaults.ledger_retention)?,
            claim_lease: secs_or("LEDGER_CLAIM_LEASE_SECS", defaults.claim_lease)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // The lock TTL is derived from the interval, so it needs headroom.
        if self.reconcile_interval < Duration::from_secs(10) {
            return Err(ConfigError::InvalidValue(
                "RECONCILE_INTERVAL_SECS must be at least 10".to_string(),
            ));
        }

        if self.cleanup_interval < Duration::from_secs(10) {
            return Err(ConfigError::InvalidValue(
                "CLEANUP_INTERVAL_SECS must be at least 10".to_string(),
            ));
        }

        if self.reconcile_batch_size <= 0 || self.cleanup_batch_size <= 0 {
            return Err(ConfigError::InvalidValue(
                "sweep batch sizes must be positive".to_string(),
            ));
        }

        if self.pending_expiry.is_zero() {
            return Err(ConfigError::InvalidValue("PENDING_EXPIRY_SECS".to_string()));
        }

        Ok(())
    }

    /// Lock TTL for a job: slightly shorter than its interval.
    pub fn lock_ttl(interval: Duration) -> Duration {
        interval
            .checked_sub(Duration::from_secs(5))
            .filter(|ttl| !ttl.is_zero())
            .unwrap_or(interval)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> GatewayConfig {
        GatewayConfig {
            base_url: "https://gateway.test".to_string(),
            username: "merchant".to_string(),
            password: "secret".to_string(),
            invoice_code: "SHOP_INVOICE".to_string(),
            timeout_secs: 15,
            token_safety_margin_secs: 60,
            receipt_enabled: false,
            receipt_receiver_type: "CITIZEN".to_string(),
        }
    }

    #[test]
    fn test_server_config_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8000,
        };

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_port_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_gateway_url_must_be_http() {
        let mut config = gateway();
        assert!(config.validate().is_ok());

        config.base_url = "ftp://gateway.test".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_settlement_rate_must_be_positive() {
        let config = SettlementConfig {
            currency: "MNT".to_string(),
            rate: Decimal::ZERO,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_short_internal_token_rejected() {
        let config = WebhookConfig {
            public_callback_base_url: "https://shop.test".to_string(),
            internal_token: "short".to_string(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_sweep_config_is_valid() {
        let config = SweepConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reconcile_batch_size, 25);
        assert_eq!(config.pending_expiry, Duration::from_secs(1800));
    }

    #[test]
    fn test_lock_ttl_is_shorter_than_interval() {
        assert_eq!(
            SweepConfig::lock_ttl(Duration::from_secs(60)),
            Duration::from_secs(55)
        );
        assert_eq!(
            SweepConfig::lock_ttl(Duration::from_secs(3)),
            Duration::from_secs(3)
        );
    }
}
