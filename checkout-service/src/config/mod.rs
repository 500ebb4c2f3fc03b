//! Configuration module for checkout-service.

use crate::services::providers::SignaturePolicy;
use crate::services::resolver::ResolverConfig;
use rust_decimal::Decimal;
use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    /// Unset runs on the in-memory store (single instance only).
    pub database: Option<DatabaseConfig>,
    /// Unset keeps webhook dedup keys in process memory.
    pub redis_url: Option<Secret<String>>,
    pub dedup_ttl_secs: u64,
    pub internal_api_key: Secret<String>,
    pub clicks_per_minute: u32,
    pub stripe: StripeConfig,
    pub paypal: PaypalConfig,
    pub mercadopago: MercadoPagoConfig,
    pub resolver: ResolverConfig,
    pub currency: CurrencyConfig,
    pub fraud_threshold: u32,
    pub payouts: PayoutSettings,
    pub notifications: NotificationSettings,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub webhook_secret: Option<Secret<String>>,
    pub signature_policy: SignaturePolicy,
    pub tolerance_secs: i64,
}

#[derive(Debug, Clone)]
pub struct PaypalConfig {
    pub webhook_secret: Option<Secret<String>>,
    pub webhook_id: String,
    pub signature_policy: SignaturePolicy,
    pub tolerance_secs: i64,
}

#[derive(Debug, Clone)]
pub struct MercadoPagoConfig {
    pub webhook_secret: Option<Secret<String>>,
    pub signature_policy: SignaturePolicy,
    pub tolerance_secs: i64,
    pub api_url: String,
    pub access_token: Option<Secret<String>>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct CurrencyConfig {
    pub rates_url: String,
    pub timeout_ms: u64,
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct PayoutSettings {
    /// Unset disables automatic transfers and sweeps.
    pub api_url: Option<String>,
    pub api_token: Option<Secret<String>>,
    pub timeout_ms: u64,
    pub sweep_interval_secs: u64,
    pub global_minimum: Decimal,
    pub max_transfer_attempts: i32,
}

#[derive(Debug, Clone)]
pub struct NotificationSettings {
    /// Unset logs notifications instead of delivering them.
    pub url: Option<String>,
    pub queue_capacity: usize,
    pub timeout_ms: u64,
    pub max_retry_secs: u64,
}

impl CheckoutConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let is_prod = common.is_production();

        let database = match optional("DATABASE_URL") {
            Some(url) => Some(DatabaseConfig {
                url: Secret::new(url),
                max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parse_or("DATABASE_MIN_CONNECTIONS", 2)?,
            }),
            None if is_prod => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "DATABASE_URL is required in production"
                )));
            }
            None => None,
        };

        let internal_api_key = match optional("INTERNAL_API_KEY") {
            Some(key) => key,
            None if is_prod => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "INTERNAL_API_KEY is required in production"
                )));
            }
            None => String::new(),
        };

        let resolver_defaults = ResolverConfig::default();

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "checkout-service".into()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: optional("OTLP_ENDPOINT"),
            database,
            redis_url: secret("REDIS_URL"),
            dedup_ttl_secs: parse_or("WEBHOOK_DEDUP_TTL_SECS", 60)?,
            internal_api_key: Secret::new(internal_api_key),
            clicks_per_minute: parse_or("CLICKS_PER_MINUTE", 60)?,
            stripe: StripeConfig {
                webhook_secret: secret("STRIPE_WEBHOOK_SECRET"),
                signature_policy: parse_or("STRIPE_SIGNATURE_POLICY", SignaturePolicy::Strict)?,
                tolerance_secs: parse_or("STRIPE_SIGNATURE_TOLERANCE_SECS", 300)?,
            },
            paypal: PaypalConfig {
                webhook_secret: secret("PAYPAL_WEBHOOK_SECRET"),
                webhook_id: env::var("PAYPAL_WEBHOOK_ID").unwrap_or_default(),
                signature_policy: parse_or("PAYPAL_SIGNATURE_POLICY", SignaturePolicy::Strict)?,
                tolerance_secs: parse_or("PAYPAL_SIGNATURE_TOLERANCE_SECS", 300)?,
            },
            mercadopago: MercadoPagoConfig {
                webhook_secret: secret("MERCADOPAGO_WEBHOOK_SECRET"),
                signature_policy: parse_or(
                    "MERCADOPAGO_SIGNATURE_POLICY",
                    SignaturePolicy::Strict,
                )?,
                tolerance_secs: parse_or("MERCADOPAGO_SIGNATURE_TOLERANCE_SECS", 300)?,
                api_url: env::var("MERCADOPAGO_API_URL")
                    .unwrap_or_else(|_| "https://api.mercadopago.com".to_string()),
                access_token: secret("MERCADOPAGO_ACCESS_TOKEN"),
                timeout_ms: parse_or("MERCADOPAGO_TIMEOUT_MS", 5000)?,
            },
            resolver: ResolverConfig {
                fallback_window_hours: parse_or(
                    "RESOLVER_FALLBACK_WINDOW_HOURS",
                    resolver_defaults.fallback_window_hours,
                )?,
                fallback_limit: parse_or(
                    "RESOLVER_FALLBACK_LIMIT",
                    resolver_defaults.fallback_limit,
                )?,
                fallback_scans_per_minute: parse_or(
                    "RESOLVER_FALLBACK_SCANS_PER_MINUTE",
                    resolver_defaults.fallback_scans_per_minute,
                )?,
            },
            currency: CurrencyConfig {
                rates_url: env::var("CURRENCY_RATES_URL")
                    .unwrap_or_else(|_| "https://open.er-api.com/v6".to_string()),
                timeout_ms: parse_or("CURRENCY_TIMEOUT_MS", 2500)?,
                cache_ttl_secs: parse_or("CURRENCY_CACHE_TTL_SECS", 600)?,
            },
            fraud_threshold: parse_or("FRAUD_THRESHOLD", 50)?,
            payouts: PayoutSettings {
                api_url: optional("PAYOUT_API_URL"),
                api_token: secret("PAYOUT_API_TOKEN"),
                timeout_ms: parse_or("PAYOUT_TIMEOUT_MS", 10_000)?,
                sweep_interval_secs: parse_or("PAYOUT_SWEEP_INTERVAL_SECS", 3600)?,
                global_minimum: parse_or("PAYOUT_GLOBAL_MINIMUM", Decimal::ZERO)?,
                max_transfer_attempts: parse_or("PAYOUT_MAX_TRANSFER_ATTEMPTS", 3)?,
            },
            notifications: NotificationSettings {
                url: optional("NOTIFICATION_URL"),
                queue_capacity: parse_or("SIDE_EFFECT_QUEUE_CAPACITY", 1024)?,
                timeout_ms: parse_or("NOTIFICATION_TIMEOUT_MS", 5000)?,
                max_retry_secs: parse_or("NOTIFICATION_MAX_RETRY_SECS", 300)?,
            },
        })
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn secret(key: &str) -> Option<Secret<String>> {
    optional(key).map(Secret::new)
}

fn parse_or<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| {
            AppError::ConfigError(anyhow::anyhow!("{} has an invalid value: {}", key, e))
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_or_falls_back_when_unset() {
        let value: u64 = parse_or("CHECKOUT_TEST_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn signature_policy_parses_from_env_strings() {
        assert_eq!(
            "tolerant".parse::<SignaturePolicy>().unwrap(),
            SignaturePolicy::Tolerant
        );
        assert!("lenient".parse::<SignaturePolicy>().is_err());
    }
}
