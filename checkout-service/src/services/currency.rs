//! Exchange rates for pricing orders outside the base currency.

use crate::services::pricing::{Conversion, PricingError, BASE_CURRENCY};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Rates used when the provider is unreachable and nothing is cached.
pub fn fallback_rates() -> HashMap<String, Decimal> {
    [
        ("USD", Decimal::new(18, 2)),
        ("EUR", Decimal::new(17, 2)),
        ("GBP", Decimal::new(14, 2)),
        ("ARS", Decimal::new(17250, 2)),
    ]
    .into_iter()
    .map(|(code, rate)| (code.to_string(), rate))
    .collect()
}

#[async_trait]
pub trait RateSource: Send + Sync {
    /// Units of each currency per one unit of `base`.
    async fn latest(&self, base: &str) -> Result<HashMap<String, Decimal>, anyhow::Error>;
}

#[derive(Deserialize)]
struct RatesResponse {
    rates: HashMap<String, serde_json::Value>,
}

/// `GET {base_url}/latest/{base}` returning `{"rates": {...}}`.
#[derive(Clone)]
pub struct HttpRateSource {
    client: Client,
    base_url: String,
}

impl HttpRateSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, anyhow::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RateSource for HttpRateSource {
    async fn latest(&self, base: &str) -> Result<HashMap<String, Decimal>, anyhow::Error> {
        let url = format!("{}/latest/{}", self.base_url, base);
        let response = self.client.get(&url).send().await?.error_for_status()?;
        let body: RatesResponse = response.json().await?;

        let rates = body
            .rates
            .into_iter()
            .filter_map(|(code, value)| {
                let text = match &value {
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::String(s) => s.clone(),
                    _ => return None,
                };
                Decimal::from_str(&text)
                    .ok()
                    .or_else(|| Decimal::from_scientific(&text).ok())
                    .map(|rate| (code.to_ascii_uppercase(), rate))
            })
            .collect();
        Ok(rates)
    }
}

struct CachedRates {
    fetched_at: Instant,
    rates: HashMap<String, Decimal>,
}

/// Cached conversion from the base currency with a static fallback.
pub struct CurrencyConverter {
    source: Arc<dyn RateSource>,
    ttl: Duration,
    fallback: HashMap<String, Decimal>,
    cache: RwLock<Option<CachedRates>>,
}

impl CurrencyConverter {
    pub fn new(source: Arc<dyn RateSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            fallback: fallback_rates(),
            cache: RwLock::new(None),
        }
    }

    pub async fn conversion(&self, currency: &str) -> Result<Conversion, PricingError> {
        let currency = currency.trim().to_ascii_uppercase();
        if currency == BASE_CURRENCY {
            return Ok(Conversion::identity());
        }

        let rate = self
            .rate_for(&currency)
            .await
            .filter(|rate| *rate > Decimal::ZERO)
            .ok_or_else(|| PricingError::UnsupportedCurrency(currency.clone()))?;
        Ok(Conversion { currency, rate })
    }

    async fn rate_for(&self, currency: &str) -> Option<Decimal> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref()
                && cached.fetched_at.elapsed() < self.ttl
            {
                return cached.rates.get(currency).copied();
            }
        }

        match self.source.latest(BASE_CURRENCY).await {
            Ok(rates) if !rates.is_empty() => {
                debug!(count = rates.len(), "Refreshed exchange rates");
                let rate = rates.get(currency).copied();
                *self.cache.write().await = Some(CachedRates {
                    fetched_at: Instant::now(),
                    rates,
                });
                rate.or_else(|| self.fallback.get(currency).copied())
            }
            Ok(_) | Err(_) => {
                warn!(currency = %currency, "Exchange rate fetch failed, using fallback rate");
                let stale = self
                    .cache
                    .read()
                    .await
                    .as_ref()
                    .and_then(|cached| cached.rates.get(currency).copied());
                stale.or_else(|| self.fallback.get(currency).copied())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl RateSource for CountingSource {
        async fn latest(&self, _base: &str) -> Result<HashMap<String, Decimal>, anyhow::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("unreachable");
            }
            Ok(HashMap::from([("USD".to_string(), dec!(0.2))]))
        }
    }

    #[tokio::test]
    async fn base_currency_needs_no_lookup() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let converter = CurrencyConverter::new(source.clone(), Duration::from_secs(600));
        assert_eq!(converter.conversion("brl").await.unwrap(), Conversion::identity());
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rates_are_cached_within_ttl() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let converter = CurrencyConverter::new(source.clone(), Duration::from_secs(600));
        assert_eq!(converter.conversion("USD").await.unwrap().rate, dec!(0.2));
        assert_eq!(converter.conversion("usd").await.unwrap().rate, dec!(0.2));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_falls_back_to_static_rates() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let converter = CurrencyConverter::new(source, Duration::from_secs(600));
        assert_eq!(converter.conversion("EUR").await.unwrap().rate, dec!(0.17));
        assert!(matches!(
            converter.conversion("XYZ").await,
            Err(PricingError::UnsupportedCurrency(_))
        ));
    }
}
