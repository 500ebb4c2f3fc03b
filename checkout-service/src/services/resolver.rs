//! Order resolution.
//!
//! Strategies run in a fixed order and the first match wins. Every match is
//! logged with the strategy name; matches through a secondary strategy
//! upgrade the order's provisional reference to the provider's final id.

use crate::models::{amounts_match, Order, PaymentEvent};
use crate::services::metrics;
use crate::services::store::Store;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use service_core::error::AppError;
use service_core::middleware::rate_limit::{
    create_unkeyed_rate_limiter, try_acquire, UnkeyedRateLimiter,
};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    PaymentReference,
    ExternalReference,
    ProvisionalReference,
    FallbackScan,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentReference => "payment_reference",
            Self::ExternalReference => "external_reference",
            Self::ProvisionalReference => "provisional_reference",
            Self::FallbackScan => "fallback_scan",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub order: Order,
    pub strategy: ResolutionStrategy,
}

#[async_trait]
pub trait LookupStrategy: Send + Sync {
    fn strategy(&self) -> ResolutionStrategy;

    async fn find(&self, store: &dyn Store, event: &PaymentEvent)
        -> Result<Option<Order>, AppError>;
}

struct ByPaymentReference;

#[async_trait]
impl LookupStrategy for ByPaymentReference {
    fn strategy(&self) -> ResolutionStrategy {
        ResolutionStrategy::PaymentReference
    }

    async fn find(
        &self,
        store: &dyn Store,
        event: &PaymentEvent,
    ) -> Result<Option<Order>, AppError> {
        store
            .find_order_by_payment_reference(event.provider, &event.payment_reference)
            .await
    }
}

struct ByExternalReference;

#[async_trait]
impl LookupStrategy for ByExternalReference {
    fn strategy(&self) -> ResolutionStrategy {
        ResolutionStrategy::ExternalReference
    }

    async fn find(
        &self,
        store: &dyn Store,
        event: &PaymentEvent,
    ) -> Result<Option<Order>, AppError> {
        match event.external_reference.as_deref() {
            Some(reference) => {
                store
                    .find_order_by_external_reference(event.provider, reference)
                    .await
            }
            None => Ok(None),
        }
    }
}

struct ByProvisionalReference;

#[async_trait]
impl LookupStrategy for ByProvisionalReference {
    fn strategy(&self) -> ResolutionStrategy {
        ResolutionStrategy::ProvisionalReference
    }

    async fn find(
        &self,
        store: &dyn Store,
        event: &PaymentEvent,
    ) -> Result<Option<Order>, AppError> {
        match event.provisional_reference.as_deref() {
            Some(reference) => {
                store
                    .find_order_by_provisional_reference(event.provider, reference)
                    .await
            }
            None => Ok(None),
        }
    }
}

/// Last resort: a bounded scan of recent unresolved orders matched on amount
/// and currency. Exactly one candidate must match.
struct FallbackScan {
    window: Duration,
    limit: i64,
    limiter: UnkeyedRateLimiter,
}

#[async_trait]
impl LookupStrategy for FallbackScan {
    fn strategy(&self) -> ResolutionStrategy {
        ResolutionStrategy::FallbackScan
    }

    async fn find(
        &self,
        store: &dyn Store,
        event: &PaymentEvent,
    ) -> Result<Option<Order>, AppError> {
        if event.amount_minor <= 0 {
            return Ok(None);
        }
        if !try_acquire(&self.limiter) {
            warn!(
                target: "reconciliation",
                provider = %event.provider,
                payment_reference = %event.payment_reference,
                "Fallback scan rate limit reached, skipping"
            );
            return Ok(None);
        }

        let since = Utc::now() - self.window;
        let candidates = store
            .list_unresolved_orders(event.provider, since, self.limit)
            .await?;
        let amount = event.amount();
        let mut matching: Vec<Order> = candidates
            .into_iter()
            .filter(|o| {
                amounts_match(o.total, amount) && o.currency.eq_ignore_ascii_case(&event.currency)
            })
            .collect();

        if matching.len() != 1 {
            warn!(
                target: "reconciliation",
                provider = %event.provider,
                payment_reference = %event.payment_reference,
                candidates = matching.len(),
                "Fallback scan found no unique candidate"
            );
            return Ok(None);
        }

        warn!(
            target: "reconciliation",
            provider = %event.provider,
            payment_reference = %event.payment_reference,
            order_id = %matching[0].id,
            "Order matched by fallback scan"
        );
        Ok(matching.pop())
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub fallback_window_hours: i64,
    pub fallback_limit: i64,
    pub fallback_scans_per_minute: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            fallback_window_hours: 48,
            fallback_limit: 50,
            fallback_scans_per_minute: 30,
        }
    }
}

pub struct OrderResolver {
    store: Arc<dyn Store>,
    strategies: Vec<Box<dyn LookupStrategy>>,
}

impl OrderResolver {
    pub fn new(store: Arc<dyn Store>, config: &ResolverConfig) -> Self {
        let strategies: Vec<Box<dyn LookupStrategy>> = vec![
            Box::new(ByPaymentReference),
            Box::new(ByExternalReference),
            Box::new(ByProvisionalReference),
            Box::new(FallbackScan {
                window: Duration::hours(config.fallback_window_hours),
                limit: config.fallback_limit,
                limiter: create_unkeyed_rate_limiter(config.fallback_scans_per_minute, 60),
            }),
        ];
        Self { store, strategies }
    }

    pub async fn resolve(&self, event: &PaymentEvent) -> Result<Option<Resolution>, AppError> {
        for strategy in &self.strategies {
            let Some(order) = strategy.find(self.store.as_ref(), event).await? else {
                continue;
            };

            let name = strategy.strategy();
            info!(
                provider = %event.provider,
                order_id = %order.id,
                strategy = name.as_str(),
                "Order resolved"
            );
            metrics::record_resolver_match(event.provider.as_str(), name.as_str());

            let order = if name == ResolutionStrategy::PaymentReference {
                order
            } else {
                self.upgrade_reference(order, event).await?
            };
            return Ok(Some(Resolution {
                order,
                strategy: name,
            }));
        }

        warn!(
            target: "reconciliation",
            provider = %event.provider,
            payment_reference = %event.payment_reference,
            external_reference = ?event.external_reference,
            "No order matched payment event"
        );
        Ok(None)
    }

    /// Replace the provisional reference with the provider's final id, once.
    async fn upgrade_reference(
        &self,
        mut order: Order,
        event: &PaymentEvent,
    ) -> Result<Order, AppError> {
        if !order.has_provisional_reference() || order.payment_reference == event.payment_reference
        {
            return Ok(order);
        }

        let upgraded = self
            .store
            .upgrade_payment_reference(order.id, &order.provisional_reference, &event.payment_reference)
            .await?;
        if upgraded {
            info!(
                order_id = %order.id,
                from = %order.provisional_reference,
                to = %event.payment_reference,
                "Upgraded provisional payment reference"
            );
            order.payment_reference = event.payment_reference.clone();
            Ok(order)
        } else {
            Ok(self.store.get_order(order.id).await?.unwrap_or(order))
        }
    }
}

/// Why a completion was refused by the amount-integrity check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityViolation {
    #[error("amount mismatch: provider reported {reported} but order total is {expected}")]
    Amount { reported: String, expected: String },

    #[error("currency mismatch: provider reported {reported} but order is in {expected}")]
    Currency { reported: String, expected: String },
}

/// `|event.amount − order.total| ≤ 0.01` and identical currency.
pub fn verify_amount(order: &Order, event: &PaymentEvent) -> Result<(), IntegrityViolation> {
    if !order.currency.eq_ignore_ascii_case(&event.currency) {
        return Err(IntegrityViolation::Currency {
            reported: event.currency.clone(),
            expected: order.currency.clone(),
        });
    }
    if !amounts_match(order.total, event.amount()) {
        return Err(IntegrityViolation::Amount {
            reported: event.amount().to_string(),
            expected: order.total.to_string(),
        });
    }
    Ok(())
}
