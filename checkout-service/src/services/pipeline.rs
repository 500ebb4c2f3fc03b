//! Webhook processing pipeline.
//!
//! ingest → dedup → resolve → integrity check → conditional transition →
//! coupon ledger → attribution → commission. The transition is the
//! authoritative write. Settlement after it is idempotent: a failure is
//! returned as an error so the provider redelivers, and a redelivery for an
//! order that is already completed settles again.

use super::idempotency::DedupStore;
use super::store::Store;
use crate::models::{amounts_match, Order, OrderStatus, PaymentEvent, ProviderId};
use crate::services::attribution::AffiliateAttribution;
use crate::services::commission::CommissionService;
use crate::services::coupons::CouponLedger;
use crate::services::metrics::{record_security_alert, record_webhook_outcome};
use crate::services::notifications::{SideEffect, SideEffectQueue};
use crate::services::pricing::validate_order_totals;
use crate::services::providers::{
    Ingested, PaymentTransition, ProviderAdapter, ProviderError, WebhookRequest,
};
use crate::services::resolver::{verify_amount, OrderResolver, ResolverConfig};
use chrono::Utc;
use serde::Serialize;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// What happened to one delivery. Every variant is acknowledged with 200.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Completed,
    Cancelled,
    Refunded,
    /// Provider still processing; order left as is.
    Pending,
    Duplicate,
    /// Authentic delivery about something other than a payment.
    Ignored,
    OrderNotFound,
    /// Order already in the requested state.
    AlreadyApplied,
    InvalidTransition,
    UnknownStatus,
    AmountMismatch,
    TotalsMismatch,
    /// Refund for less than the order total; order left as is.
    PartialRefund,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
            Self::Pending => "pending",
            Self::Duplicate => "duplicate",
            Self::Ignored => "ignored",
            Self::OrderNotFound => "order_not_found",
            Self::AlreadyApplied => "already_applied",
            Self::InvalidTransition => "invalid_transition",
            Self::UnknownStatus => "unknown_status",
            Self::AmountMismatch => "amount_mismatch",
            Self::TotalsMismatch => "totals_mismatch",
            Self::PartialRefund => "partial_refund",
        }
    }

    fn for_status(status: OrderStatus) -> Self {
        match status {
            OrderStatus::Completed => Self::Completed,
            OrderStatus::Cancelled => Self::Cancelled,
            OrderStatus::Refunded => Self::Refunded,
            OrderStatus::Pending => Self::Pending,
        }
    }
}

pub struct WebhookProcessor {
    adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
    dedup: Arc<dyn DedupStore>,
    store: Arc<dyn Store>,
    resolver: OrderResolver,
    coupons: CouponLedger,
    attribution: AffiliateAttribution,
    commissions: Arc<CommissionService>,
    queue: SideEffectQueue,
}

impl WebhookProcessor {
    pub fn new(
        adapters: Vec<Arc<dyn ProviderAdapter>>,
        dedup: Arc<dyn DedupStore>,
        store: Arc<dyn Store>,
        resolver_config: &ResolverConfig,
        commissions: Arc<CommissionService>,
        queue: SideEffectQueue,
    ) -> Self {
        Self {
            adapters: adapters.into_iter().map(|a| (a.provider(), a)).collect(),
            dedup,
            resolver: OrderResolver::new(store.clone(), resolver_config),
            coupons: CouponLedger::new(store.clone()),
            attribution: AffiliateAttribution::new(store.clone()),
            store,
            commissions,
            queue,
        }
    }

    /// Process one delivery. Errors map to 401 (strict signature), 400
    /// (malformed) or 500 (lookup/storage); the dedup claim is released on
    /// internal errors so the provider's retry is not treated as a duplicate.
    #[instrument(skip(self, request), fields(provider = %provider))]
    pub async fn handle(
        &self,
        provider: ProviderId,
        request: &WebhookRequest,
    ) -> Result<WebhookOutcome, AppError> {
        let adapter = self.adapters.get(&provider).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("provider {} is not enabled", provider))
        })?;

        let ingestion = adapter.ingest(request).await.map_err(|e| {
            let label = match &e {
                ProviderError::InvalidSignature(_) => "signature_rejected",
                ProviderError::Malformed(_) => "malformed",
                ProviderError::Lookup(_) => "lookup_failed",
            };
            record_webhook_outcome(provider.as_str(), label);
            AppError::from(e)
        })?;

        let event = match ingestion.outcome {
            Ingested::Event(event) => event,
            Ingested::NoOp(kind) => {
                info!(kind = %kind, "Webhook acknowledged without action");
                return Ok(self.finish(provider, WebhookOutcome::Ignored));
            }
        };

        info!(
            event_id = %event.external_event_id,
            payment_reference = %event.payment_reference,
            status = %event.provider_status,
            verification = ingestion.verification.as_str(),
            "Payment event received"
        );

        let key = event.dedup_key();
        if !self.dedup.should_process(&key).await? {
            info!(event_id = %event.external_event_id, "Duplicate delivery acknowledged");
            return Ok(self.finish(provider, WebhookOutcome::Duplicate));
        }

        match self.process_event(adapter.as_ref(), &event).await {
            Ok(outcome) => Ok(self.finish(provider, outcome)),
            Err(e) => {
                error!(event_id = %event.external_event_id, error = %e, "Webhook processing failed");
                if let Err(release_err) = self.dedup.release(&key).await {
                    error!(error = %release_err, "Failed to release dedup key");
                }
                record_webhook_outcome(provider.as_str(), "error");
                Err(e)
            }
        }
    }

    fn finish(&self, provider: ProviderId, outcome: WebhookOutcome) -> WebhookOutcome {
        record_webhook_outcome(provider.as_str(), outcome.as_str());
        outcome
    }

    async fn process_event(
        &self,
        adapter: &dyn ProviderAdapter,
        event: &PaymentEvent,
    ) -> Result<WebhookOutcome, AppError> {
        let Some(resolution) = self.resolver.resolve(event).await? else {
            return Ok(WebhookOutcome::OrderNotFound);
        };
        let order = resolution.order;

        let transition = adapter.map_status(&event.provider_status);
        let target = match (transition, transition.target()) {
            (_, Some(target)) => target,
            (PaymentTransition::Hold, None) => {
                info!(order_id = %order.id, status = %event.provider_status, "Payment still in progress");
                return Ok(WebhookOutcome::Pending);
            }
            _ => {
                warn!(
                    order_id = %order.id,
                    status = %event.provider_status,
                    "Unknown provider status acknowledged"
                );
                return Ok(WebhookOutcome::UnknownStatus);
            }
        };

        if order.status == target {
            if target == OrderStatus::Completed {
                self.settle_completion(&order, event).await?;
            }
            return Ok(WebhookOutcome::AlreadyApplied);
        }
        if !order.status.can_transition_to(target) {
            warn!(
                order_id = %order.id,
                from = order.status.as_str(),
                to = target.as_str(),
                "Rejected order transition"
            );
            return Ok(WebhookOutcome::InvalidTransition);
        }

        if target == OrderStatus::Refunded
            && event.amount_minor > 0
            && event.amount() < order.total
            && !amounts_match(event.amount(), order.total)
        {
            warn!(
                order_id = %order.id,
                refunded = %event.amount(),
                total = %order.total,
                "Partial refund acknowledged; order left completed"
            );
            return Ok(WebhookOutcome::PartialRefund);
        }

        if target == OrderStatus::Completed {
            if let Err(violation) = verify_amount(&order, event) {
                self.raise_security_alert("amount_mismatch", event, &order, &violation.to_string());
                return Ok(WebhookOutcome::AmountMismatch);
            }
            let items = self.store.order_items(order.id).await?;
            if let Err(e) = validate_order_totals(&order, &items) {
                self.raise_security_alert("order_totals", event, &order, &e.to_string());
                return Ok(WebhookOutcome::TotalsMismatch);
            }
        }

        let won = self
            .store
            .transition_order(order.id, order.status, target, Utc::now())
            .await?;
        if !won {
            info!(order_id = %order.id, "Order transition lost to a concurrent delivery");
            return Ok(WebhookOutcome::AlreadyApplied);
        }

        info!(
            order_id = %order.id,
            from = order.status.as_str(),
            to = target.as_str(),
            "Order transitioned"
        );

        if target == OrderStatus::Completed {
            self.settle_completion(&order, event).await?;
            self.queue.enqueue(SideEffect::OrderCompleted {
                order_id: order.id,
                email: order.email.clone(),
                total: order.total,
                currency: order.currency.clone(),
            });
        }

        Ok(WebhookOutcome::for_status(target))
    }

    fn raise_security_alert(&self, kind: &str, event: &PaymentEvent, order: &Order, reason: &str) {
        error!(
            target: "security",
            kind,
            provider = %event.provider,
            order_id = %order.id,
            event_id = %event.external_event_id,
            reason,
            "Payment integrity check failed; order left pending"
        );
        record_security_alert(kind);
        self.queue.enqueue(SideEffect::SecurityAlert {
            provider: event.provider.to_string(),
            order_id: order.id,
            reason: reason.to_string(),
        });
    }

    /// Coupon ledger, attribution and commission for a completed order.
    /// Each step is idempotent, so a redelivery may run this again.
    async fn settle_completion(&self, order: &Order, event: &PaymentEvent) -> Result<(), AppError> {
        if let Some(code) = order.coupon_code.as_deref().filter(|c| !c.trim().is_empty()) {
            let outcome = self.coupons.redeem(code, order).await?;
            info!(order_id = %order.id, outcome = outcome.as_str(), "Coupon ledger updated");
        }

        if let Some(attribution) = self.attribution.attribute(order).await? {
            let outcome = self.commissions.record(order, event, &attribution).await?;
            info!(order_id = %order.id, outcome = outcome.as_str(), "Commission processed");
        }
        Ok(())
    }
}
