//! Commission creation for completed, attributed orders.

use super::store::Store;
use crate::models::{
    round_money, AffiliateCommission, CommissionStatus, Order, PaymentEvent, TransferStatus,
};
use crate::services::attribution::Attribution;
use crate::services::fraud::{self, FraudAssessment};
use crate::services::metrics::record_commission;
use crate::services::notifications::{SideEffect, SideEffectQueue};
use crate::services::payout::{PayoutOrchestrator, TransferAttempt};
use chrono::Utc;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommissionOutcome {
    /// Commercial-license affiliate, or a zero commission.
    NotEligible(&'static str),
    /// The order already has a commission.
    AlreadyRecorded,
    PreSplit { commission_id: Uuid },
    HeldForReview { commission_id: Uuid, score: u32 },
    Transferred { commission_id: Uuid, transfer_id: String },
    TransferFailed { commission_id: Uuid, error: String },
    Approved { commission_id: Uuid },
}

impl CommissionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotEligible(_) => "not_eligible",
            Self::AlreadyRecorded => "already_recorded",
            Self::PreSplit { .. } => "pre_split",
            Self::HeldForReview { .. } => "held_for_review",
            Self::Transferred { .. } => "transferred",
            Self::TransferFailed { .. } => "transfer_failed",
            Self::Approved { .. } => "approved",
        }
    }
}

/// `round(total × rate / 100, 2)`.
pub fn commission_amount(order_total: Decimal, rate_percent: Decimal) -> Decimal {
    round_money(order_total * rate_percent / Decimal::ONE_HUNDRED)
}

pub struct CommissionService {
    store: Arc<dyn Store>,
    payouts: Arc<PayoutOrchestrator>,
    queue: SideEffectQueue,
    fraud_threshold: u32,
}

impl CommissionService {
    pub fn new(
        store: Arc<dyn Store>,
        payouts: Arc<PayoutOrchestrator>,
        queue: SideEffectQueue,
        fraud_threshold: u32,
    ) -> Self {
        Self {
            store,
            payouts,
            queue,
            fraud_threshold,
        }
    }

    /// Create the commission for `order` and pay it when possible.
    ///
    /// Transfer failures are recorded on the commission, never returned.
    #[instrument(skip_all, fields(order_id = %order.id, affiliate_id = %attribution.affiliate.id))]
    pub async fn record(
        &self,
        order: &Order,
        event: &PaymentEvent,
        attribution: &Attribution,
    ) -> Result<CommissionOutcome, AppError> {
        let affiliate = &attribution.affiliate;

        if !affiliate.affiliate_type.earns_commission() {
            info!("Commercial-license affiliate; no commission");
            return Ok(CommissionOutcome::NotEligible("commercial_license"));
        }

        let amount = commission_amount(order.total, affiliate.commission_value);
        if amount <= Decimal::ZERO {
            return Ok(CommissionOutcome::NotEligible("zero_amount"));
        }

        let signals =
            fraud::collect_signals(self.store.as_ref(), order, affiliate, attribution.click.as_ref())
                .await?;
        let assessment = fraud::score(&signals);
        let suspicious = assessment.is_suspicious(self.fraud_threshold);

        let pre_split = event.split_transfer_id.clone().filter(|id| !id.is_empty());
        let auto_transfer = !suspicious
            && pre_split.is_none()
            && self.payouts.auto_transfer_eligible(affiliate, amount);

        let now = Utc::now();
        let (status, transfer_status) = match (&pre_split, suspicious, auto_transfer) {
            (Some(_), _, _) => (CommissionStatus::Paid, TransferStatus::PreSplit),
            (None, true, _) | (None, false, true) => {
                (CommissionStatus::Pending, TransferStatus::NotAttempted)
            }
            (None, false, false) => (CommissionStatus::Approved, TransferStatus::NotAttempted),
        };

        let commission = AffiliateCommission {
            id: Uuid::new_v4(),
            order_id: order.id,
            affiliate_id: affiliate.id,
            order_total: order.total,
            commission_rate: affiliate.commission_value,
            commission_amount: amount,
            currency: order.currency.clone(),
            status,
            fraud_score: assessment.score as i32,
            fraud_notes: if suspicious { assessment.notes() } else { None },
            transfer_id: pre_split.clone(),
            transfer_status,
            transfer_attempts: 0,
            transfer_error: None,
            created_at: now,
            updated_at: now,
            paid_at: pre_split.as_ref().map(|_| now),
        };

        // Books the affiliate's revenue and owed/paid totals with the row.
        if !self.store.insert_commission(&commission).await? {
            info!("Commission already recorded for order");
            return Ok(CommissionOutcome::AlreadyRecorded);
        }
        record_commission(status.as_str());

        if let Some(transfer_id) = pre_split {
            info!(transfer_id = %transfer_id, amount = %amount, "Commission settled by provider split");
            return Ok(CommissionOutcome::PreSplit {
                commission_id: commission.id,
            });
        }

        if suspicious {
            return Ok(self.hold_for_review(&commission, &assessment));
        }

        if !auto_transfer {
            return Ok(CommissionOutcome::Approved {
                commission_id: commission.id,
            });
        }

        Ok(
            match self
                .payouts
                .transfer_commission(&commission, affiliate, "automatic")
                .await?
            {
                TransferAttempt::Paid { transfer_id } => CommissionOutcome::Transferred {
                    commission_id: commission.id,
                    transfer_id,
                },
                TransferAttempt::Failed { error } => CommissionOutcome::TransferFailed {
                    commission_id: commission.id,
                    error,
                },
                TransferAttempt::Superseded => CommissionOutcome::AlreadyRecorded,
            },
        )
    }

    fn hold_for_review(
        &self,
        commission: &AffiliateCommission,
        assessment: &FraudAssessment,
    ) -> CommissionOutcome {
        let notes = assessment.notes().unwrap_or_default();
        warn!(
            commission_id = %commission.id,
            score = assessment.score,
            notes = %notes,
            "Commission held for manual review"
        );
        self.queue.enqueue(SideEffect::CommissionReview {
            commission_id: commission.id,
            affiliate_id: commission.affiliate_id,
            score: assessment.score,
            notes,
        });
        CommissionOutcome::HeldForReview {
            commission_id: commission.id,
            score: assessment.score,
        }
    }
}
