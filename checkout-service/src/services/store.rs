//! Storage ports.
//!
//! Every mutation that guards an idempotency boundary is expressed as a
//! conditional write returning whether it took effect, so concurrent
//! deliveries of the same event cannot both win.

use crate::models::{
    Affiliate, AffiliateClick, AffiliateCommission, CommissionStatus, Coupon, CouponRedemption,
    FinancialTransaction, NewAffiliateClick, Order, OrderItem, OrderStatus, ProviderId,
};
use crate::services::payout::PAYOUT_KIND;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use uuid::Uuid;

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn insert_order(&self, order: &Order, items: &[OrderItem]) -> Result<(), AppError>;

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, AppError>;

    async fn order_items(&self, order_id: Uuid) -> Result<Vec<OrderItem>, AppError>;

    async fn find_order_by_payment_reference(
        &self,
        provider: ProviderId,
        reference: &str,
    ) -> Result<Option<Order>, AppError>;

    /// Matches the client-supplied reference or the order id itself.
    async fn find_order_by_external_reference(
        &self,
        provider: ProviderId,
        reference: &str,
    ) -> Result<Option<Order>, AppError>;

    async fn find_order_by_provisional_reference(
        &self,
        provider: ProviderId,
        reference: &str,
    ) -> Result<Option<Order>, AppError>;

    /// Pending orders still carrying their provisional reference, newest first.
    async fn list_unresolved_orders(
        &self,
        provider: ProviderId,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>, AppError>;

    /// Replace `provisional` with `final_reference`; no-op once upgraded.
    async fn upgrade_payment_reference(
        &self,
        order_id: Uuid,
        provisional: &str,
        final_reference: &str,
    ) -> Result<bool, AppError>;

    /// Move `from → to` only if the order is still in `from`.
    async fn transition_order(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    async fn attach_affiliate(
        &self,
        order_id: Uuid,
        affiliate_id: Uuid,
        link_id: Option<Uuid>,
    ) -> Result<(), AppError>;
}

/// Result of writing a coupon redemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedemptionWrite {
    Recorded,
    AlreadyRecorded,
    LimitReached,
}

#[async_trait]
pub trait CouponStore: Send + Sync {
    async fn find_coupon_by_code(&self, code: &str) -> Result<Option<Coupon>, AppError>;

    /// Redemptions by this user (or, for guests, this email).
    async fn count_user_redemptions(
        &self,
        coupon_id: Uuid,
        user_id: Option<Uuid>,
        email: &str,
    ) -> Result<i64, AppError>;

    /// Insert the redemption and increment `used_count` atomically.
    async fn record_redemption(
        &self,
        redemption: &CouponRedemption,
    ) -> Result<RedemptionWrite, AppError>;

    async fn redemptions_for_order(&self, order_id: Uuid)
        -> Result<Vec<CouponRedemption>, AppError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClickStats {
    pub total: i64,
    pub converted: i64,
}

#[async_trait]
pub trait AffiliateStore: Send + Sync {
    async fn get_affiliate(&self, id: Uuid) -> Result<Option<Affiliate>, AppError>;

    /// Case-insensitive match on code or slug.
    async fn find_affiliate_by_code(&self, code: &str) -> Result<Option<Affiliate>, AppError>;

    async fn insert_click(&self, click: &NewAffiliateClick) -> Result<AffiliateClick, AppError>;

    async fn get_click(&self, id: Uuid) -> Result<Option<AffiliateClick>, AppError>;

    /// Flip `converted` once; later calls return `false`.
    async fn mark_click_converted(
        &self,
        click_id: Uuid,
        order_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    async fn count_converted_clicks_from_ip(
        &self,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, AppError>;

    async fn click_stats(
        &self,
        affiliate_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<ClickStats, AppError>;
}

#[async_trait]
pub trait CommissionStore: Send + Sync {
    /// Insert unless the order already has a commission. The affiliate's
    /// running totals move in the same write: revenue by the order total, and
    /// owed or paid (for a commission born paid) by the commission amount.
    async fn insert_commission(&self, commission: &AffiliateCommission) -> Result<bool, AppError>;

    async fn get_commission(&self, id: Uuid) -> Result<Option<AffiliateCommission>, AppError>;

    async fn commission_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Option<AffiliateCommission>, AppError>;

    async fn list_commissions(
        &self,
        status: CommissionStatus,
        limit: i64,
    ) -> Result<Vec<AffiliateCommission>, AppError>;

    /// Pending, unflagged commissions whose automatic transfer failed.
    async fn list_retryable_transfers(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<AffiliateCommission>, AppError>;

    /// Mark paid every commission still in one of `expected`, then book the
    /// paid sum to the ledger and the affiliate's totals, all in one write.
    async fn settle_transfer(
        &self,
        settlement: &TransferSettlement<'_>,
    ) -> Result<SettledTransfer, AppError>;

    async fn record_transfer_failure(&self, id: Uuid, error: &str) -> Result<(), AppError>;

    /// `pending → approved`; clears the review hold.
    async fn approve_commission(&self, id: Uuid) -> Result<bool, AppError>;

    async fn financial_transactions(
        &self,
        scope: &str,
    ) -> Result<Vec<FinancialTransaction>, AppError>;
}

/// A successful transfer covering one or more commissions of one affiliate.
#[derive(Debug, Clone)]
pub struct TransferSettlement<'a> {
    pub affiliate_id: Uuid,
    pub commissions: &'a [AffiliateCommission],
    pub expected: &'a [CommissionStatus],
    pub transfer_id: &'a str,
    pub currency: &'a str,
    pub at: DateTime<Utc>,
}

impl TransferSettlement<'_> {
    pub fn ledger_entry(&self, amount: Decimal) -> FinancialTransaction {
        FinancialTransaction {
            id: Uuid::new_v4(),
            kind: PAYOUT_KIND.to_string(),
            scope: format!("affiliate:{}", self.affiliate_id),
            reference: Some(self.transfer_id.to_string()),
            amount,
            currency: self.currency.to_string(),
            paid: true,
            created_at: self.at,
        }
    }
}

/// What a settlement actually moved to paid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettledTransfer {
    pub commission_ids: Vec<Uuid>,
    pub amount: Decimal,
}

impl SettledTransfer {
    pub fn is_empty(&self) -> bool {
        self.commission_ids.is_empty()
    }
}

/// Everything the pipeline persists.
pub trait Store: OrderStore + CouponStore + AffiliateStore + CommissionStore {}

impl<T> Store for T where T: OrderStore + CouponStore + AffiliateStore + CommissionStore {}
