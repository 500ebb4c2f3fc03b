//! In-memory store for tests and single-instance runs without Postgres.
//!
//! A single `RwLock` guards all tables, so each conditional write is atomic
//! with respect to concurrent webhook tasks.

use super::store::{
    AffiliateStore, ClickStats, CommissionStore, CouponStore, OrderStore, RedemptionWrite,
    SettledTransfer, TransferSettlement,
};
use crate::models::{
    Affiliate, AffiliateClick, AffiliateCommission, CommissionStatus, Coupon, CouponRedemption,
    FinancialTransaction, NewAffiliateClick, Order, OrderItem, OrderStatus, ProviderId,
    TransferStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    orders: HashMap<Uuid, Order>,
    order_items: HashMap<Uuid, Vec<OrderItem>>,
    coupons: HashMap<Uuid, Coupon>,
    redemptions: Vec<CouponRedemption>,
    affiliates: HashMap<Uuid, Affiliate>,
    clicks: HashMap<Uuid, AffiliateClick>,
    commissions: HashMap<Uuid, AffiliateCommission>,
    ledger: Vec<FinancialTransaction>,
}

#[derive(Default, Clone)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
    failures: Arc<Mutex<HashSet<&'static str>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a coupon (coupons are managed outside this service).
    pub async fn put_coupon(&self, coupon: Coupon) {
        self.tables.write().await.coupons.insert(coupon.id, coupon);
    }

    /// Seed an affiliate (affiliate onboarding is managed outside this service).
    pub async fn put_affiliate(&self, affiliate: Affiliate) {
        self.tables
            .write()
            .await
            .affiliates
            .insert(affiliate.id, affiliate);
    }

    /// Seed a click with an explicit timestamp.
    pub async fn put_click(&self, click: AffiliateClick) {
        self.tables.write().await.clicks.insert(click.id, click);
    }

    pub async fn get_coupon(&self, id: Uuid) -> Option<Coupon> {
        self.tables.read().await.coupons.get(&id).cloned()
    }

    /// Make the next `operation` write fail once with a database error.
    pub fn fail_next(&self, operation: &'static str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(operation);
        }
    }

    fn take_failure(&self, operation: &'static str) -> Result<(), AppError> {
        let injected = self
            .failures
            .lock()
            .map(|mut failures| failures.remove(operation))
            .unwrap_or(false);
        if injected {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "injected failure in {}",
                operation
            )));
        }
        Ok(())
    }

    pub async fn commissions_for_order_count(&self, order_id: Uuid) -> usize {
        self.tables
            .read()
            .await
            .commissions
            .values()
            .filter(|c| c.order_id == order_id)
            .count()
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn insert_order(&self, order: &Order, items: &[OrderItem]) -> Result<(), AppError> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        if tables.orders.contains_key(&order.id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "order {} already exists",
                order.id
            )));
        }
        tables.orders.insert(order.id, order.clone());
        tables.order_items.insert(order.id, items.to_vec());
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, AppError> {
        Ok(self.tables.read().await.orders.get(&id).cloned())
    }

    async fn order_items(&self, order_id: Uuid) -> Result<Vec<OrderItem>, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .order_items
            .get(&order_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn find_order_by_payment_reference(
        &self,
        provider: ProviderId,
        reference: &str,
    ) -> Result<Option<Order>, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .orders
            .values()
            .find(|o| o.payment_provider == provider && o.payment_reference == reference)
            .cloned())
    }

    async fn find_order_by_external_reference(
        &self,
        provider: ProviderId,
        reference: &str,
    ) -> Result<Option<Order>, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .orders
            .values()
            .find(|o| {
                o.payment_provider == provider
                    && (o.external_reference.as_deref() == Some(reference)
                        || o.id.to_string() == reference)
            })
            .cloned())
    }

    async fn find_order_by_provisional_reference(
        &self,
        provider: ProviderId,
        reference: &str,
    ) -> Result<Option<Order>, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .orders
            .values()
            .find(|o| o.payment_provider == provider && o.provisional_reference == reference)
            .cloned())
    }

    async fn list_unresolved_orders(
        &self,
        provider: ProviderId,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>, AppError> {
        let tables = self.tables.read().await;
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| {
                o.payment_provider == provider
                    && o.status == OrderStatus::Pending
                    && o.has_provisional_reference()
                    && o.created_at >= since
            })
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        orders.truncate(limit.max(0) as usize);
        Ok(orders)
    }

    async fn upgrade_payment_reference(
        &self,
        order_id: Uuid,
        provisional: &str,
        final_reference: &str,
    ) -> Result<bool, AppError> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        match tables.orders.get_mut(&order_id) {
            Some(order) if order.payment_reference == provisional => {
                order.payment_reference = final_reference.to_string();
                order.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transition_order(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        match tables.orders.get_mut(&order_id) {
            Some(order) if order.status == from => {
                order.status = to;
                order.payment_status = to.payment_status();
                if to == OrderStatus::Completed {
                    order.paid_at = Some(at);
                }
                order.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn attach_affiliate(
        &self,
        order_id: Uuid,
        affiliate_id: Uuid,
        link_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        if let Some(order) = tables.orders.get_mut(&order_id) {
            order.affiliate_id = Some(affiliate_id);
            order.affiliate_link_id = link_id.or(order.affiliate_link_id);
        }
        Ok(())
    }
}

#[async_trait]
impl CouponStore for InMemoryStore {
    async fn find_coupon_by_code(&self, code: &str) -> Result<Option<Coupon>, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .coupons
            .values()
            .find(|c| c.code.eq_ignore_ascii_case(code))
            .cloned())
    }

    async fn count_user_redemptions(
        &self,
        coupon_id: Uuid,
        user_id: Option<Uuid>,
        email: &str,
    ) -> Result<i64, AppError> {
        let tables = self.tables.read().await;
        let count = tables
            .redemptions
            .iter()
            .filter(|r| r.coupon_id == coupon_id)
            .filter(|r| match user_id {
                Some(user_id) => r.user_id == Some(user_id),
                None => r.email.eq_ignore_ascii_case(email),
            })
            .count();
        Ok(count as i64)
    }

    async fn record_redemption(
        &self,
        redemption: &CouponRedemption,
    ) -> Result<RedemptionWrite, AppError> {
        self.take_failure("record_redemption")?;
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        if tables
            .redemptions
            .iter()
            .any(|r| r.coupon_id == redemption.coupon_id && r.order_id == redemption.order_id)
        {
            return Ok(RedemptionWrite::AlreadyRecorded);
        }
        let Some(coupon) = tables.coupons.get_mut(&redemption.coupon_id) else {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "coupon {} not found",
                redemption.coupon_id
            )));
        };
        if let Some(limit) = coupon.usage_limit
            && coupon.used_count >= limit
        {
            return Ok(RedemptionWrite::LimitReached);
        }
        coupon.used_count += 1;
        tables.redemptions.push(redemption.clone());
        Ok(RedemptionWrite::Recorded)
    }

    async fn redemptions_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<CouponRedemption>, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .redemptions
            .iter()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AffiliateStore for InMemoryStore {
    async fn get_affiliate(&self, id: Uuid) -> Result<Option<Affiliate>, AppError> {
        Ok(self.tables.read().await.affiliates.get(&id).cloned())
    }

    async fn find_affiliate_by_code(&self, code: &str) -> Result<Option<Affiliate>, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .affiliates
            .values()
            .find(|a| a.code.eq_ignore_ascii_case(code) || a.slug.eq_ignore_ascii_case(code))
            .cloned())
    }

    async fn insert_click(&self, click: &NewAffiliateClick) -> Result<AffiliateClick, AppError> {
        let stored = AffiliateClick {
            id: Uuid::new_v4(),
            affiliate_id: click.affiliate_id,
            link_id: click.link_id,
            ip: click.ip.clone(),
            created_at: Utc::now(),
            converted: false,
            converted_at: None,
            order_id: None,
        };
        self.tables
            .write()
            .await
            .clicks
            .insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_click(&self, id: Uuid) -> Result<Option<AffiliateClick>, AppError> {
        Ok(self.tables.read().await.clicks.get(&id).cloned())
    }

    async fn mark_click_converted(
        &self,
        click_id: Uuid,
        order_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        match tables.clicks.get_mut(&click_id) {
            Some(click) if !click.converted => {
                click.converted = true;
                click.converted_at = Some(at);
                click.order_id = Some(order_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_converted_clicks_from_ip(
        &self,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .clicks
            .values()
            .filter(|c| c.ip == ip && c.converted)
            .filter(|c| c.converted_at.is_some_and(|at| at >= since))
            .count() as i64)
    }

    async fn click_stats(
        &self,
        affiliate_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<ClickStats, AppError> {
        let tables = self.tables.read().await;
        let window: Vec<&AffiliateClick> = tables
            .clicks
            .values()
            .filter(|c| c.affiliate_id == affiliate_id && c.created_at >= since)
            .collect();
        Ok(ClickStats {
            total: window.len() as i64,
            converted: window.iter().filter(|c| c.converted).count() as i64,
        })
    }
}

#[async_trait]
impl CommissionStore for InMemoryStore {
    async fn insert_commission(&self, commission: &AffiliateCommission) -> Result<bool, AppError> {
        self.take_failure("insert_commission")?;
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        if tables
            .commissions
            .values()
            .any(|c| c.order_id == commission.order_id)
        {
            return Ok(false);
        }
        tables
            .commissions
            .insert(commission.id, commission.clone());
        if let Some(affiliate) = tables.affiliates.get_mut(&commission.affiliate_id) {
            affiliate.total_revenue += commission.order_total;
            if commission.status == CommissionStatus::Paid {
                affiliate.commission_paid += commission.commission_amount;
            } else {
                affiliate.commission_owed += commission.commission_amount;
            }
        }
        Ok(true)
    }

    async fn get_commission(&self, id: Uuid) -> Result<Option<AffiliateCommission>, AppError> {
        Ok(self.tables.read().await.commissions.get(&id).cloned())
    }

    async fn commission_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Option<AffiliateCommission>, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .commissions
            .values()
            .find(|c| c.order_id == order_id)
            .cloned())
    }

    async fn list_commissions(
        &self,
        status: CommissionStatus,
        limit: i64,
    ) -> Result<Vec<AffiliateCommission>, AppError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<AffiliateCommission> = tables
            .commissions
            .values()
            .filter(|c| c.status == status)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn list_retryable_transfers(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<AffiliateCommission>, AppError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<AffiliateCommission> = tables
            .commissions
            .values()
            .filter(|c| {
                c.status == CommissionStatus::Pending
                    && c.transfer_status == TransferStatus::Failed
                    && c.fraud_notes.is_none()
                    && c.transfer_attempts < max_attempts
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn settle_transfer(
        &self,
        settlement: &TransferSettlement<'_>,
    ) -> Result<SettledTransfer, AppError> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        let mut settled = SettledTransfer::default();
        for commission in settlement.commissions {
            if let Some(c) = tables.commissions.get_mut(&commission.id)
                && settlement.expected.contains(&c.status)
            {
                c.status = CommissionStatus::Paid;
                c.transfer_id = Some(settlement.transfer_id.to_string());
                c.transfer_status = TransferStatus::Succeeded;
                c.transfer_attempts += 1;
                c.transfer_error = None;
                c.paid_at = Some(settlement.at);
                c.updated_at = settlement.at;
                settled.commission_ids.push(c.id);
                settled.amount += c.commission_amount;
            }
        }
        if settled.is_empty() {
            return Ok(settled);
        }
        tables.ledger.push(settlement.ledger_entry(settled.amount));
        if let Some(affiliate) = tables.affiliates.get_mut(&settlement.affiliate_id) {
            affiliate.commission_owed -= settled.amount;
            affiliate.commission_paid += settled.amount;
        }
        Ok(settled)
    }

    async fn record_transfer_failure(&self, id: Uuid, error: &str) -> Result<(), AppError> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        if let Some(c) = tables.commissions.get_mut(&id)
            && c.status != CommissionStatus::Paid
        {
            c.transfer_status = TransferStatus::Failed;
            c.transfer_attempts += 1;
            c.transfer_error = Some(error.to_string());
            c.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn approve_commission(&self, id: Uuid) -> Result<bool, AppError> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        match tables.commissions.get_mut(&id) {
            Some(c) if c.status == CommissionStatus::Pending => {
                c.status = CommissionStatus::Approved;
                c.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn financial_transactions(
        &self,
        scope: &str,
    ) -> Result<Vec<FinancialTransaction>, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .ledger
            .iter()
            .filter(|t| t.scope == scope)
            .cloned()
            .collect())
    }
}
