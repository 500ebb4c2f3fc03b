//! Coupon ledger.
//!
//! Eligibility is checked twice: at checkout to price the discount, and again
//! when the winning webhook redeems the coupon, since caps may have been
//! consumed in between. The subtotal minimum is only checked at checkout.

use super::store::{RedemptionWrite, Store};
use crate::models::{Coupon, CouponRedemption, Order};
use crate::services::pricing::CouponDiscount;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CouponRejection {
    #[error("coupon {0} does not exist")]
    Unknown(String),
    #[error("coupon is not active")]
    Inactive,
    #[error("coupon is not valid yet")]
    NotStarted,
    #[error("coupon has expired")]
    Expired,
    #[error("order subtotal is below the coupon minimum of {0}")]
    BelowMinimum(Decimal),
    #[error("coupon already used the maximum number of times by this customer")]
    UserLimitReached,
    #[error("coupon usage limit reached")]
    UsageLimitReached,
    #[error("coupon is restricted to other customers")]
    EmailNotAllowed,
}

impl CouponRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Unknown(_) => "unknown",
            Self::Inactive => "inactive",
            Self::NotStarted => "not_started",
            Self::Expired => "expired",
            Self::BelowMinimum(_) => "below_minimum",
            Self::UserLimitReached => "user_limit",
            Self::UsageLimitReached => "usage_limit",
            Self::EmailNotAllowed => "email_not_allowed",
        }
    }
}

impl From<CouponRejection> for AppError {
    fn from(rejection: CouponRejection) -> Self {
        AppError::Unprocessable(anyhow::Error::new(rejection))
    }
}

/// Who is using the coupon, and on what.
#[derive(Debug, Clone)]
pub struct CouponUse<'a> {
    /// Base-currency subtotal, before the coupon. `None` skips the minimum.
    pub subtotal: Option<Decimal>,
    pub user_id: Option<Uuid>,
    pub email: &'a str,
    /// Prior redemptions by this user (or email for guests).
    pub user_redemptions: i64,
    pub at: DateTime<Utc>,
}

/// Pure eligibility check.
pub fn check_coupon(coupon: &Coupon, usage: &CouponUse<'_>) -> Result<(), CouponRejection> {
    if !coupon.active {
        return Err(CouponRejection::Inactive);
    }
    if let Some(from) = coupon.valid_from
        && usage.at < from
    {
        return Err(CouponRejection::NotStarted);
    }
    if let Some(until) = coupon.valid_until
        && usage.at > until
    {
        return Err(CouponRejection::Expired);
    }
    if let (Some(min), Some(subtotal)) = (coupon.min_subtotal, usage.subtotal)
        && subtotal < min
    {
        return Err(CouponRejection::BelowMinimum(min));
    }
    if let Some(limit) = coupon.per_user_limit
        && usage.user_redemptions >= i64::from(limit)
    {
        return Err(CouponRejection::UserLimitReached);
    }
    if let Some(limit) = coupon.usage_limit
        && coupon.used_count >= limit
    {
        return Err(CouponRejection::UsageLimitReached);
    }
    if !coupon.allowed_emails.is_empty()
        && !coupon
            .allowed_emails
            .iter()
            .any(|allowed| allowed.trim().eq_ignore_ascii_case(usage.email.trim()))
    {
        return Err(CouponRejection::EmailNotAllowed);
    }
    Ok(())
}

impl From<&Coupon> for CouponDiscount {
    fn from(coupon: &Coupon) -> Self {
        CouponDiscount {
            code: coupon.code.clone(),
            kind: coupon.kind,
            value: coupon.value,
            stackable: coupon.stackable,
        }
    }
}

#[derive(Debug, Error)]
pub enum CouponError {
    #[error(transparent)]
    Rejected(#[from] CouponRejection),
    #[error(transparent)]
    Store(#[from] AppError),
}

impl From<CouponError> for AppError {
    fn from(err: CouponError) -> Self {
        match err {
            CouponError::Rejected(rejection) => rejection.into(),
            CouponError::Store(err) => err,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeemOutcome {
    Redeemed { coupon_id: Uuid, amount: Decimal },
    AlreadyRedeemed,
    Rejected(CouponRejection),
}

impl RedeemOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Redeemed { .. } => "redeemed",
            Self::AlreadyRedeemed => "already_redeemed",
            Self::Rejected(_) => "rejected",
        }
    }
}

#[derive(Clone)]
pub struct CouponLedger {
    store: Arc<dyn Store>,
}

impl CouponLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Look up and check a coupon for an order being priced.
    #[instrument(skip(self, email), fields(code = %code))]
    pub async fn validate(
        &self,
        code: &str,
        subtotal: Option<Decimal>,
        user_id: Option<Uuid>,
        email: &str,
    ) -> Result<Coupon, CouponError> {
        let coupon = self
            .store
            .find_coupon_by_code(code.trim())
            .await?
            .ok_or_else(|| CouponRejection::Unknown(code.trim().to_string()))?;

        let user_redemptions = self
            .store
            .count_user_redemptions(coupon.id, user_id, email)
            .await?;

        check_coupon(
            &coupon,
            &CouponUse {
                subtotal,
                user_id,
                email,
                user_redemptions,
                at: Utc::now(),
            },
        )?;
        Ok(coupon)
    }

    /// Record the redemption for a completed order.
    ///
    /// Safe to repeat for the same order: a second call reports
    /// `AlreadyRedeemed`. Rejections are returned, not raised: the order stays
    /// completed either way. The discount was priced against the exact
    /// subtotal at checkout, so the minimum is not re-derived from the
    /// converted order amounts here.
    #[instrument(skip(self, order), fields(order_id = %order.id, code = %code))]
    pub async fn redeem(&self, code: &str, order: &Order) -> Result<RedeemOutcome, AppError> {
        let coupon = match self
            .validate(code, None, order.user_id, &order.email)
            .await
        {
            Ok(coupon) => coupon,
            Err(CouponError::Rejected(rejection)) => {
                if self.already_redeemed_for(order.id, code).await? {
                    return Ok(RedeemOutcome::AlreadyRedeemed);
                }
                warn!(reason = rejection.reason(), "Coupon redemption skipped: {}", rejection);
                return Ok(RedeemOutcome::Rejected(rejection));
            }
            Err(CouponError::Store(err)) => return Err(err),
        };

        let redemption = CouponRedemption {
            id: Uuid::new_v4(),
            coupon_id: coupon.id,
            user_id: order.user_id,
            email: order.email.clone(),
            order_id: order.id,
            amount: order.discount,
            created_at: Utc::now(),
        };

        match self.store.record_redemption(&redemption).await? {
            RedemptionWrite::Recorded => {
                info!(coupon_id = %coupon.id, amount = %order.discount, "Coupon redeemed");
                Ok(RedeemOutcome::Redeemed {
                    coupon_id: coupon.id,
                    amount: order.discount,
                })
            }
            RedemptionWrite::AlreadyRecorded => Ok(RedeemOutcome::AlreadyRedeemed),
            RedemptionWrite::LimitReached => {
                warn!(coupon_id = %coupon.id, "Coupon usage limit reached during redemption");
                Ok(RedeemOutcome::Rejected(CouponRejection::UsageLimitReached))
            }
        }
    }

    async fn already_redeemed_for(&self, order_id: Uuid, code: &str) -> Result<bool, AppError> {
        let Some(coupon) = self.store.find_coupon_by_code(code.trim()).await? else {
            return Ok(false);
        };
        Ok(self
            .store
            .redemptions_for_order(order_id)
            .await?
            .iter()
            .any(|r| r.coupon_id == coupon.id))
    }
}
