//! Domain models for checkout-service.

mod affiliate;
mod commission;
mod coupon;
mod event;
mod order;

pub use affiliate::{Affiliate, AffiliateClick, AffiliateStatus, AffiliateType, NewAffiliateClick};
pub use commission::{
    AffiliateCommission, CommissionStatus, FinancialTransaction, TransferStatus,
};
pub use coupon::{Coupon, CouponKind, CouponRedemption};
pub use event::{PaymentEvent, ProviderId};
pub use order::{Order, OrderItem, OrderStatus, PaymentStatus};

use rust_decimal::{Decimal, RoundingStrategy};

/// Rounding epsilon used for every monetary equality check.
pub const MONEY_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Raised when a stored status string does not name a known variant.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub(crate) fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// Round half away from zero to cents.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// `true` when two amounts differ by no more than [`MONEY_EPSILON`].
pub fn amounts_match(a: Decimal, b: Decimal) -> bool {
    (a - b).abs() <= MONEY_EPSILON
}

/// Convert an integer minor-unit amount (cents) to a decimal amount.
pub fn from_minor_units(amount_minor: i64) -> Decimal {
    Decimal::new(amount_minor, 2)
}

/// Convert a decimal amount to integer minor units, rounding to cents first.
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    use rust_decimal::prelude::ToPrimitive;
    (round_money(amount) * Decimal::ONE_HUNDRED).to_i64()
}
