use super::UnknownVariant;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouponKind {
    Percentage,
    FixedAmount,
}

impl CouponKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Percentage => "percentage",
            Self::FixedAmount => "fixed_amount",
        }
    }
}

impl TryFrom<String> for CouponKind {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "percentage" => Ok(Self::Percentage),
            "fixed_amount" => Ok(Self::FixedAmount),
            _ => Err(UnknownVariant::new("coupon kind", value)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Coupon {
    pub id: Uuid,
    pub code: String,
    #[sqlx(try_from = "String")]
    pub kind: CouponKind,
    pub value: Decimal,
    pub min_subtotal: Option<Decimal>,
    /// Global redemption cap.
    pub usage_limit: Option<i32>,
    pub per_user_limit: Option<i32>,
    pub stackable: bool,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub active: bool,
    /// Monotonic; only ever incremented in storage.
    pub used_count: i32,
    /// Empty means any email may use the coupon.
    pub allowed_emails: Vec<String>,
}

/// One redemption per (coupon, order).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CouponRedemption {
    pub id: Uuid,
    pub coupon_id: Uuid,
    pub user_id: Option<Uuid>,
    pub email: String,
    pub order_id: Uuid,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}
