use super::{ProviderId, UnknownVariant};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle of an order.
///
/// `pending` may complete or be cancelled; only a completed order may be
/// refunded. Every other move is rejected by [`OrderStatus::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Completed,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Completed)
                | (Self::Pending, Self::Cancelled)
                | (Self::Completed, Self::Refunded)
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// The payment status that always accompanies this order status.
    pub fn payment_status(&self) -> PaymentStatus {
        match self {
            Self::Pending => PaymentStatus::Pending,
            Self::Completed => PaymentStatus::Paid,
            Self::Cancelled => PaymentStatus::Cancelled,
            Self::Refunded => PaymentStatus::Refunded,
        }
    }
}

impl TryFrom<String> for OrderStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "refunded" => Ok(Self::Refunded),
            _ => Err(UnknownVariant::new("order status", value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }
}

impl TryFrom<String> for PaymentStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            "cancelled" => Ok(Self::Cancelled),
            "refunded" => Ok(Self::Refunded),
            _ => Err(UnknownVariant::new("payment status", value)),
        }
    }
}

/// A customer order.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub email: String,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub currency: String,
    /// Base → order currency rate used when the order was priced.
    pub conversion_rate: Decimal,
    #[sqlx(try_from = "String")]
    pub payment_provider: ProviderId,
    /// Upgraded from the provisional value to the provider's final id.
    pub payment_reference: String,
    pub provisional_reference: String,
    pub external_reference: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: OrderStatus,
    #[sqlx(try_from = "String")]
    pub payment_status: PaymentStatus,
    pub coupon_code: Option<String>,
    pub affiliate_id: Option<Uuid>,
    pub affiliate_link_id: Option<Uuid>,
    pub affiliate_click_id: Option<Uuid>,
    pub referral_code: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// The stored reference has not yet been replaced by the provider's id.
    pub fn has_provisional_reference(&self) -> bool {
        self.payment_reference == self.provisional_reference
    }
}

/// A line of an order. Created once at finalisation, never updated.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub variation_id: Option<Uuid>,
    pub unit_price: Decimal,
    pub quantity: i32,
    pub total: Decimal,
}
