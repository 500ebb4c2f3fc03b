use crate::models::{AffiliateCommission, Order, ProviderId};
use crate::services::checkout::{FinalizedOrder, NewCheckout};
use crate::services::pricing::{PriceLine, PricedLine, Promotion};
use crate::services::WebhookOutcome;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CheckoutLineRequest {
    pub product_id: Uuid,
    pub variation_id: Option<Uuid>,
    pub base_price: Decimal,
    #[validate(range(min = 1, max = 1000, message = "Quantity must be between 1 and 1000"))]
    pub quantity: u32,
    pub product_promotion: Option<Promotion>,
    pub variation_promotion: Option<Promotion>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CheckoutRequest {
    pub user_id: Option<Uuid>,
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
    pub provider: ProviderId,
    #[validate(length(equal = 3, message = "Currency must be an ISO 4217 code"))]
    pub currency: String,
    #[validate(length(min = 1, message = "Order must contain at least one item"), nested)]
    pub items: Vec<CheckoutLineRequest>,
    pub promotion: Option<Promotion>,
    pub coupon_code: Option<String>,
    pub provisional_reference: Option<String>,
    pub affiliate_click_id: Option<Uuid>,
    pub referral_code: Option<String>,
}

impl From<CheckoutRequest> for NewCheckout {
    fn from(request: CheckoutRequest) -> Self {
        Self {
            user_id: request.user_id,
            email: request.email,
            provider: request.provider,
            currency: request.currency,
            lines: request
                .items
                .into_iter()
                .map(|item| PriceLine {
                    product_id: item.product_id,
                    variation_id: item.variation_id,
                    base_price: item.base_price,
                    quantity: item.quantity,
                    product_promotion: item.product_promotion,
                    variation_promotion: item.variation_promotion,
                })
                .collect(),
            global_promotion: request.promotion,
            coupon_code: request.coupon_code,
            provisional_reference: request.provisional_reference,
            affiliate_click_id: request.affiliate_click_id,
            referral_code: request.referral_code,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub order_id: Uuid,
    pub status: &'static str,
    pub provider: ProviderId,
    pub payment_reference: String,
    pub external_reference: Option<String>,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub conversion_rate: Decimal,
    pub coupon_code: Option<String>,
    pub items: Vec<PricedLine>,
}

impl From<FinalizedOrder> for CheckoutResponse {
    fn from(finalized: FinalizedOrder) -> Self {
        let Order {
            id,
            status,
            payment_provider,
            payment_reference,
            external_reference,
            ..
        } = finalized.order;
        let pricing = finalized.pricing;
        Self {
            order_id: id,
            status: status.as_str(),
            provider: payment_provider,
            payment_reference,
            external_reference,
            subtotal: pricing.subtotal,
            discount: pricing.discount,
            total: pricing.total,
            currency: pricing.currency,
            conversion_rate: pricing.conversion_rate,
            coupon_code: pricing.coupon_code,
            items: pricing.lines,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct ClickRequest {
    #[validate(length(min = 1, max = 64, message = "Referral code is required"))]
    pub code: String,
    pub link_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct ClickResponse {
    pub click_id: Uuid,
    pub affiliate_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Body of every acknowledged webhook delivery.
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: WebhookOutcome,
}

impl WebhookAck {
    pub fn new(outcome: WebhookOutcome) -> Self {
        Self {
            received: true,
            outcome,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CommissionQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CommissionListResponse {
    pub commissions: Vec<AffiliateCommission>,
    pub count: usize,
}
