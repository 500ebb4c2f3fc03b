//! Builders shared by unit tests.

use crate::models::{
    Affiliate, AffiliateStatus, AffiliateType, Coupon, CouponKind, Order, OrderItem, OrderStatus,
    PaymentStatus, ProviderId,
};
use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

pub fn pending_order(provider: ProviderId, total: Decimal, currency: &str) -> Order {
    let id = Uuid::new_v4();
    let now = Utc::now();
    let provisional = format!("prov-{}", id.simple());
    Order {
        id,
        user_id: None,
        email: "buyer@example.com".to_string(),
        subtotal: total,
        discount: Decimal::ZERO,
        total,
        currency: currency.to_string(),
        conversion_rate: Decimal::ONE,
        payment_provider: provider,
        payment_reference: provisional.clone(),
        provisional_reference: provisional,
        external_reference: Some(format!("ORD-{}", &id.simple().to_string()[..8])),
        status: OrderStatus::Pending,
        payment_status: PaymentStatus::Pending,
        coupon_code: None,
        affiliate_id: None,
        affiliate_link_id: None,
        affiliate_click_id: None,
        referral_code: None,
        paid_at: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn single_item(order: &Order) -> Vec<OrderItem> {
    vec![OrderItem {
        id: Uuid::new_v4(),
        order_id: order.id,
        product_id: Uuid::new_v4(),
        variation_id: None,
        unit_price: order.total,
        quantity: 1,
        total: order.total,
    }]
}

pub fn active_affiliate(email: &str, rate: Decimal) -> Affiliate {
    let id = Uuid::new_v4();
    Affiliate {
        id,
        code: format!("AFF{}", &id.simple().to_string()[..6]).to_uppercase(),
        slug: format!("affiliate-{}", &id.simple().to_string()[..6]),
        email: email.to_string(),
        user_id: None,
        status: AffiliateStatus::Active,
        affiliate_type: AffiliateType::Common,
        commission_value: rate,
        total_revenue: Decimal::ZERO,
        commission_owed: Decimal::ZERO,
        commission_paid: Decimal::ZERO,
        pix_key: None,
        auto_transfer: false,
        minimum_payout: Decimal::ZERO,
    }
}

pub fn percentage_coupon(code: &str, percent: Decimal) -> Coupon {
    Coupon {
        id: Uuid::new_v4(),
        code: code.to_string(),
        kind: CouponKind::Percentage,
        value: percent,
        min_subtotal: None,
        usage_limit: None,
        per_user_limit: None,
        stackable: false,
        valid_from: None,
        valid_until: None,
        active: true,
        used_count: 0,
        allowed_emails: Vec::new(),
    }
}
