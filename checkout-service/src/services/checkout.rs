//! Order finalisation: prices the cart and persists the pending order.

use super::store::Store;
use crate::models::{Order, OrderItem, OrderStatus, PaymentStatus, ProviderId};
use crate::services::attribution::AffiliateAttribution;
use crate::services::coupons::CouponLedger;
use crate::services::currency::CurrencyConverter;
use crate::services::pricing::{
    price_order, Conversion, CouponDiscount, PriceLine, PricingResult, Promotion,
};
use chrono::Utc;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// A cart ready to be turned into an order.
#[derive(Debug, Clone)]
pub struct NewCheckout {
    pub user_id: Option<Uuid>,
    pub email: String,
    pub provider: ProviderId,
    pub currency: String,
    pub lines: Vec<PriceLine>,
    pub global_promotion: Option<Promotion>,
    pub coupon_code: Option<String>,
    /// Checkout session / preference id issued by the provider, if any.
    pub provisional_reference: Option<String>,
    pub affiliate_click_id: Option<Uuid>,
    pub referral_code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FinalizedOrder {
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub pricing: PricingResult,
}

#[derive(Clone)]
pub struct CheckoutService {
    store: Arc<dyn Store>,
    converter: Arc<CurrencyConverter>,
    coupons: CouponLedger,
    attribution: AffiliateAttribution,
}

impl CheckoutService {
    pub fn new(store: Arc<dyn Store>, converter: Arc<CurrencyConverter>) -> Self {
        Self {
            coupons: CouponLedger::new(store.clone()),
            attribution: AffiliateAttribution::new(store.clone()),
            store,
            converter,
        }
    }

    /// Price the cart and store the order as `pending`.
    ///
    /// The coupon minimum is checked against the base-currency subtotal; the
    /// discount itself is computed by the pricing engine after promotions.
    #[instrument(skip_all, fields(provider = %checkout.provider, currency = %checkout.currency))]
    pub async fn finalize_order(&self, checkout: NewCheckout) -> Result<FinalizedOrder, AppError> {
        let base = price_order(
            &checkout.lines,
            checkout.global_promotion.as_ref(),
            None,
            &Conversion::identity(),
        )?;

        let coupon_code = checkout
            .coupon_code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty());
        let discount = match coupon_code {
            Some(code) => {
                let coupon = self
                    .coupons
                    .validate(code, Some(base.subtotal), checkout.user_id, &checkout.email)
                    .await?;
                Some(CouponDiscount::from(&coupon))
            }
            None => None,
        };

        let currency = checkout.currency.trim().to_uppercase();
        let conversion = self.converter.conversion(&currency).await?;
        let pricing = price_order(
            &checkout.lines,
            checkout.global_promotion.as_ref(),
            discount.as_ref(),
            &conversion,
        )?;

        let id = Uuid::new_v4();
        let now = Utc::now();
        let provisional = checkout
            .provisional_reference
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| format!("chk_{}", id.simple()));

        let order = Order {
            id,
            user_id: checkout.user_id,
            email: checkout.email.trim().to_string(),
            subtotal: pricing.subtotal,
            discount: pricing.discount,
            total: pricing.total,
            currency: pricing.currency.clone(),
            conversion_rate: pricing.conversion_rate,
            payment_provider: checkout.provider,
            payment_reference: provisional.clone(),
            provisional_reference: provisional,
            external_reference: Some(id.to_string()),
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Pending,
            coupon_code: pricing.coupon_code.clone(),
            affiliate_id: None,
            affiliate_link_id: None,
            affiliate_click_id: checkout.affiliate_click_id,
            referral_code: checkout
                .referral_code
                .map(|code| code.trim().to_string())
                .filter(|code| !code.is_empty()),
            paid_at: None,
            created_at: now,
            updated_at: now,
        };

        let items: Vec<OrderItem> = pricing
            .lines
            .iter()
            .map(|line| OrderItem {
                id: Uuid::new_v4(),
                order_id: id,
                product_id: line.product_id,
                variation_id: line.variation_id,
                unit_price: line.unit_price,
                quantity: line.quantity as i32,
                total: line.total,
            })
            .collect();

        self.store.insert_order(&order, &items).await?;

        info!(
            order_id = %order.id,
            total = %order.total,
            discount = %order.discount,
            coupon = ?order.coupon_code,
            "Order finalised"
        );

        Ok(FinalizedOrder {
            order,
            items,
            pricing,
        })
    }

    pub fn attribution(&self) -> &AffiliateAttribution {
        &self.attribution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::coupons::CouponRejection;
    use crate::services::currency::RateSource;
    use crate::services::fixtures::percentage_coupon;
    use crate::services::memory::InMemoryStore;
    use crate::services::store::OrderStore;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::time::Duration;

    struct StaticRates;

    #[async_trait]
    impl RateSource for StaticRates {
        async fn latest(&self, _base: &str) -> Result<HashMap<String, Decimal>, anyhow::Error> {
            Ok(HashMap::from([("USD".to_string(), dec!(0.20))]))
        }
    }

    fn service(store: &InMemoryStore) -> CheckoutService {
        let converter = Arc::new(CurrencyConverter::new(
            Arc::new(StaticRates),
            Duration::from_secs(600),
        ));
        CheckoutService::new(Arc::new(store.clone()), converter)
    }

    fn cart(currency: &str, coupon: Option<&str>) -> NewCheckout {
        NewCheckout {
            user_id: None,
            email: "buyer@example.com".into(),
            provider: ProviderId::Stripe,
            currency: currency.into(),
            lines: vec![PriceLine {
                product_id: Uuid::new_v4(),
                variation_id: None,
                base_price: dec!(100),
                quantity: 1,
                product_promotion: None,
                variation_promotion: None,
            }],
            global_promotion: None,
            coupon_code: coupon.map(str::to_string),
            provisional_reference: Some("cs_test_123".into()),
            affiliate_click_id: None,
            referral_code: Some("  ".into()),
        }
    }

    #[tokio::test]
    async fn percentage_coupon_priced_and_persisted() {
        let store = InMemoryStore::new();
        let mut coupon = percentage_coupon("SAVE10", dec!(10));
        coupon.min_subtotal = Some(dec!(50));
        store.put_coupon(coupon).await;

        let finalized = service(&store)
            .finalize_order(cart("brl", Some("SAVE10")))
            .await
            .unwrap();
        let order = &finalized.order;
        assert_eq!(order.subtotal, dec!(100));
        assert_eq!(order.discount, dec!(10));
        assert_eq!(order.total, dec!(90));
        assert_eq!(order.currency, "BRL");
        assert_eq!(order.coupon_code.as_deref(), Some("SAVE10"));
        assert_eq!(order.payment_reference, "cs_test_123");
        assert!(order.has_provisional_reference());
        assert!(order.referral_code.is_none());

        let items = store.order_items(order.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].total, dec!(90));
    }

    #[tokio::test]
    async fn converted_order_keeps_base_minimum() {
        let store = InMemoryStore::new();
        let mut coupon = percentage_coupon("SAVE10", dec!(10));
        coupon.min_subtotal = Some(dec!(50));
        store.put_coupon(coupon).await;

        let finalized = service(&store)
            .finalize_order(cart("USD", Some("SAVE10")))
            .await
            .unwrap();
        let order = &finalized.order;
        assert_eq!(order.subtotal, dec!(20.00));
        assert_eq!(order.discount, dec!(2.00));
        assert_eq!(order.total, dec!(18.00));
        assert_eq!(order.conversion_rate, dec!(0.20));
    }

    #[tokio::test]
    async fn coupon_below_minimum_is_rejected() {
        let store = InMemoryStore::new();
        let mut coupon = percentage_coupon("BIG", dec!(10));
        coupon.min_subtotal = Some(dec!(500));
        store.put_coupon(coupon).await;

        let err = service(&store)
            .finalize_order(cart("BRL", Some("BIG")))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unprocessable(_)));
        assert!(err.to_string().contains(&CouponRejection::BelowMinimum(dec!(500)).to_string()));
    }

    #[tokio::test]
    async fn empty_cart_is_a_bad_request() {
        let store = InMemoryStore::new();
        let mut checkout = cart("BRL", None);
        checkout.lines.clear();
        let err = service(&store).finalize_order(checkout).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn unknown_currency_is_unprocessable() {
        let store = InMemoryStore::new();
        let err = service(&store)
            .finalize_order(cart("JPY", None))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unprocessable(_)));
    }
}
