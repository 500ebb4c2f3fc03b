//! Order pricing.
//!
//! Prices are quoted in the base ledger currency. [`price_order`] applies
//! promotions and the coupon in base currency, then converts and allocates so
//! that line totals always add up to the order total exactly.

use crate::models::{amounts_match, round_money, CouponKind, Order, OrderItem};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;

/// Currency every catalog price and ledger entry is kept in.
pub const BASE_CURRENCY: &str = "BRL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionKind {
    /// `value` percent off.
    Percentage,
    /// Sell at `value`.
    FixedPrice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Promotion {
    pub kind: PromotionKind,
    pub value: Decimal,
}

impl Promotion {
    fn apply(&self, base_price: Decimal) -> Decimal {
        let price = match self.kind {
            PromotionKind::Percentage => {
                let percent = self.value.clamp(Decimal::ZERO, Decimal::ONE_HUNDRED);
                base_price * (Decimal::ONE_HUNDRED - percent) / Decimal::ONE_HUNDRED
            }
            PromotionKind::FixedPrice => self.value.min(base_price),
        };
        round_money(price.max(Decimal::ZERO))
    }
}

/// A cart line with the catalog data the caller already looked up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceLine {
    pub product_id: Uuid,
    pub variation_id: Option<Uuid>,
    pub base_price: Decimal,
    pub quantity: u32,
    pub product_promotion: Option<Promotion>,
    pub variation_promotion: Option<Promotion>,
}

/// Discount to apply after promotions, already validated by the coupon ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct CouponDiscount {
    pub code: String,
    pub kind: CouponKind,
    pub value: Decimal,
    pub stackable: bool,
}

/// Base → order currency conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversion {
    pub currency: String,
    pub rate: Decimal,
}

impl Conversion {
    pub fn identity() -> Self {
        Self {
            currency: BASE_CURRENCY.to_string(),
            rate: Decimal::ONE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PricedLine {
    pub product_id: Uuid,
    pub variation_id: Option<Uuid>,
    pub quantity: u32,
    /// Converted unit price after promotions.
    pub unit_price: Decimal,
    /// Converted line total before the coupon.
    pub gross: Decimal,
    /// Share of the order discount.
    pub discount: Decimal,
    /// `gross − discount`.
    pub total: Decimal,
    pub promotion_applied: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PricingResult {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub conversion_rate: Decimal,
    pub coupon_code: Option<String>,
    pub lines: Vec<PricedLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PricingError {
    #[error("order has no items")]
    EmptyOrder,

    #[error("line {0} has zero quantity")]
    ZeroQuantity(usize),

    #[error("line {0} has a negative price")]
    NegativePrice(usize),

    #[error("coupon {0} cannot be combined with promotions")]
    CouponNotStackable(String),

    #[error("conversion rate must be positive")]
    InvalidRate,

    #[error("unsupported currency {0}")]
    UnsupportedCurrency(String),

    #[error("order totals are inconsistent: {0}")]
    InconsistentTotals(String),
}

impl From<PricingError> for AppError {
    fn from(err: PricingError) -> Self {
        match err {
            PricingError::EmptyOrder
            | PricingError::ZeroQuantity(_)
            | PricingError::NegativePrice(_) => AppError::BadRequest(anyhow::Error::new(err)),
            _ => AppError::Unprocessable(anyhow::Error::new(err)),
        }
    }
}

/// Split `total` across `weights` proportionally. Shares are truncated to
/// cents and the remainder goes to the heaviest line (the last one on ties),
/// so the shares add up to `total` exactly and none is negative for a
/// non-negative `total`.
pub fn allocate(total: Decimal, weights: &[Decimal]) -> Vec<Decimal> {
    let weight_sum: Decimal = weights.iter().copied().sum();
    let heaviest = weights
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, Decimal)>, (i, w)| match best {
            Some((_, top)) if top > *w => best,
            _ => Some((i, *w)),
        })
        .map(|(i, _)| i);

    let mut shares: Vec<Decimal> = weights
        .iter()
        .map(|weight| {
            if weight_sum.is_zero() {
                Decimal::ZERO
            } else {
                (total * *weight / weight_sum).round_dp_with_strategy(2, RoundingStrategy::ToZero)
            }
        })
        .collect();
    if let Some(i) = heaviest {
        let allocated: Decimal = shares.iter().copied().sum();
        shares[i] += total - allocated;
    }
    shares
}

pub fn price_order(
    lines: &[PriceLine],
    global_promotion: Option<&Promotion>,
    coupon: Option<&CouponDiscount>,
    conversion: &Conversion,
) -> Result<PricingResult, PricingError> {
    if lines.is_empty() {
        return Err(PricingError::EmptyOrder);
    }
    if conversion.rate <= Decimal::ZERO {
        return Err(PricingError::InvalidRate);
    }

    let mut unit_prices = Vec::with_capacity(lines.len());
    let mut base_totals = Vec::with_capacity(lines.len());
    let mut promoted = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        if line.quantity == 0 {
            return Err(PricingError::ZeroQuantity(i));
        }
        if line.base_price < Decimal::ZERO {
            return Err(PricingError::NegativePrice(i));
        }
        let promotion = line
            .variation_promotion
            .as_ref()
            .or(line.product_promotion.as_ref())
            .or(global_promotion);
        let unit = match promotion {
            Some(p) => p.apply(line.base_price),
            None => round_money(line.base_price),
        };
        unit_prices.push(unit);
        base_totals.push(unit * Decimal::from(line.quantity));
        promoted.push(promotion.is_some());
    }

    let base_subtotal: Decimal = base_totals.iter().copied().sum();
    let any_promotion = promoted.iter().any(|p| *p);

    let base_discount = match coupon {
        None => Decimal::ZERO,
        Some(coupon) => {
            if !coupon.stackable && any_promotion {
                return Err(PricingError::CouponNotStackable(coupon.code.clone()));
            }
            let raw = match coupon.kind {
                CouponKind::Percentage => {
                    base_subtotal * coupon.value.clamp(Decimal::ZERO, Decimal::ONE_HUNDRED)
                        / Decimal::ONE_HUNDRED
                }
                CouponKind::FixedAmount => coupon.value.max(Decimal::ZERO),
            };
            round_money(raw).min(base_subtotal)
        }
    };

    let subtotal = round_money(base_subtotal * conversion.rate);
    let discount = round_money(base_discount * conversion.rate).min(subtotal);

    let gross = allocate(subtotal, &base_totals);
    let discounts = allocate(discount, &gross);

    let priced = lines
        .iter()
        .enumerate()
        .map(|(i, line)| PricedLine {
            product_id: line.product_id,
            variation_id: line.variation_id,
            quantity: line.quantity,
            unit_price: round_money(unit_prices[i] * conversion.rate),
            gross: gross[i],
            discount: discounts[i],
            total: gross[i] - discounts[i],
            promotion_applied: promoted[i],
        })
        .collect();

    Ok(PricingResult {
        subtotal,
        discount,
        total: subtotal - discount,
        currency: conversion.currency.clone(),
        conversion_rate: conversion.rate,
        coupon_code: coupon.map(|c| c.code.clone()),
        lines: priced,
    })
}

/// `total = subtotal − discount` and the items add up to the total.
pub fn validate_order_totals(order: &Order, items: &[OrderItem]) -> Result<(), PricingError> {
    if !amounts_match(order.subtotal - order.discount, order.total) {
        return Err(PricingError::InconsistentTotals(format!(
            "subtotal {} - discount {} != total {}",
            order.subtotal, order.discount, order.total
        )));
    }
    if items.is_empty() {
        return Ok(());
    }
    let items_total: Decimal = items.iter().map(|i| i.total).sum();
    if !amounts_match(items_total, order.total) {
        return Err(PricingError::InconsistentTotals(format!(
            "items sum {} != total {}",
            items_total, order.total
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn line(price: Decimal, quantity: u32) -> PriceLine {
        PriceLine {
            product_id: Uuid::new_v4(),
            variation_id: None,
            base_price: price,
            quantity,
            product_promotion: None,
            variation_promotion: None,
        }
    }

    fn coupon(kind: CouponKind, value: Decimal, stackable: bool) -> CouponDiscount {
        CouponDiscount {
            code: "SAVE".to_string(),
            kind,
            value,
            stackable,
        }
    }

    #[test]
    fn ten_percent_coupon_on_one_hundred() {
        let result = price_order(
            &[line(dec!(100.00), 1)],
            None,
            Some(&coupon(CouponKind::Percentage, dec!(10), false)),
            &Conversion::identity(),
        )
        .unwrap();
        assert_eq!(result.subtotal, dec!(100.00));
        assert_eq!(result.discount, dec!(10.00));
        assert_eq!(result.total, dec!(90.00));
        assert_eq!(result.lines[0].total, dec!(90.00));
    }

    #[test]
    fn variation_promotion_beats_product_and_global() {
        let mut l = line(dec!(100.00), 1);
        l.variation_promotion = Some(Promotion {
            kind: PromotionKind::FixedPrice,
            value: dec!(70.00),
        });
        l.product_promotion = Some(Promotion {
            kind: PromotionKind::Percentage,
            value: dec!(50),
        });
        let global = Promotion {
            kind: PromotionKind::Percentage,
            value: dec!(10),
        };
        let result = price_order(&[l.clone()], Some(&global), None, &Conversion::identity()).unwrap();
        assert_eq!(result.total, dec!(70.00));

        l.variation_promotion = None;
        let result = price_order(&[l.clone()], Some(&global), None, &Conversion::identity()).unwrap();
        assert_eq!(result.total, dec!(50.00));

        l.product_promotion = None;
        let result = price_order(&[l], Some(&global), None, &Conversion::identity()).unwrap();
        assert_eq!(result.total, dec!(90.00));
    }

    #[test]
    fn non_stackable_coupon_rejected_with_promotion() {
        let global = Promotion {
            kind: PromotionKind::Percentage,
            value: dec!(10),
        };
        let err = price_order(
            &[line(dec!(100.00), 1)],
            Some(&global),
            Some(&coupon(CouponKind::FixedAmount, dec!(5), false)),
            &Conversion::identity(),
        )
        .unwrap_err();
        assert_eq!(err, PricingError::CouponNotStackable("SAVE".into()));

        let ok = price_order(
            &[line(dec!(100.00), 1)],
            Some(&global),
            Some(&coupon(CouponKind::FixedAmount, dec!(5), true)),
            &Conversion::identity(),
        )
        .unwrap();
        assert_eq!(ok.total, dec!(85.00));
    }

    #[test]
    fn fixed_coupon_is_capped_at_subtotal() {
        let result = price_order(
            &[line(dec!(20.00), 1)],
            None,
            Some(&coupon(CouponKind::FixedAmount, dec!(50), false)),
            &Conversion::identity(),
        )
        .unwrap();
        assert_eq!(result.discount, dec!(20.00));
        assert_eq!(result.total, Decimal::ZERO);
    }

    #[test]
    fn converted_lines_add_up_exactly() {
        let lines = [line(dec!(33.33), 1), line(dec!(33.33), 1), line(dec!(33.34), 1)];
        let conversion = Conversion {
            currency: "USD".to_string(),
            rate: dec!(0.1873),
        };
        let result = price_order(
            &lines,
            None,
            Some(&coupon(CouponKind::Percentage, dec!(15), false)),
            &conversion,
        )
        .unwrap();

        let gross: Decimal = result.lines.iter().map(|l| l.gross).sum();
        let discounts: Decimal = result.lines.iter().map(|l| l.discount).sum();
        let totals: Decimal = result.lines.iter().map(|l| l.total).sum();
        assert_eq!(gross, result.subtotal);
        assert_eq!(discounts, result.discount);
        assert_eq!(totals, result.subtotal - result.discount);
        assert_eq!(result.currency, "USD");
        assert_eq!(result.subtotal, dec!(18.73));
    }

    #[test]
    fn zero_weight_lines_never_go_negative() {
        let shares = allocate(dec!(0.02), &[dec!(1), dec!(1), dec!(1), dec!(0)]);
        assert_eq!(shares.iter().copied().sum::<Decimal>(), dec!(0.02));
        assert!(shares.iter().all(|s| *s >= Decimal::ZERO));
        assert_eq!(shares[3], Decimal::ZERO);

        let shares = allocate(dec!(0.02), &[dec!(1), dec!(1), dec!(1), dec!(1)]);
        assert_eq!(shares.iter().copied().sum::<Decimal>(), dec!(0.02));
        assert!(shares.iter().all(|s| *s >= Decimal::ZERO));
    }

    #[test]
    fn allocation_absorbs_remainder_in_last_share() {
        let shares = allocate(dec!(10.00), &[dec!(1), dec!(1), dec!(1)]);
        assert_eq!(shares, vec![dec!(3.33), dec!(3.33), dec!(3.34)]);
        assert_eq!(allocate(dec!(0), &[dec!(0), dec!(0)]), vec![dec!(0), dec!(0)]);
    }

    #[test]
    fn rejects_empty_and_zero_quantity() {
        assert_eq!(
            price_order(&[], None, None, &Conversion::identity()).unwrap_err(),
            PricingError::EmptyOrder
        );
        assert_eq!(
            price_order(&[line(dec!(1), 0)], None, None, &Conversion::identity()).unwrap_err(),
            PricingError::ZeroQuantity(0)
        );
    }

    #[test]
    fn order_total_validation() {
        use crate::models::ProviderId;
        use crate::services::fixtures::{pending_order, single_item};

        let mut order = pending_order(ProviderId::Stripe, dec!(90.00), "BRL");
        order.subtotal = dec!(100.00);
        order.discount = dec!(10.00);
        let items = single_item(&order);
        assert!(validate_order_totals(&order, &items).is_ok());

        order.discount = dec!(5.00);
        assert!(validate_order_totals(&order, &items).is_err());
    }
}
