//! Referral fraud heuristics.
//!
//! The score is additive and capped at [`MAX_SCORE`]; each factor carries a
//! human-readable note that is persisted on the commission when the order
//! is held for review.

use super::store::{ClickStats, Store};
use crate::models::{Affiliate, AffiliateClick, Order};
use chrono::Duration;
use service_core::error::AppError;
use tracing::instrument;

pub const MAX_SCORE: u32 = 100;
pub const DEFAULT_THRESHOLD: u32 = 50;

/// Minimum clicks before the conversion rate means anything.
const MIN_CLICKS_FOR_RATE: i64 = 5;

/// Observations about one attributed order.
#[derive(Debug, Clone, Default)]
pub struct FraudSignals {
    pub email_matches_affiliate: Option<String>,
    pub user_matches_affiliate: bool,
    /// Converted clicks from the referring click's IP in the last 24 hours.
    pub converted_clicks_from_ip: i64,
    /// Affiliate click totals over the last 3 days.
    pub recent_clicks: ClickStats,
    /// Time between the referring click and the purchase.
    pub click_to_purchase: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FraudAssessment {
    pub score: u32,
    pub reasons: Vec<String>,
}

impl FraudAssessment {
    pub fn is_suspicious(&self, threshold: u32) -> bool {
        self.score >= threshold
    }

    pub fn notes(&self) -> Option<String> {
        (!self.reasons.is_empty()).then(|| self.reasons.join("; "))
    }
}

pub fn score(signals: &FraudSignals) -> FraudAssessment {
    let mut total = 0u32;
    let mut reasons = Vec::new();
    let mut add = |points: u32, reason: String| {
        total += points;
        reasons.push(reason);
    };

    if let Some(email) = &signals.email_matches_affiliate {
        add(50, format!("auto-referral: order email {} is the affiliate's own", email));
    }
    if signals.user_matches_affiliate {
        add(50, "auto-referral: purchasing user is the affiliate's account".to_string());
    }

    match signals.converted_clicks_from_ip {
        n if n > 3 => add(30, format!("{} converted clicks from the same IP in 24h", n)),
        n @ 2..=3 => add(15, format!("{} converted clicks from the same IP in 24h", n)),
        _ => {}
    }

    let stats = signals.recent_clicks;
    if stats.total >= MIN_CLICKS_FOR_RATE {
        // Compare converted/total against 50% and 25% without division.
        if stats.converted * 2 > stats.total {
            add(
                25,
                format!("conversion rate {}/{} above 50% in 3 days", stats.converted, stats.total),
            );
        } else if stats.converted * 4 > stats.total {
            add(
                10,
                format!("conversion rate {}/{} above 25% in 3 days", stats.converted, stats.total),
            );
        }
    }

    if let Some(elapsed) = signals.click_to_purchase
        && elapsed >= Duration::zero()
    {
        if elapsed <= Duration::seconds(5) {
            add(30, format!("purchase {}s after click", elapsed.num_seconds()));
        } else if elapsed <= Duration::seconds(30) {
            add(10, format!("purchase {}s after click", elapsed.num_seconds()));
        }
    }

    FraudAssessment {
        score: total.min(MAX_SCORE),
        reasons,
    }
}

/// Gather the signals for an order attributed to `affiliate`.
#[instrument(skip_all, fields(order_id = %order.id, affiliate_id = %affiliate.id))]
pub async fn collect_signals(
    store: &dyn Store,
    order: &Order,
    affiliate: &Affiliate,
    click: Option<&AffiliateClick>,
) -> Result<FraudSignals, AppError> {
    let now = chrono::Utc::now();

    let email_matches_affiliate = order
        .email
        .trim()
        .eq_ignore_ascii_case(affiliate.email.trim())
        .then(|| order.email.trim().to_ascii_lowercase());

    let user_matches_affiliate = matches!(
        (order.user_id, affiliate.user_id),
        (Some(buyer), Some(owner)) if buyer == owner
    );

    let converted_clicks_from_ip = match click {
        Some(click) if !click.ip.is_empty() => {
            store
                .count_converted_clicks_from_ip(&click.ip, now - Duration::hours(24))
                .await?
        }
        _ => 0,
    };

    let recent_clicks = store
        .click_stats(affiliate.id, now - Duration::days(3))
        .await?;

    Ok(FraudSignals {
        email_matches_affiliate,
        user_matches_affiliate,
        converted_clicks_from_ip,
        recent_clicks,
        click_to_purchase: click.map(|c| order.created_at - c.created_at),
    })
}
