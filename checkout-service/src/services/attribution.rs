//! Links a completed order to the affiliate who referred it.

use super::store::Store;
use crate::models::{Affiliate, AffiliateClick, AffiliateStatus, Order};
use chrono::Utc;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// How the affiliate was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributionSource {
    Click,
    ReferralCode,
    Order,
}

impl AttributionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::ReferralCode => "referral_code",
            Self::Order => "order",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Attribution {
    pub affiliate: Affiliate,
    pub click: Option<AffiliateClick>,
    pub source: AttributionSource,
    /// `true` only for the call that flipped the click to converted.
    pub newly_converted: bool,
}

#[derive(Clone)]
pub struct AffiliateAttribution {
    store: Arc<dyn Store>,
}

impl AffiliateAttribution {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Resolve the referring affiliate: click id first, then referral code
    /// or slug, then an affiliate already stored on the order. Only active
    /// affiliates attribute.
    #[instrument(skip_all, fields(order_id = %order.id))]
    pub async fn attribute(&self, order: &Order) -> Result<Option<Attribution>, AppError> {
        let Some((affiliate, click, source)) = self.find_affiliate(order).await? else {
            debug!("Order has no referral");
            return Ok(None);
        };

        if affiliate.status != AffiliateStatus::Active {
            info!(
                affiliate_id = %affiliate.id,
                status = affiliate.status.as_str(),
                "Referral ignored: affiliate is not active"
            );
            return Ok(None);
        }

        let newly_converted = match &click {
            Some(click) => {
                self.store
                    .mark_click_converted(click.id, order.id, Utc::now())
                    .await?
            }
            None => false,
        };

        let link_id = click.as_ref().and_then(|c| c.link_id).or(order.affiliate_link_id);
        self.store
            .attach_affiliate(order.id, affiliate.id, link_id)
            .await?;

        info!(
            affiliate_id = %affiliate.id,
            source = source.as_str(),
            newly_converted,
            "Order attributed to affiliate"
        );

        Ok(Some(Attribution {
            affiliate,
            click,
            source,
            newly_converted,
        }))
    }

    async fn find_affiliate(
        &self,
        order: &Order,
    ) -> Result<Option<(Affiliate, Option<AffiliateClick>, AttributionSource)>, AppError> {
        if let Some(click_id) = order.affiliate_click_id
            && let Some(click) = self.store.get_click(click_id).await?
            && let Some(affiliate) = self.store.get_affiliate(click.affiliate_id).await?
        {
            return Ok(Some((affiliate, Some(click), AttributionSource::Click)));
        }

        if let Some(code) = order.referral_code.as_deref().map(str::trim)
            && !code.is_empty()
            && let Some(affiliate) = self.store.find_affiliate_by_code(code).await?
        {
            return Ok(Some((affiliate, None, AttributionSource::ReferralCode)));
        }

        if let Some(affiliate_id) = order.affiliate_id
            && let Some(affiliate) = self.store.get_affiliate(affiliate_id).await?
        {
            return Ok(Some((affiliate, None, AttributionSource::Order)));
        }

        Ok(None)
    }

    /// Record a referral click.
    pub async fn record_click(
        &self,
        code: &str,
        link_id: Option<Uuid>,
        ip: &str,
    ) -> Result<AffiliateClick, AppError> {
        let affiliate = self
            .store
            .find_affiliate_by_code(code.trim())
            .await?
            .filter(|a| a.status == AffiliateStatus::Active)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("affiliate {} not found", code)))?;

        self.store
            .insert_click(&crate::models::NewAffiliateClick {
                affiliate_id: affiliate.id,
                link_id,
                ip: ip.to_string(),
            })
            .await
    }
}
