use super::UnknownVariant;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffiliateStatus {
    Active,
    Pending,
    Suspended,
}

impl AffiliateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Pending => "pending",
            Self::Suspended => "suspended",
        }
    }
}

impl TryFrom<String> for AffiliateStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "active" => Ok(Self::Active),
            "pending" => Ok(Self::Pending),
            "suspended" => Ok(Self::Suspended),
            _ => Err(UnknownVariant::new("affiliate status", value)),
        }
    }
}

/// Commercial-license affiliates resell under their own license and never
/// earn commission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffiliateType {
    Common,
    CommercialLicense,
}

impl AffiliateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Common => "common",
            Self::CommercialLicense => "commercial_license",
        }
    }

    pub fn earns_commission(&self) -> bool {
        matches!(self, Self::Common)
    }
}

impl TryFrom<String> for AffiliateType {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "common" => Ok(Self::Common),
            "commercial_license" => Ok(Self::CommercialLicense),
            _ => Err(UnknownVariant::new("affiliate type", value)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Affiliate {
    pub id: Uuid,
    pub code: String,
    pub slug: String,
    pub email: String,
    pub user_id: Option<Uuid>,
    #[sqlx(try_from = "String")]
    pub status: AffiliateStatus,
    #[sqlx(try_from = "String")]
    pub affiliate_type: AffiliateType,
    /// Percentage of the order total.
    pub commission_value: Decimal,
    pub total_revenue: Decimal,
    pub commission_owed: Decimal,
    pub commission_paid: Decimal,
    pub pix_key: Option<String>,
    pub auto_transfer: bool,
    pub minimum_payout: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AffiliateClick {
    pub id: Uuid,
    pub affiliate_id: Uuid,
    pub link_id: Option<Uuid>,
    pub ip: String,
    pub created_at: DateTime<Utc>,
    pub converted: bool,
    pub converted_at: Option<DateTime<Utc>>,
    pub order_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct NewAffiliateClick {
    pub affiliate_id: Uuid,
    pub link_id: Option<Uuid>,
    pub ip: String,
}
