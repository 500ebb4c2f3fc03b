use super::UnknownVariant;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Commission lifecycle. Only moves forward: `pending → approved → paid`,
/// or `pending → paid` for pre-split and successful automatic transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionStatus {
    Pending,
    Approved,
    Paid,
}

impl CommissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Paid => "paid",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Approved => 1,
            Self::Paid => 2,
        }
    }

    pub fn can_advance_to(&self, next: CommissionStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl TryFrom<String> for CommissionStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "paid" => Ok(Self::Paid),
            _ => Err(UnknownVariant::new("commission status", value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    NotAttempted,
    PreSplit,
    Succeeded,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotAttempted => "not_attempted",
            Self::PreSplit => "pre_split",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl TryFrom<String> for TransferStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "not_attempted" => Ok(Self::NotAttempted),
            "pre_split" => Ok(Self::PreSplit),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(UnknownVariant::new("transfer status", value)),
        }
    }
}

/// One commission per order (unique on `order_id`).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AffiliateCommission {
    pub id: Uuid,
    pub order_id: Uuid,
    pub affiliate_id: Uuid,
    pub order_total: Decimal,
    pub commission_rate: Decimal,
    pub commission_amount: Decimal,
    pub currency: String,
    #[sqlx(try_from = "String")]
    pub status: CommissionStatus,
    pub fraud_score: i32,
    pub fraud_notes: Option<String>,
    pub transfer_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub transfer_status: TransferStatus,
    pub transfer_attempts: i32,
    pub transfer_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl AffiliateCommission {
    /// Held for manual review; never paid automatically.
    pub fn is_held_for_review(&self) -> bool {
        self.status == CommissionStatus::Pending && self.fraud_notes.is_some()
    }
}

/// Append-only payout ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FinancialTransaction {
    pub id: Uuid,
    pub kind: String,
    pub scope: String,
    pub reference: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub paid: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commission_status_never_reverts() {
        assert!(CommissionStatus::Pending.can_advance_to(CommissionStatus::Approved));
        assert!(CommissionStatus::Pending.can_advance_to(CommissionStatus::Paid));
        assert!(CommissionStatus::Approved.can_advance_to(CommissionStatus::Paid));
        assert!(!CommissionStatus::Paid.can_advance_to(CommissionStatus::Approved));
        assert!(!CommissionStatus::Approved.can_advance_to(CommissionStatus::Pending));
        assert!(!CommissionStatus::Paid.can_advance_to(CommissionStatus::Paid));
    }
}
