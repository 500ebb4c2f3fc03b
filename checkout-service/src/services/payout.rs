//! Affiliate payouts: single automatic transfers, the consolidated sweep of
//! approved commissions, and the retry sweep for failed automatic transfers.

use super::store::{Store, TransferSettlement};
use crate::models::{Affiliate, AffiliateCommission, CommissionStatus};
use crate::services::metrics::{record_commission, record_payout};
use crate::services::notifications::{SideEffect, SideEffectQueue};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::utils::signature::sha256_hex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub const PAYOUT_KIND: &str = "affiliate_payout";

#[derive(Debug, Clone, Serialize)]
pub struct TransferRequest {
    #[serde(skip)]
    pub idempotency_key: String,
    pub pix_key: String,
    pub amount: Decimal,
    pub currency: String,
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferReceipt {
    pub id: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer request failed: {0}")]
    Request(String),
    #[error("transfer rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("transfer not configured")]
    NotConfigured,
}

/// Pushes funds to an affiliate's PIX key.
#[async_trait]
pub trait TransferGateway: Send + Sync {
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, TransferError>;
}

/// `POST {api_url}/transfers` with bearer auth and an `Idempotency-Key`.
pub struct HttpTransferGateway {
    client: Client,
    api_url: String,
    token: Option<Secret<String>>,
}

impl HttpTransferGateway {
    pub fn new(
        api_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, anyhow::Error> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()).map(Secret::new),
        })
    }
}

#[async_trait]
impl TransferGateway for HttpTransferGateway {
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, TransferError> {
        let token = self.token.as_ref().ok_or(TransferError::NotConfigured)?;
        let url = format!("{}/transfers", self.api_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(token.expose_secret())
            .header("Idempotency-Key", &request.idempotency_key)
            .json(request)
            .send()
            .await
            .map_err(|e| TransferError::Request(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransferError::Request(e.to_string()))?;

        tracing::debug!(status = %status, "Transfer API response");

        if !status.is_success() {
            return Err(TransferError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let receipt: TransferReceipt =
            serde_json::from_str(&body).map_err(|e| TransferError::Request(e.to_string()))?;
        if matches!(receipt.status.as_str(), "failed" | "rejected" | "cancelled") {
            return Err(TransferError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(receipt)
    }
}

#[derive(Debug, Clone)]
pub struct PayoutConfig {
    /// Floor applied on top of each affiliate's own minimum.
    pub global_minimum: Decimal,
    pub max_transfer_attempts: i32,
    pub batch_limit: i64,
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            global_minimum: Decimal::ZERO,
            max_transfer_attempts: 3,
            batch_limit: 500,
        }
    }
}

/// Result of one immediate transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferAttempt {
    Paid { transfer_id: String },
    Failed { error: String },
    /// Someone else settled the commission first.
    Superseded,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SweepReport {
    pub affiliates_paid: usize,
    pub commissions_paid: usize,
    pub amount_paid: Decimal,
    pub skipped: usize,
    pub failed: usize,
}

pub struct PayoutOrchestrator {
    store: Arc<dyn Store>,
    gateway: Option<Arc<dyn TransferGateway>>,
    queue: SideEffectQueue,
    config: PayoutConfig,
}

impl PayoutOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Option<Arc<dyn TransferGateway>>,
        queue: SideEffectQueue,
        config: PayoutConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            queue,
            config,
        }
    }

    pub fn transfers_enabled(&self) -> bool {
        self.gateway.is_some()
    }

    fn minimum_for(&self, affiliate: &Affiliate) -> Decimal {
        affiliate.minimum_payout.max(self.config.global_minimum)
    }

    /// Whether a fresh commission may be pushed immediately.
    pub fn auto_transfer_eligible(&self, affiliate: &Affiliate, amount: Decimal) -> bool {
        self.transfers_enabled()
            && affiliate.auto_transfer
            && affiliate.pix_key.as_deref().is_some_and(|k| !k.trim().is_empty())
            && amount >= self.minimum_for(affiliate)
    }

    /// One bounded attempt to pay a single pending commission. Failures are
    /// recorded on the commission and never propagated.
    #[instrument(skip_all, fields(commission_id = %commission.id, affiliate_id = %affiliate.id))]
    pub async fn transfer_commission(
        &self,
        commission: &AffiliateCommission,
        affiliate: &Affiliate,
        trigger: &str,
    ) -> Result<TransferAttempt, AppError> {
        let (Some(gateway), Some(pix_key)) = (&self.gateway, affiliate.pix_key.as_deref()) else {
            return Ok(TransferAttempt::Failed {
                error: "transfers not configured for affiliate".to_string(),
            });
        };

        let request = TransferRequest {
            idempotency_key: format!("commission-{}", commission.id),
            pix_key: pix_key.to_string(),
            amount: commission.commission_amount,
            currency: commission.currency.clone(),
            description: format!("Affiliate commission for order {}", commission.order_id),
        };

        match gateway.transfer(&request).await {
            Ok(receipt) => {
                let settled = self
                    .store
                    .settle_transfer(&TransferSettlement {
                        affiliate_id: affiliate.id,
                        commissions: std::slice::from_ref(commission),
                        expected: &[CommissionStatus::Pending],
                        transfer_id: &receipt.id,
                        currency: &commission.currency,
                        at: Utc::now(),
                    })
                    .await?;
                if settled.is_empty() {
                    warn!(transfer_id = %receipt.id, "Commission settled elsewhere before transfer completed");
                    return Ok(TransferAttempt::Superseded);
                }
                self.notify_payout(affiliate, settled.amount, &commission.currency, &receipt.id);
                record_payout(trigger, "success");
                record_commission(CommissionStatus::Paid.as_str());
                info!(transfer_id = %receipt.id, amount = %commission.commission_amount, "Commission transferred");
                Ok(TransferAttempt::Paid {
                    transfer_id: receipt.id,
                })
            }
            Err(e) => {
                let message = e.to_string();
                self.store
                    .record_transfer_failure(commission.id, &message)
                    .await?;
                record_payout(trigger, "failure");
                warn!(error = %message, "Commission transfer failed");
                Ok(TransferAttempt::Failed { error: message })
            }
        }
    }

    fn notify_payout(&self, affiliate: &Affiliate, amount: Decimal, currency: &str, transfer_id: &str) {
        self.queue.enqueue(SideEffect::PayoutSent {
            affiliate_id: affiliate.id,
            email: affiliate.email.clone(),
            amount,
            currency: currency.to_string(),
            transfer_id: transfer_id.to_string(),
        });
    }

    /// Pay every affiliate's approved commissions in one transfer each.
    #[instrument(skip(self))]
    pub async fn sweep(&self, trigger: &str) -> Result<SweepReport, AppError> {
        let mut report = SweepReport::default();
        let Some(gateway) = &self.gateway else {
            warn!("Payout sweep skipped: transfers are not configured");
            return Ok(report);
        };

        let approved = self
            .store
            .list_commissions(CommissionStatus::Approved, self.config.batch_limit)
            .await?;

        let mut by_affiliate: BTreeMap<(Uuid, String), Vec<AffiliateCommission>> = BTreeMap::new();
        for commission in approved {
            by_affiliate
                .entry((commission.affiliate_id, commission.currency.clone()))
                .or_default()
                .push(commission);
        }

        for ((affiliate_id, currency), mut commissions) in by_affiliate {
            let Some(affiliate) = self.store.get_affiliate(affiliate_id).await? else {
                warn!(affiliate_id = %affiliate_id, "Approved commissions for unknown affiliate");
                report.skipped += 1;
                continue;
            };
            let Some(pix_key) = affiliate.pix_key.clone().filter(|k| !k.trim().is_empty()) else {
                info!(affiliate_id = %affiliate_id, "Skipping payout: no PIX key");
                report.skipped += 1;
                continue;
            };

            let total: Decimal = commissions.iter().map(|c| c.commission_amount).sum();
            if total < self.minimum_for(&affiliate) {
                info!(affiliate_id = %affiliate_id, total = %total, "Skipping payout: below minimum");
                report.skipped += 1;
                continue;
            }

            commissions.sort_by_key(|c| c.id);
            let ids: Vec<String> = commissions.iter().map(|c| c.id.to_string()).collect();
            let request = TransferRequest {
                idempotency_key: format!("payout-{}", sha256_hex(ids.join(",").as_bytes())),
                pix_key,
                amount: total,
                currency: currency.clone(),
                description: format!("Affiliate payout ({} commissions)", commissions.len()),
            };

            match gateway.transfer(&request).await {
                Ok(receipt) => {
                    let settled = self
                        .store
                        .settle_transfer(&TransferSettlement {
                            affiliate_id,
                            commissions: &commissions,
                            expected: &[CommissionStatus::Approved],
                            transfer_id: &receipt.id,
                            currency: &currency,
                            at: Utc::now(),
                        })
                        .await?;
                    for _ in &settled.commission_ids {
                        record_commission(CommissionStatus::Paid.as_str());
                    }
                    report.commissions_paid += settled.commission_ids.len();
                    let paid_amount = settled.amount;
                    if !settled.is_empty() {
                        self.notify_payout(&affiliate, paid_amount, &currency, &receipt.id);
                    }
                    report.affiliates_paid += 1;
                    report.amount_paid += paid_amount;
                    record_payout(trigger, "success");
                    info!(
                        affiliate_id = %affiliate_id,
                        transfer_id = %receipt.id,
                        amount = %paid_amount,
                        "Consolidated payout sent"
                    );
                }
                Err(e) => {
                    let message = e.to_string();
                    for commission in &commissions {
                        self.store
                            .record_transfer_failure(commission.id, &message)
                            .await?;
                    }
                    report.failed += 1;
                    record_payout(trigger, "failure");
                    error!(affiliate_id = %affiliate_id, error = %message, "Consolidated payout failed");
                }
            }
        }

        Ok(report)
    }

    /// Retry automatic transfers that failed, up to the attempt limit.
    #[instrument(skip(self))]
    pub async fn retry_failed_transfers(&self) -> Result<SweepReport, AppError> {
        let mut report = SweepReport::default();
        if !self.transfers_enabled() {
            return Ok(report);
        }

        let retryable = self
            .store
            .list_retryable_transfers(self.config.max_transfer_attempts, self.config.batch_limit)
            .await?;

        for commission in retryable {
            let Some(affiliate) = self.store.get_affiliate(commission.affiliate_id).await? else {
                report.skipped += 1;
                continue;
            };
            if !self.auto_transfer_eligible(&affiliate, commission.commission_amount) {
                report.skipped += 1;
                continue;
            }
            match self.transfer_commission(&commission, &affiliate, "retry").await? {
                TransferAttempt::Paid { .. } => {
                    report.commissions_paid += 1;
                    report.amount_paid += commission.commission_amount;
                }
                TransferAttempt::Failed { .. } => report.failed += 1,
                TransferAttempt::Superseded => report.skipped += 1,
            }
        }
        Ok(report)
    }

    /// Release a commission held for review so the sweep can pay it.
    pub async fn approve(&self, commission_id: Uuid) -> Result<AffiliateCommission, AppError> {
        let commission = self
            .store
            .get_commission(commission_id)
            .await?
            .ok_or_else(|| not_found(commission_id))?;

        if !self.store.approve_commission(commission_id).await? {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "commission {} is {} and cannot be approved",
                commission_id,
                commission.status.as_str()
            )));
        }
        record_commission(CommissionStatus::Approved.as_str());
        info!(commission_id = %commission_id, "Commission approved");

        self.store
            .get_commission(commission_id)
            .await?
            .ok_or_else(|| not_found(commission_id))
    }
}

fn not_found(commission_id: Uuid) -> AppError {
    AppError::NotFound(anyhow::anyhow!("commission {} not found", commission_id))
}
