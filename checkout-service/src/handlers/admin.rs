//! Internal operations, guarded by the internal API key.

use crate::dtos::{CommissionListResponse, CommissionQuery};
use crate::models::{AffiliateCommission, CommissionStatus};
use crate::services::payout::SweepReport;
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

const DEFAULT_LIST_LIMIT: i64 = 100;
const MAX_LIST_LIMIT: i64 = 500;

pub async fn list_commissions(
    State(state): State<AppState>,
    Query(query): Query<CommissionQuery>,
) -> Result<Json<CommissionListResponse>, AppError> {
    let status = match query.status {
        Some(raw) => CommissionStatus::try_from(raw.to_ascii_lowercase())
            .map_err(|e| AppError::BadRequest(anyhow::Error::new(e)))?,
        None => CommissionStatus::Pending,
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let commissions = state.store.list_commissions(status, limit).await?;
    Ok(Json(CommissionListResponse {
        count: commissions.len(),
        commissions,
    }))
}

#[tracing::instrument(skip(state))]
pub async fn approve_commission(
    State(state): State<AppState>,
    Path(commission_id): Path<Uuid>,
) -> Result<Json<AffiliateCommission>, AppError> {
    let commission = state.payouts.approve(commission_id).await?;
    Ok(Json(commission))
}

#[tracing::instrument(skip(state))]
pub async fn run_payout_sweep(
    State(state): State<AppState>,
) -> Result<Json<SweepReport>, AppError> {
    if !state.payouts.transfers_enabled() {
        return Err(AppError::ServiceUnavailable);
    }
    let report = state.payouts.sweep("manual").await?;
    Ok(Json(report))
}

#[tracing::instrument(skip(state))]
pub async fn retry_failed_transfers(
    State(state): State<AppState>,
) -> Result<Json<SweepReport>, AppError> {
    if !state.payouts.transfers_enabled() {
        return Err(AppError::ServiceUnavailable);
    }
    let report = state.payouts.retry_failed_transfers().await?;
    Ok(Json(report))
}
