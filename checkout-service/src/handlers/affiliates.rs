use crate::dtos::{ClickRequest, ClickResponse};
use crate::startup::AppState;
use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use service_core::error::AppError;
use service_core::middleware::rate_limit::forwarded_ip;
use std::net::SocketAddr;
use validator::Validate;

/// Record a referral click. The client IP feeds the fraud scorer later.
pub async fn record_click(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<ClickRequest>,
) -> Result<(StatusCode, Json<ClickResponse>), AppError> {
    request.validate()?;

    let ip = forwarded_ip(&headers)
        .or_else(|| peer.map(|ConnectInfo(addr)| addr.ip()))
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let click = state
        .checkout
        .attribution()
        .record_click(&request.code, request.link_id, &ip)
        .await?;

    tracing::info!(
        click_id = %click.id,
        affiliate_id = %click.affiliate_id,
        "Referral click recorded"
    );

    Ok((
        StatusCode::CREATED,
        Json(ClickResponse {
            click_id: click.id,
            affiliate_id: click.affiliate_id,
            created_at: click.created_at,
        }),
    ))
}
