use crate::dtos::{CheckoutRequest, CheckoutResponse};
use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, Json};
use service_core::error::AppError;
use validator::Validate;

/// Price a cart and create the pending order the provider will settle.
#[tracing::instrument(skip(state, request))]
pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutResponse>), AppError> {
    request.validate()?;

    let finalized = state.checkout.finalize_order(request.into()).await?;

    Ok((StatusCode::CREATED, Json(finalized.into())))
}
