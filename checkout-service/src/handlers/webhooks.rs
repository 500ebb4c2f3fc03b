//! Provider webhook endpoints.
//!
//! Every delivery that authenticates and parses is acknowledged with 200 and
//! the pipeline outcome, including outcomes that changed nothing. Providers
//! only retry on 401, 400 and 5xx.

use crate::dtos::WebhookAck;
use crate::models::ProviderId;
use crate::services::providers::WebhookRequest;
use crate::startup::AppState;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use service_core::error::AppError;
use std::collections::HashMap;

pub async fn stripe(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, AppError> {
    receive(&state, ProviderId::Stripe, headers, query, body).await
}

pub async fn paypal(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, AppError> {
    receive(&state, ProviderId::Paypal, headers, query, body).await
}

pub async fn mercadopago(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, AppError> {
    receive(&state, ProviderId::Mercadopago, headers, query, body).await
}

async fn receive(
    state: &AppState,
    provider: ProviderId,
    headers: HeaderMap,
    query: HashMap<String, String>,
    body: Bytes,
) -> Result<Json<WebhookAck>, AppError> {
    tracing::debug!(provider = %provider, bytes = body.len(), "Webhook received");

    let request = WebhookRequest {
        headers,
        query,
        body,
    };
    let outcome = state.webhooks.handle(provider, &request).await?;

    Ok(Json(WebhookAck::new(outcome)))
}
