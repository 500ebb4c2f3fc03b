use crate::error::AppError;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

pub const INTERNAL_API_KEY_HEADER: &str = "x-internal-api-key";

/// Expected key for internal/admin routes.
#[derive(Clone)]
pub struct InternalApiKey(pub String);

pub async fn require_internal_api_key(
    State(expected): State<InternalApiKey>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let provided = request
        .headers()
        .get(INTERNAL_API_KEY_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    let matches = !expected.0.is_empty()
        && provided.len() == expected.0.len()
        && bool::from(provided.as_bytes().ct_eq(expected.0.as_bytes()));

    if !matches {
        tracing::warn!(path = %request.uri().path(), "Rejected internal request with bad api key");
        return Err(AppError::Unauthorized(anyhow::anyhow!("invalid internal api key")));
    }

    Ok(next.run(request).await)
}
