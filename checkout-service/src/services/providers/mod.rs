//! Payment provider adapters.
//!
//! Each adapter authenticates a raw webhook delivery and turns it into a
//! canonical [`PaymentEvent`], or a no-op for topics that carry no payment.
//! Signature failures go through the provider's [`SignaturePolicy`].

pub mod mercadopago;
pub mod paypal;
pub mod stripe;

pub use mercadopago::{HttpPaymentLookup, MercadoPagoAdapter, PaymentLookup, ProviderPayment};
pub use paypal::PaypalAdapter;
pub use stripe::StripeAdapter;

use crate::models::{OrderStatus, PaymentEvent, ProviderId};
use crate::services::metrics;
use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::HeaderMap;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use service_core::error::AppError;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// A webhook delivery as received over HTTP.
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
    pub body: Bytes,
}

impl WebhookRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn json(&self) -> Result<serde_json::Value, ProviderError> {
        if self.body.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(&self.body)
            .map_err(|e| ProviderError::Malformed(format!("body is not JSON: {}", e)))
    }
}

/// What to do when a signature does not verify.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignaturePolicy {
    /// Reject the delivery with 401.
    #[default]
    Strict,
    /// Log, count and continue.
    Tolerant,
}

impl SignaturePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Tolerant => "tolerant",
        }
    }
}

impl FromStr for SignaturePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "tolerant" => Ok(Self::Tolerant),
            other => Err(format!("unknown signature policy: {}", other)),
        }
    }
}

/// How a delivery was authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Verified,
    /// No secret configured.
    Skipped,
    /// Failed, but the provider is configured as tolerant.
    Failed(String),
}

impl Verification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Skipped => "skipped",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Ingested {
    Event(PaymentEvent),
    /// Authentic delivery with nothing to reconcile (non-payment topic).
    NoOp(String),
}

#[derive(Debug, Clone)]
pub struct Ingestion {
    pub verification: Verification,
    pub outcome: Ingested,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("payment lookup failed: {0}")]
    Lookup(String),
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidSignature(msg) => {
                AppError::Unauthorized(anyhow::anyhow!("invalid webhook signature: {}", msg))
            }
            ProviderError::Malformed(msg) => {
                AppError::BadRequest(anyhow::anyhow!("malformed webhook payload: {}", msg))
            }
            ProviderError::Lookup(msg) => AppError::UpstreamError(msg),
        }
    }
}

/// Order state a provider status asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentTransition {
    Complete,
    /// Still in flight; leave the order as it is.
    Hold,
    Cancel,
    Refund,
    Unknown,
}

impl PaymentTransition {
    pub fn target(&self) -> Option<OrderStatus> {
        match self {
            Self::Complete => Some(OrderStatus::Completed),
            Self::Cancel => Some(OrderStatus::Cancelled),
            Self::Refund => Some(OrderStatus::Refunded),
            Self::Hold | Self::Unknown => None,
        }
    }
}

impl fmt::Display for PaymentTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Complete => "complete",
            Self::Hold => "hold",
            Self::Cancel => "cancel",
            Self::Refund => "refund",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> ProviderId;

    async fn ingest(&self, request: &WebhookRequest) -> Result<Ingestion, ProviderError>;

    fn map_status(&self, provider_status: &str) -> PaymentTransition;
}

/// Signing material shared by every adapter.
#[derive(Clone)]
pub struct SignatureSettings {
    pub secret: Option<Secret<String>>,
    pub policy: SignaturePolicy,
}

impl SignatureSettings {
    pub fn new(secret: Option<String>, policy: SignaturePolicy) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()).map(Secret::new),
            policy,
        }
    }

    /// Run `check` with the configured secret and apply the policy.
    ///
    /// `check` returns `Ok(())` when the signature is valid and `Err(reason)`
    /// otherwise.
    pub fn verify<F>(&self, provider: ProviderId, check: F) -> Result<Verification, ProviderError>
    where
        F: FnOnce(&str) -> Result<(), String>,
    {
        let Some(secret) = &self.secret else {
            warn!(
                provider = %provider,
                "Webhook secret not configured, signature verification skipped"
            );
            return Ok(Verification::Skipped);
        };

        match check(secret.expose_secret()) {
            Ok(()) => Ok(Verification::Verified),
            Err(reason) => {
                metrics::record_signature_failure(provider.as_str(), self.policy.as_str());
                match self.policy {
                    SignaturePolicy::Strict => {
                        warn!(provider = %provider, reason = %reason, "Webhook signature rejected");
                        Err(ProviderError::InvalidSignature(reason))
                    }
                    SignaturePolicy::Tolerant => {
                        warn!(
                            provider = %provider,
                            reason = %reason,
                            "Webhook signature invalid, continuing under tolerant policy"
                        );
                        Ok(Verification::Failed(reason))
                    }
                }
            }
        }
    }
}

/// Last non-empty path segment of a URL-ish string.
pub(crate) fn last_path_segment(value: &str) -> Option<String> {
    let without_query = value.split(['?', '#']).next().unwrap_or(value);
    without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// A JSON value that may be a string or a number, as a string.
pub(crate) fn string_or_number(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
