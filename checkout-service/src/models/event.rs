use super::{from_minor_units, UnknownVariant};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Payment providers with a webhook endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    /// Cards and PIX processor.
    Stripe,
    /// Global wallet processor.
    Paypal,
    /// Regional marketplace processor.
    Mercadopago,
}

impl ProviderId {
    pub const ALL: [ProviderId; 3] = [Self::Stripe, Self::Paypal, Self::Mercadopago];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::Paypal => "paypal",
            Self::Mercadopago => "mercadopago",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for ProviderId {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "stripe" => Ok(Self::Stripe),
            "paypal" => Ok(Self::Paypal),
            "mercadopago" => Ok(Self::Mercadopago),
            _ => Err(UnknownVariant::new("payment provider", value)),
        }
    }
}

/// Provider-agnostic view of one webhook delivery. Never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentEvent {
    pub provider: ProviderId,
    /// Provider-specific idempotency key for this delivery.
    pub external_event_id: String,
    /// The provider's final payment id.
    pub payment_reference: String,
    /// Reference we supplied at checkout (order number / order id).
    pub external_reference: Option<String>,
    /// Id issued before the payment existed (checkout session, preference, order).
    pub provisional_reference: Option<String>,
    pub amount_minor: i64,
    pub currency: String,
    pub provider_status: String,
    /// Set when the provider already routed the affiliate share at charge time.
    pub split_transfer_id: Option<String>,
    pub raw: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl PaymentEvent {
    pub fn amount(&self) -> Decimal {
        from_minor_units(self.amount_minor)
    }

    /// Key used by the idempotency guard.
    pub fn dedup_key(&self) -> String {
        format!("webhook:{}:{}", self.provider, self.external_event_id)
    }
}
