//! Global wallet processor adapter.
//!
//! Signature: `paypal-transmission-sig` is HMAC-SHA256 over
//! `"<transmission-id>|<transmission-time>|<webhook-id>|<sha256(body)>"`.

use super::{
    last_path_segment, string_or_number, Ingested, Ingestion, PaymentTransition, ProviderAdapter,
    ProviderError, SignatureSettings, WebhookRequest,
};
use crate::models::{to_minor_units, PaymentEvent, ProviderId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use service_core::utils::signature::{sha256_hex, verify_hmac_sha256};
use std::str::FromStr;
use tracing::debug;

pub const TRANSMISSION_ID_HEADER: &str = "paypal-transmission-id";
pub const TRANSMISSION_TIME_HEADER: &str = "paypal-transmission-time";
pub const TRANSMISSION_SIG_HEADER: &str = "paypal-transmission-sig";

pub struct PaypalAdapter {
    signature: SignatureSettings,
    webhook_id: String,
    tolerance_secs: i64,
}

impl PaypalAdapter {
    pub fn new(
        signature: SignatureSettings,
        webhook_id: impl Into<String>,
        tolerance_secs: i64,
    ) -> Self {
        Self {
            signature,
            webhook_id: webhook_id.into(),
            tolerance_secs,
        }
    }

    /// The string the transmission signature is computed over.
    pub fn signing_payload(
        transmission_id: &str,
        transmission_time: &str,
        webhook_id: &str,
        body: &[u8],
    ) -> String {
        format!(
            "{}|{}|{}|{}",
            transmission_id,
            transmission_time,
            webhook_id,
            sha256_hex(body)
        )
    }

    fn check_signature(&self, request: &WebhookRequest, secret: &str) -> Result<(), String> {
        let missing = |name: &str| format!("missing {} header", name);
        let id = request
            .header(TRANSMISSION_ID_HEADER)
            .ok_or_else(|| missing(TRANSMISSION_ID_HEADER))?;
        let time = request
            .header(TRANSMISSION_TIME_HEADER)
            .ok_or_else(|| missing(TRANSMISSION_TIME_HEADER))?;
        let sig = request
            .header(TRANSMISSION_SIG_HEADER)
            .ok_or_else(|| missing(TRANSMISSION_SIG_HEADER))?;

        let sent_at = DateTime::parse_from_rfc3339(time)
            .map_err(|e| format!("transmission time {:?}: {}", time, e))?;
        if (Utc::now().timestamp() - sent_at.timestamp()).abs() > self.tolerance_secs {
            return Err(format!("transmission time {} outside tolerance", time));
        }

        let payload = Self::signing_payload(id, time, &self.webhook_id, &request.body);
        match verify_hmac_sha256(secret, payload.as_bytes(), sig) {
            Ok(true) => Ok(()),
            Ok(false) => Err("transmission signature mismatch".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }
}

fn text(value: &Value, pointer: &str) -> Option<String> {
    value.pointer(pointer).and_then(string_or_number)
}

/// Capture id from the refund's `links[rel=up]` entry.
fn parent_capture_id(resource: &Value) -> Option<String> {
    resource
        .get("links")?
        .as_array()?
        .iter()
        .find(|link| link.get("rel").and_then(Value::as_str) == Some("up"))
        .and_then(|link| link.get("href").and_then(Value::as_str))
        .and_then(last_path_segment)
}

struct Extracted {
    payment_reference: Option<String>,
    provisional_reference: Option<String>,
    external_reference: Option<String>,
    amount: Option<Value>,
    status: String,
}

fn extract(event_type: &str, resource: &Value) -> Option<Extracted> {
    match event_type {
        "PAYMENT.CAPTURE.REFUNDED" | "PAYMENT.CAPTURE.REVERSED" => Some(Extracted {
            payment_reference: parent_capture_id(resource),
            provisional_reference: None,
            external_reference: text(resource, "/custom_id"),
            amount: resource.get("amount").cloned(),
            status: event_type
                .rsplit('.')
                .next()
                .unwrap_or("REFUNDED")
                .to_string(),
        }),
        t if t.starts_with("PAYMENT.CAPTURE.") => Some(Extracted {
            payment_reference: text(resource, "/id"),
            provisional_reference: text(resource, "/supplementary_data/related_ids/order_id"),
            external_reference: text(resource, "/custom_id")
                .or_else(|| text(resource, "/invoice_id")),
            amount: resource.get("amount").cloned(),
            status: text(resource, "/status").unwrap_or_else(|| "PENDING".to_string()),
        }),
        "CHECKOUT.ORDER.APPROVED" | "CHECKOUT.ORDER.COMPLETED" => {
            let unit = resource.pointer("/purchase_units/0").cloned().unwrap_or(Value::Null);
            let order_id = text(resource, "/id");
            Some(Extracted {
                payment_reference: text(&unit, "/payments/captures/0/id").or_else(|| order_id.clone()),
                provisional_reference: order_id,
                external_reference: text(&unit, "/custom_id")
                    .or_else(|| text(&unit, "/reference_id")),
                amount: unit.get("amount").cloned(),
                status: text(resource, "/status").unwrap_or_else(|| "APPROVED".to_string()),
            })
        }
        _ => None,
    }
}

/// `{currency_code, value}` with a decimal string value.
fn parse_amount(amount: Option<&Value>) -> Result<(i64, String), ProviderError> {
    let amount = amount.ok_or_else(|| ProviderError::Malformed("resource has no amount".into()))?;
    let currency = text(amount, "/currency_code")
        .ok_or_else(|| ProviderError::Malformed("amount has no currency_code".into()))?
        .to_ascii_uppercase();
    let value = text(amount, "/value")
        .ok_or_else(|| ProviderError::Malformed("amount has no value".into()))?;
    let value = Decimal::from_str(&value)
        .map_err(|e| ProviderError::Malformed(format!("amount value {:?}: {}", value, e)))?;
    let minor = to_minor_units(value)
        .ok_or_else(|| ProviderError::Malformed("amount out of range".into()))?;
    Ok((minor, currency))
}

#[async_trait]
impl ProviderAdapter for PaypalAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Paypal
    }

    async fn ingest(&self, request: &WebhookRequest) -> Result<Ingestion, ProviderError> {
        let verification = self
            .signature
            .verify(ProviderId::Paypal, |secret| self.check_signature(request, secret))?;

        let body = request.json()?;
        let event_id = text(&body, "/id")
            .or_else(|| request.header(TRANSMISSION_ID_HEADER).map(str::to_string))
            .ok_or_else(|| ProviderError::Malformed("event has no id".to_string()))?;
        let event_type = text(&body, "/event_type")
            .ok_or_else(|| ProviderError::Malformed("event has no event_type".to_string()))?;
        let resource = body.get("resource").cloned().unwrap_or(Value::Null);

        let Some(extracted) = extract(&event_type, &resource) else {
            debug!(event_id = %event_id, event_type = %event_type, "Ignoring non-payment event");
            return Ok(Ingestion {
                verification,
                outcome: Ingested::NoOp(event_type),
            });
        };

        let payment_reference = extracted.payment_reference.ok_or_else(|| {
            ProviderError::Malformed(format!("{} event has no payment reference", event_type))
        })?;
        let (amount_minor, currency) = parse_amount(extracted.amount.as_ref())?;

        Ok(Ingestion {
            verification,
            outcome: Ingested::Event(PaymentEvent {
                provider: ProviderId::Paypal,
                external_event_id: event_id,
                payment_reference,
                external_reference: extracted.external_reference,
                provisional_reference: extracted.provisional_reference,
                amount_minor,
                currency,
                provider_status: extracted.status,
                split_transfer_id: None,
                raw: body,
                received_at: Utc::now(),
            }),
        })
    }

    fn map_status(&self, provider_status: &str) -> PaymentTransition {
        match provider_status.to_ascii_uppercase().as_str() {
            "COMPLETED" => PaymentTransition::Complete,
            "PENDING" | "APPROVED" | "CREATED" => PaymentTransition::Hold,
            "DENIED" | "DECLINED" | "VOIDED" | "REVERSED" => PaymentTransition::Cancel,
            "REFUNDED" => PaymentTransition::Refund,
            // The capture keeps most of its value; reconcile by hand.
            "PARTIALLY_REFUNDED" => PaymentTransition::Hold,
            _ => PaymentTransition::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::providers::SignaturePolicy;
    use axum::http::{HeaderMap, HeaderValue};
    use service_core::utils::signature::hmac_sha256_hex;

    const SECRET: &str = "paypal-secret";
    const WEBHOOK_ID: &str = "WH-CONFIG-1";

    fn signed(body: &str, secret: &str) -> WebhookRequest {
        signed_at(body, secret, &Utc::now().to_rfc3339())
    }

    fn signed_at(body: &str, secret: &str, time: &str) -> WebhookRequest {
        let payload = PaypalAdapter::signing_payload("tx-1", time, WEBHOOK_ID, body.as_bytes());
        let sig = hmac_sha256_hex(secret, payload.as_bytes()).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(TRANSMISSION_ID_HEADER, HeaderValue::from_static("tx-1"));
        headers.insert(TRANSMISSION_TIME_HEADER, HeaderValue::from_str(time).unwrap());
        headers.insert(TRANSMISSION_SIG_HEADER, HeaderValue::from_str(&sig).unwrap());
        WebhookRequest {
            headers,
            body: body.as_bytes().to_vec().into(),
            ..Default::default()
        }
    }

    fn adapter() -> PaypalAdapter {
        PaypalAdapter::new(
            SignatureSettings::new(Some(SECRET.into()), SignaturePolicy::Strict),
            WEBHOOK_ID,
            300,
        )
    }

    fn event(ingestion: Ingestion) -> PaymentEvent {
        match ingestion.outcome {
            Ingested::Event(event) => event,
            Ingested::NoOp(topic) => panic!("expected event, got no-op {}", topic),
        }
    }

    #[tokio::test]
    async fn capture_completed_links_order_and_custom_id() {
        let body = r#"{"id":"WH-1","event_type":"PAYMENT.CAPTURE.COMPLETED","resource":{
            "id":"CAP-1","status":"COMPLETED","custom_id":"ORD-9",
            "amount":{"currency_code":"BRL","value":"90.00"},
            "supplementary_data":{"related_ids":{"order_id":"5O190127TN364715T"}}}}"#;
        let event = event(adapter().ingest(&signed(body, SECRET)).await.unwrap());
        assert_eq!(event.external_event_id, "WH-1");
        assert_eq!(event.payment_reference, "CAP-1");
        assert_eq!(event.provisional_reference.as_deref(), Some("5O190127TN364715T"));
        assert_eq!(event.external_reference.as_deref(), Some("ORD-9"));
        assert_eq!(event.amount_minor, 9000);
        assert_eq!(event.currency, "BRL");
    }

    #[tokio::test]
    async fn refund_resolves_capture_from_up_link() {
        let body = r#"{"id":"WH-2","event_type":"PAYMENT.CAPTURE.REFUNDED","resource":{
            "id":"REF-1","status":"COMPLETED","amount":{"currency_code":"USD","value":"10.5"},
            "links":[{"rel":"self","href":"https://api.paypal.com/v2/payments/refunds/REF-1"},
                     {"rel":"up","href":"https://api.paypal.com/v2/payments/captures/CAP-7"}]}}"#;
        let paypal = adapter();
        let event = event(paypal.ingest(&signed(body, SECRET)).await.unwrap());
        assert_eq!(event.payment_reference, "CAP-7");
        assert_eq!(event.amount_minor, 1050);
        assert_eq!(paypal.map_status(&event.provider_status), PaymentTransition::Refund);
    }

    #[tokio::test]
    async fn event_id_falls_back_to_transmission_id() {
        let body = r#"{"event_type":"PAYMENT.CAPTURE.PENDING","resource":{
            "id":"CAP-2","status":"PENDING","amount":{"currency_code":"BRL","value":"1.00"}}}"#;
        let event = event(adapter().ingest(&signed(body, SECRET)).await.unwrap());
        assert_eq!(event.external_event_id, "tx-1");
    }

    #[tokio::test]
    async fn tampered_body_is_rejected() {
        let body = r#"{"id":"WH-3","event_type":"PAYMENT.CAPTURE.COMPLETED","resource":{}}"#;
        let mut request = signed(body, SECRET);
        request.body = br#"{"id":"WH-3","event_type":"PAYMENT.CAPTURE.COMPLETED"}"#
            .to_vec()
            .into();
        let result = adapter().ingest(&request).await;
        assert!(matches!(result, Err(ProviderError::InvalidSignature(_))));
    }

    #[tokio::test]
    async fn replayed_transmission_is_rejected() {
        let body = r#"{"id":"WH-5","event_type":"PAYMENT.CAPTURE.COMPLETED","resource":{}}"#;
        let stale = (Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
        let result = adapter().ingest(&signed_at(body, SECRET, &stale)).await;
        assert!(matches!(result, Err(ProviderError::InvalidSignature(_))));

        let garbled = adapter().ingest(&signed_at(body, SECRET, "yesterday")).await;
        assert!(matches!(garbled, Err(ProviderError::InvalidSignature(_))));
    }

    #[tokio::test]
    async fn partially_refunded_capture_is_held() {
        let body = r#"{"id":"WH-6","event_type":"PAYMENT.CAPTURE.PARTIALLY_REFUNDED","resource":{
            "id":"CAP-8","status":"PARTIALLY_REFUNDED","custom_id":"ORD-9",
            "amount":{"currency_code":"BRL","value":"90.00"}}}"#;
        let paypal = adapter();
        let event = event(paypal.ingest(&signed(body, SECRET)).await.unwrap());
        assert_eq!(event.provider_status, "PARTIALLY_REFUNDED");
        assert_eq!(paypal.map_status(&event.provider_status), PaymentTransition::Hold);
    }

    #[tokio::test]
    async fn subscription_events_are_no_ops() {
        let body = r#"{"id":"WH-4","event_type":"BILLING.SUBSCRIPTION.CREATED","resource":{}}"#;
        let ingestion = adapter().ingest(&signed(body, SECRET)).await.unwrap();
        assert!(matches!(ingestion.outcome, Ingested::NoOp(_)));
    }

    #[test]
    fn status_table() {
        let paypal = adapter();
        assert_eq!(paypal.map_status("COMPLETED"), PaymentTransition::Complete);
        assert_eq!(paypal.map_status("APPROVED"), PaymentTransition::Hold);
        assert_eq!(paypal.map_status("DENIED"), PaymentTransition::Cancel);
        assert_eq!(paypal.map_status("REFUNDED"), PaymentTransition::Refund);
        assert_eq!(paypal.map_status("PARTIALLY_REFUNDED"), PaymentTransition::Hold);
        assert_eq!(paypal.map_status("ON_HOLD"), PaymentTransition::Unknown);
    }
}
