//! Cards/PIX processor adapter.
//!
//! Deliveries carry the full event object. Authenticity is the
//! `Stripe-Signature: t=<ts>,v1=<hex>` header over `"<ts>.<raw body>"`.

use super::{
    string_or_number, Ingested, Ingestion, PaymentTransition, ProviderAdapter, ProviderError,
    SignatureSettings, WebhookRequest,
};
use crate::models::{PaymentEvent, ProviderId};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use service_core::utils::signature::TimestampedSignature;
use tracing::debug;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

pub struct StripeAdapter {
    signature: SignatureSettings,
    tolerance_secs: i64,
}

impl StripeAdapter {
    pub fn new(signature: SignatureSettings, tolerance_secs: i64) -> Self {
        Self {
            signature,
            tolerance_secs,
        }
    }

    fn check_signature(&self, request: &WebhookRequest, secret: &str) -> Result<(), String> {
        let header = request
            .header(SIGNATURE_HEADER)
            .ok_or_else(|| "missing Stripe-Signature header".to_string())?;
        let parsed = TimestampedSignature::parse(header);
        let timestamp = parsed
            .timestamp_secs()
            .ok_or_else(|| "signature header has no timestamp".to_string())?;
        if parsed.signatures.is_empty() {
            return Err("signature header has no v1 entry".to_string());
        }
        if (Utc::now().timestamp() - timestamp).abs() > self.tolerance_secs {
            return Err(format!("timestamp {} outside tolerance", timestamp));
        }

        let mut payload = format!("{}.", timestamp).into_bytes();
        payload.extend_from_slice(&request.body);
        match parsed.matches(secret, &payload) {
            Ok(true) => Ok(()),
            Ok(false) => Err("no v1 signature matched".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }
}

fn text(value: &Value, pointer: &str) -> Option<String> {
    value.pointer(pointer).and_then(string_or_number)
}

/// Fields pulled from the event object, by event family.
struct Extracted {
    payment_reference: Option<String>,
    provisional_reference: Option<String>,
    external_reference: Option<String>,
    amount_minor: Option<i64>,
    status: String,
    split_transfer_id: Option<String>,
}

fn extract(event_type: &str, object: &Value) -> Option<Extracted> {
    let int_field = |keys: &[&str]| keys.iter().find_map(|k| object.get(*k)?.as_i64());
    let order_ref = text(object, "/metadata/order_id");

    if let Some(kind) = event_type.strip_prefix("payment_intent.") {
        // A declined attempt leaves the intent open for another payment method.
        let status = match kind {
            "payment_failed" => "payment_failed".to_string(),
            _ => text(object, "/status").unwrap_or_else(|| kind.to_string()),
        };
        return Some(Extracted {
            payment_reference: text(object, "/id"),
            provisional_reference: None,
            external_reference: order_ref,
            amount_minor: int_field(&["amount_received"])
                .filter(|a| *a > 0)
                .or_else(|| int_field(&["amount"])),
            status,
            split_transfer_id: text(object, "/transfer")
                .or_else(|| text(object, "/latest_charge/transfer")),
        });
    }

    if let Some(kind) = event_type.strip_prefix("checkout.session.") {
        let session_id = text(object, "/id");
        let status = match kind {
            "expired" => "expired".to_string(),
            "async_payment_failed" => "failed".to_string(),
            "async_payment_succeeded" => "paid".to_string(),
            _ => text(object, "/payment_status").unwrap_or_else(|| "unpaid".to_string()),
        };
        return Some(Extracted {
            payment_reference: text(object, "/payment_intent").or_else(|| session_id.clone()),
            provisional_reference: session_id,
            external_reference: text(object, "/client_reference_id").or(order_ref),
            amount_minor: int_field(&["amount_total"]),
            status,
            split_transfer_id: None,
        });
    }

    match event_type {
        "charge.refunded" => {
            let amount = int_field(&["amount"]);
            let refunded = int_field(&["amount_refunded"]);
            let full = object.get("refunded").and_then(Value::as_bool) == Some(true)
                || matches!((amount, refunded), (Some(a), Some(r)) if r >= a);
            Some(Extracted {
                payment_reference: text(object, "/payment_intent")
                    .or_else(|| text(object, "/id")),
                provisional_reference: None,
                external_reference: order_ref,
                amount_minor: refunded.or(amount),
                status: if full { "refunded" } else { "partially_refunded" }.to_string(),
                split_transfer_id: None,
            })
        }
        "charge.dispute.created" => Some(Extracted {
            payment_reference: text(object, "/payment_intent").or_else(|| text(object, "/charge")),
            provisional_reference: None,
            external_reference: order_ref,
            amount_minor: int_field(&["amount"]),
            status: "charged_back".to_string(),
            split_transfer_id: None,
        }),
        _ => None,
    }
}

#[async_trait]
impl ProviderAdapter for StripeAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Stripe
    }

    async fn ingest(&self, request: &WebhookRequest) -> Result<Ingestion, ProviderError> {
        let verification = self
            .signature
            .verify(ProviderId::Stripe, |secret| self.check_signature(request, secret))?;

        let body = request.json()?;
        let event_id = text(&body, "/id")
            .ok_or_else(|| ProviderError::Malformed("event has no id".to_string()))?;
        let event_type = text(&body, "/type")
            .ok_or_else(|| ProviderError::Malformed("event has no type".to_string()))?;
        let object = body.pointer("/data/object").cloned().unwrap_or(Value::Null);

        let Some(extracted) = extract(&event_type, &object) else {
            debug!(event_id = %event_id, event_type = %event_type, "Ignoring non-payment event");
            return Ok(Ingestion {
                verification,
                outcome: Ingested::NoOp(event_type),
            });
        };

        let payment_reference = extracted.payment_reference.ok_or_else(|| {
            ProviderError::Malformed(format!("{} event has no payment reference", event_type))
        })?;
        let currency = text(&object, "/currency")
            .map(|c| c.to_ascii_uppercase())
            .ok_or_else(|| ProviderError::Malformed("event object has no currency".to_string()))?;

        Ok(Ingestion {
            verification,
            outcome: Ingested::Event(PaymentEvent {
                provider: ProviderId::Stripe,
                external_event_id: event_id,
                payment_reference,
                external_reference: extracted.external_reference,
                provisional_reference: extracted.provisional_reference,
                amount_minor: extracted.amount_minor.unwrap_or(0),
                currency,
                provider_status: extracted.status,
                split_transfer_id: extracted.split_transfer_id,
                raw: body,
                received_at: Utc::now(),
            }),
        })
    }

    fn map_status(&self, provider_status: &str) -> PaymentTransition {
        match provider_status {
            "succeeded" | "paid" => PaymentTransition::Complete,
            "processing" | "requires_action" | "requires_payment_method" | "payment_failed"
            | "unpaid" | "partially_refunded" => PaymentTransition::Hold,
            "canceled" | "failed" | "expired" | "charged_back" => PaymentTransition::Cancel,
            "refunded" => PaymentTransition::Refund,
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

    const SECRET: &str = "whsec_test";

    fn signed(body: &str, secret: &str, timestamp: i64) -> WebhookRequest {
        let signature =
            hmac_sha256_hex(secret, format!("{}.{}", timestamp, body).as_bytes()).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&format!("t={},v1={}", timestamp, signature)).unwrap(),
        );
        WebhookRequest {
            headers,
            body: body.as_bytes().to_vec().into(),
            ..Default::default()
        }
    }

    fn adapter(policy: SignaturePolicy) -> StripeAdapter {
        StripeAdapter::new(SignatureSettings::new(Some(SECRET.into()), policy), 300)
    }

    fn event(ingestion: Ingestion) -> PaymentEvent {
        match ingestion.outcome {
            Ingested::Event(event) => event,
            Ingested::NoOp(topic) => panic!("expected event, got no-op {}", topic),
        }
    }

    #[tokio::test]
    async fn checkout_session_carries_provisional_and_final_ids() {
        let body = r#"{"id":"evt_1","type":"checkout.session.completed","data":{"object":{
            "id":"cs_test_1","payment_intent":"pi_1","client_reference_id":"ORD-7",
            "amount_total":9000,"currency":"brl","payment_status":"paid"}}}"#;
        let ingestion = adapter(SignaturePolicy::Strict)
            .ingest(&signed(body, SECRET, Utc::now().timestamp()))
            .await
            .unwrap();
        assert_eq!(ingestion.verification.as_str(), "verified");

        let event = event(ingestion);
        assert_eq!(event.external_event_id, "evt_1");
        assert_eq!(event.payment_reference, "pi_1");
        assert_eq!(event.provisional_reference.as_deref(), Some("cs_test_1"));
        assert_eq!(event.external_reference.as_deref(), Some("ORD-7"));
        assert_eq!(event.amount_minor, 9000);
        assert_eq!(event.currency, "BRL");
        assert_eq!(event.provider_status, "paid");
    }

    #[tokio::test]
    async fn declined_payment_intent_stays_open() {
        let body = r#"{"id":"evt_2","type":"payment_intent.payment_failed","data":{"object":{
            "id":"pi_2","amount":5000,"currency":"usd","status":"requires_payment_method"}}}"#;
        let stripe = adapter(SignaturePolicy::Strict);
        let event = event(
            stripe
                .ingest(&signed(body, SECRET, Utc::now().timestamp()))
                .await
                .unwrap(),
        );
        assert_eq!(event.provider_status, "payment_failed");
        assert_eq!(stripe.map_status(&event.provider_status), PaymentTransition::Hold);
        assert_eq!(stripe.map_status("canceled"), PaymentTransition::Cancel);
    }

    #[tokio::test]
    async fn partial_charge_refund_is_held() {
        let body = r#"{"id":"evt_8","type":"charge.refunded","data":{"object":{
            "id":"ch_8","payment_intent":"pi_8","amount":10000,"amount_refunded":2500,
            "refunded":false,"currency":"brl"}}}"#;
        let stripe = adapter(SignaturePolicy::Strict);
        let partial = event(
            stripe
                .ingest(&signed(body, SECRET, Utc::now().timestamp()))
                .await
                .unwrap(),
        );
        assert_eq!(partial.provider_status, "partially_refunded");
        assert_eq!(partial.amount_minor, 2500);
        assert_eq!(stripe.map_status(&partial.provider_status), PaymentTransition::Hold);

        let body = r#"{"id":"evt_9","type":"charge.refunded","data":{"object":{
            "id":"ch_8","payment_intent":"pi_8","amount":10000,"amount_refunded":10000,
            "refunded":true,"currency":"brl"}}}"#;
        let full = event(
            stripe
                .ingest(&signed(body, SECRET, Utc::now().timestamp()))
                .await
                .unwrap(),
        );
        assert_eq!(full.provider_status, "refunded");
        assert_eq!(stripe.map_status(&full.provider_status), PaymentTransition::Refund);
    }

    #[tokio::test]
    async fn destination_charge_reports_split_transfer() {
        let body = r#"{"id":"evt_3","type":"payment_intent.succeeded","data":{"object":{
            "id":"pi_3","amount":10000,"amount_received":10000,"currency":"brl",
            "status":"succeeded","latest_charge":{"id":"ch_3","transfer":"tr_9"}}}}"#;
        let event = event(
            adapter(SignaturePolicy::Strict)
                .ingest(&signed(body, SECRET, Utc::now().timestamp()))
                .await
                .unwrap(),
        );
        assert_eq!(event.split_transfer_id.as_deref(), Some("tr_9"));
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected_when_strict() {
        let body = r#"{"id":"evt_4","type":"payment_intent.succeeded","data":{"object":{}}}"#;
        let result = adapter(SignaturePolicy::Strict)
            .ingest(&signed(body, "whsec_other", Utc::now().timestamp()))
            .await;
        assert!(matches!(result, Err(ProviderError::InvalidSignature(_))));
    }

    #[tokio::test]
    async fn stale_timestamp_is_rejected() {
        let body = r#"{"id":"evt_5","type":"payment_intent.succeeded","data":{"object":{}}}"#;
        let result = adapter(SignaturePolicy::Strict)
            .ingest(&signed(body, SECRET, Utc::now().timestamp() - 3600))
            .await;
        assert!(matches!(result, Err(ProviderError::InvalidSignature(_))));
    }

    #[tokio::test]
    async fn unrelated_event_types_are_no_ops() {
        let body = r#"{"id":"evt_6","type":"customer.created","data":{"object":{"id":"cus_1"}}}"#;
        let ingestion = adapter(SignaturePolicy::Strict)
            .ingest(&signed(body, SECRET, Utc::now().timestamp()))
            .await
            .unwrap();
        assert!(matches!(ingestion.outcome, Ingested::NoOp(ref t) if t == "customer.created"));
    }

    #[tokio::test]
    async fn payment_event_without_reference_is_malformed() {
        let body = r#"{"id":"evt_7","type":"charge.dispute.created","data":{"object":{
            "amount":100,"currency":"brl"}}}"#;
        let result = adapter(SignaturePolicy::Strict)
            .ingest(&signed(body, SECRET, Utc::now().timestamp()))
            .await;
        assert!(matches!(result, Err(ProviderError::Malformed(_))));
    }

    #[test]
    fn status_table() {
        let stripe = adapter(SignaturePolicy::Strict);
        assert_eq!(stripe.map_status("succeeded"), PaymentTransition::Complete);
        assert_eq!(stripe.map_status("processing"), PaymentTransition::Hold);
        assert_eq!(stripe.map_status("requires_payment_method"), PaymentTransition::Hold);
        assert_eq!(stripe.map_status("charged_back"), PaymentTransition::Cancel);
        assert_eq!(stripe.map_status("refunded"), PaymentTransition::Refund);
        assert_eq!(stripe.map_status("mystery"), PaymentTransition::Unknown);
    }
}
