//! Regional marketplace processor adapter.
//!
//! Notifications only identify a payment; amount and status come from one
//! authoritative `GET /v1/payments/{id}`. Notifications arrive in several
//! shapes (webhooks v2, legacy IPN, query-string only), all handled here.

use super::{
    last_path_segment, string_or_number, Ingested, Ingestion, PaymentTransition, ProviderAdapter,
    ProviderError, SignatureSettings, WebhookRequest,
};
use crate::models::{to_minor_units, PaymentEvent, ProviderId};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde_json::Value;
use service_core::utils::signature::TimestampedSignature;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const SIGNATURE_HEADER: &str = "x-signature";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const PAYMENT_TOPIC: &str = "payment";

/// Authoritative view of a payment, from the lookup API.
#[derive(Debug, Clone)]
pub struct ProviderPayment {
    pub id: String,
    pub status: String,
    pub amount: Decimal,
    pub currency: String,
    pub external_reference: Option<String>,
    /// Preference id we stored on the order before the payment existed.
    pub preference_id: Option<String>,
    pub raw: Value,
}

impl ProviderPayment {
    pub fn from_json(raw: Value) -> Result<Self, ProviderError> {
        let field = |pointer: &str| raw.pointer(pointer).and_then(string_or_number);
        let id = field("/id").ok_or_else(|| ProviderError::Lookup("payment has no id".into()))?;
        let status =
            field("/status").ok_or_else(|| ProviderError::Lookup("payment has no status".into()))?;
        let amount = field("/transaction_amount")
            .and_then(|v| Decimal::from_str(&v).ok())
            .ok_or_else(|| ProviderError::Lookup("payment has no transaction_amount".into()))?;
        let currency = field("/currency_id")
            .ok_or_else(|| ProviderError::Lookup("payment has no currency_id".into()))?
            .to_ascii_uppercase();

        Ok(Self {
            id,
            status,
            amount,
            currency,
            external_reference: field("/external_reference"),
            preference_id: field("/metadata/preference_id"),
            raw: raw.clone(),
        })
    }
}

#[async_trait]
pub trait PaymentLookup: Send + Sync {
    async fn fetch_payment(&self, payment_id: &str) -> Result<ProviderPayment, ProviderError>;
}

/// Lookup client for `GET {api_url}/v1/payments/{id}`.
#[derive(Clone)]
pub struct HttpPaymentLookup {
    client: Client,
    api_url: String,
    access_token: Option<Secret<String>>,
}

impl HttpPaymentLookup {
    pub fn new(
        api_url: impl Into<String>,
        access_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, anyhow::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.filter(|t| !t.is_empty()).map(Secret::new),
        })
    }
}

#[async_trait]
impl PaymentLookup for HttpPaymentLookup {
    async fn fetch_payment(&self, payment_id: &str) -> Result<ProviderPayment, ProviderError> {
        let token = self
            .access_token
            .as_ref()
            .ok_or_else(|| ProviderError::Lookup("access token not configured".into()))?;

        let url = format!("{}/v1/payments/{}", self.api_url, payment_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(|e| ProviderError::Lookup(format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Lookup(format!("reading body failed: {}", e)))?;

        if !status.is_success() {
            return Err(ProviderError::Lookup(format!(
                "payment {} lookup returned {}: {}",
                payment_id, status, body
            )));
        }

        let raw: Value = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Lookup(format!("invalid payment JSON: {}", e)))?;
        ProviderPayment::from_json(raw)
    }
}

/// Topic and payment id pulled from a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Notification {
    topic: Option<String>,
    reference: Option<String>,
    /// Id as the signature manifest expects it.
    signed_id: Option<String>,
}

fn notification(request: &WebhookRequest, body: &Value) -> Notification {
    let query = |key: &str| {
        request
            .query
            .get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let topic = body
        .get("type")
        .or_else(|| body.get("topic"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            body.get("action")
                .and_then(Value::as_str)
                .and_then(|a| a.split('.').next())
                .map(str::to_string)
        })
        .or_else(|| query("type"))
        .or_else(|| query("topic"));

    let reference = body
        .pointer("/data/id")
        .and_then(string_or_number)
        .or_else(|| match body.get("resource") {
            Some(Value::String(resource)) => last_path_segment(resource),
            Some(other) => string_or_number(other),
            None => None,
        })
        .or_else(|| query("data.id"))
        .or_else(|| query("id"));

    let signed_id = query("data.id")
        .or_else(|| body.pointer("/data/id").and_then(string_or_number))
        .map(|id| id.to_ascii_lowercase());

    Notification {
        topic,
        reference,
        signed_id,
    }
}

/// `id:<data.id>;request-id:<x-request-id>;ts:<ts>;`, skipping absent parts.
pub fn signature_manifest(data_id: Option<&str>, request_id: Option<&str>, ts: &str) -> String {
    let mut manifest = String::new();
    if let Some(id) = data_id {
        manifest.push_str(&format!("id:{};", id));
    }
    if let Some(request_id) = request_id {
        manifest.push_str(&format!("request-id:{};", request_id));
    }
    manifest.push_str(&format!("ts:{};", ts));
    manifest
}

pub struct MercadoPagoAdapter {
    signature: SignatureSettings,
    lookup: Arc<dyn PaymentLookup>,
    tolerance_secs: i64,
}

impl MercadoPagoAdapter {
    pub fn new(
        signature: SignatureSettings,
        lookup: Arc<dyn PaymentLookup>,
        tolerance_secs: i64,
    ) -> Self {
        Self {
            signature,
            lookup,
            tolerance_secs,
        }
    }

    fn check_signature(
        &self,
        request: &WebhookRequest,
        note: &Notification,
        secret: &str,
    ) -> Result<(), String> {
        let header = request
            .header(SIGNATURE_HEADER)
            .ok_or_else(|| "missing x-signature header".to_string())?;
        let parsed = TimestampedSignature::parse(header);
        let ts = parsed
            .timestamp
            .clone()
            .ok_or_else(|| "x-signature has no ts".to_string())?;
        let sent_at = parsed
            .timestamp_secs()
            .map(ts_to_secs)
            .ok_or_else(|| format!("x-signature ts {} is not a number", ts))?;
        if (Utc::now().timestamp() - sent_at).abs() > self.tolerance_secs {
            return Err(format!("x-signature ts {} outside tolerance", ts));
        }

        let signed_id = note.signed_id.as_deref();
        let manifest = signature_manifest(signed_id, request.header(REQUEST_ID_HEADER), &ts);
        match parsed.matches(secret, manifest.as_bytes()) {
            Ok(true) => {}
            Ok(false) => return Err("x-signature mismatch".to_string()),
            Err(e) => return Err(e.to_string()),
        }

        // The signature only covers data.id; the payment fetched must be that one.
        if let (Some(signed), Some(reference)) = (signed_id, note.reference.as_deref())
            && !signed.eq_ignore_ascii_case(reference)
        {
            return Err(format!(
                "signed id {} does not match notified payment {}",
                signed, reference
            ));
        }
        Ok(())
    }
}

/// `ts` arrives in milliseconds; bare seconds are accepted too.
fn ts_to_secs(ts: i64) -> i64 {
    if ts > 100_000_000_000 { ts / 1000 } else { ts }
}

#[async_trait]
impl ProviderAdapter for MercadoPagoAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Mercadopago
    }

    async fn ingest(&self, request: &WebhookRequest) -> Result<Ingestion, ProviderError> {
        let body = request.json()?;
        let note = notification(request, &body);

        let verification = self.signature.verify(ProviderId::Mercadopago, |secret| {
            self.check_signature(request, &note, secret)
        })?;

        if let Some(topic) = note.topic.as_deref()
            && topic != PAYMENT_TOPIC
        {
            debug!(topic = %topic, "Ignoring non-payment notification");
            return Ok(Ingestion {
                verification,
                outcome: Ingested::NoOp(topic.to_string()),
            });
        }

        let payment_id = note.reference.ok_or_else(|| {
            ProviderError::Malformed("payment notification has no payment id".to_string())
        })?;

        let payment = self.lookup.fetch_payment(&payment_id).await?;
        info!(
            payment_id = %payment.id,
            status = %payment.status,
            "Fetched authoritative payment"
        );

        let amount_minor = to_minor_units(payment.amount)
            .ok_or_else(|| ProviderError::Lookup("payment amount out of range".into()))?;

        Ok(Ingestion {
            verification,
            outcome: Ingested::Event(PaymentEvent {
                provider: ProviderId::Mercadopago,
                external_event_id: format!("{}:{}", payment.id, payment.status),
                payment_reference: payment.id,
                external_reference: payment.external_reference,
                provisional_reference: payment.preference_id,
                amount_minor,
                currency: payment.currency,
                provider_status: payment.status,
                split_transfer_id: None,
                raw: payment.raw,
                received_at: Utc::now(),
            }),
        })
    }

    fn map_status(&self, provider_status: &str) -> PaymentTransition {
        match provider_status {
            "approved" | "authorized" => PaymentTransition::Complete,
            "pending" | "in_process" | "in_mediation" => PaymentTransition::Hold,
            "cancelled" | "rejected" | "expired" | "charged_back" => PaymentTransition::Cancel,
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
    use std::collections::HashMap;
    use std::sync::Mutex;

    const SECRET: &str = "mp-secret";

    struct FixedLookup {
        payment: Value,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PaymentLookup for FixedLookup {
        async fn fetch_payment(&self, payment_id: &str) -> Result<ProviderPayment, ProviderError> {
            self.calls.lock().unwrap().push(payment_id.to_string());
            ProviderPayment::from_json(self.payment.clone())
        }
    }

    fn lookup() -> Arc<FixedLookup> {
        Arc::new(FixedLookup {
            payment: serde_json::json!({
                "id": 123456, "status": "approved", "transaction_amount": 90.0,
                "currency_id": "BRL", "external_reference": "ORD-1",
                "metadata": {"preference_id": "pref-1"}
            }),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn adapter(lookup: Arc<FixedLookup>) -> MercadoPagoAdapter {
        MercadoPagoAdapter::new(
            SignatureSettings::new(Some(SECRET.into()), SignaturePolicy::Strict),
            lookup,
            300,
        )
    }

    fn request(body: &str, query: &[(&str, &str)], signed_id: Option<&str>) -> WebhookRequest {
        request_at(body, query, signed_id, Utc::now().timestamp_millis())
    }

    fn request_at(
        body: &str,
        query: &[(&str, &str)],
        signed_id: Option<&str>,
        ts: i64,
    ) -> WebhookRequest {
        let manifest = signature_manifest(signed_id, Some("req-1"), &ts.to_string());
        let sig = hmac_sha256_hex(SECRET, manifest.as_bytes()).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&format!("ts={},v1={}", ts, sig)).unwrap(),
        );
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-1"));
        WebhookRequest {
            headers,
            query: query
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            body: body.as_bytes().to_vec().into(),
        }
    }

    #[tokio::test]
    async fn webhook_v2_shape_fetches_payment() {
        let lookup = lookup();
        let mp = adapter(lookup.clone());
        let ingestion = mp
            .ingest(&request(
                r#"{"type":"payment","action":"payment.updated","data":{"id":"123456"}}"#,
                &[],
                Some("123456"),
            ))
            .await
            .unwrap();
        assert_eq!(ingestion.verification.as_str(), "verified");
        let Ingested::Event(event) = ingestion.outcome else {
            panic!("expected event");
        };
        assert_eq!(event.external_event_id, "123456:approved");
        assert_eq!(event.payment_reference, "123456");
        assert_eq!(event.amount_minor, 9000);
        assert_eq!(event.provisional_reference.as_deref(), Some("pref-1"));
        assert_eq!(*lookup.calls.lock().unwrap(), vec!["123456".to_string()]);
    }

    #[tokio::test]
    async fn legacy_ipn_resource_url_and_number() {
        let lookup = lookup();
        let mp = adapter(lookup.clone());
        mp.ingest(&request(
            r#"{"resource":"https://api.mercadolibre.com/collections/notifications/777","topic":"payment"}"#,
            &[],
            None,
        ))
        .await
        .unwrap();
        mp.ingest(&request(r#"{"resource":"888","topic":"payment"}"#, &[], None))
            .await
            .unwrap();
        assert_eq!(*lookup.calls.lock().unwrap(), vec!["777", "888"]);
    }

    #[tokio::test]
    async fn query_string_only_shapes() {
        let lookup = lookup();
        let mp = adapter(lookup.clone());
        mp.ingest(&request("", &[("topic", "payment"), ("id", "55")], None))
            .await
            .unwrap();
        mp.ingest(&request("", &[("type", "payment"), ("data.id", "66")], Some("66")))
            .await
            .unwrap();
        assert_eq!(*lookup.calls.lock().unwrap(), vec!["55", "66"]);
    }

    #[tokio::test]
    async fn merchant_order_topic_is_a_no_op() {
        let lookup = lookup();
        let mp = adapter(lookup.clone());
        let ingestion = mp
            .ingest(&request(
                r#"{"resource":"https://api.mercadolibre.com/merchant_orders/1","topic":"merchant_order"}"#,
                &[],
                None,
            ))
            .await
            .unwrap();
        assert!(matches!(ingestion.outcome, Ingested::NoOp(ref t) if t == "merchant_order"));
        assert!(lookup.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn payment_topic_without_id_is_malformed() {
        let result = adapter(lookup())
            .ingest(&request(r#"{"type":"payment","data":{}}"#, &[], None))
            .await;
        assert!(matches!(result, Err(ProviderError::Malformed(_))));
    }

    #[tokio::test]
    async fn forged_signature_is_rejected_before_lookup() {
        let lookup = lookup();
        let req = request(r#"{"type":"payment","data":{"id":"1"}}"#, &[], Some("2"));
        let result = adapter(lookup.clone()).ingest(&req).await;
        assert!(matches!(result, Err(ProviderError::InvalidSignature(_))));
        assert!(lookup.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn signed_id_must_match_the_looked_up_payment() {
        let lookup = lookup();
        let req = request(
            r#"{"type":"payment","data":{"id":"999"}}"#,
            &[("data.id", "123456")],
            Some("123456"),
        );
        let result = adapter(lookup.clone()).ingest(&req).await;
        assert!(matches!(result, Err(ProviderError::InvalidSignature(_))));
        assert!(lookup.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_signature_timestamp_is_rejected() {
        let body = r#"{"type":"payment","data":{"id":"123456"}}"#;
        let hour_ago = Utc::now().timestamp_millis() - 3_600_000;
        let result = adapter(lookup())
            .ingest(&request_at(body, &[], Some("123456"), hour_ago))
            .await;
        assert!(matches!(result, Err(ProviderError::InvalidSignature(_))));

        let in_seconds = Utc::now().timestamp();
        adapter(lookup())
            .ingest(&request_at(body, &[], Some("123456"), in_seconds))
            .await
            .unwrap();
    }

    #[test]
    fn manifest_omits_missing_parts() {
        assert_eq!(
            signature_manifest(Some("abc"), Some("r"), "1"),
            "id:abc;request-id:r;ts:1;"
        );
        assert_eq!(signature_manifest(None, None, "1"), "ts:1;");
    }

    #[test]
    fn status_table() {
        let mp = adapter(lookup());
        assert_eq!(mp.map_status("approved"), PaymentTransition::Complete);
        assert_eq!(mp.map_status("in_mediation"), PaymentTransition::Hold);
        assert_eq!(mp.map_status("charged_back"), PaymentTransition::Cancel);
        assert_eq!(mp.map_status("refunded"), PaymentTransition::Refund);
        assert_eq!(mp.map_status("unknown_state"), PaymentTransition::Unknown);
    }
}
