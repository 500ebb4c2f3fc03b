#![allow(dead_code)]

use checkout_service::config::{
    CheckoutConfig, CurrencyConfig, MercadoPagoConfig, NotificationSettings, PaypalConfig,
    PayoutSettings, StripeConfig,
};
use checkout_service::models::{Affiliate, AffiliateStatus, AffiliateType, Coupon, CouponKind};
use checkout_service::services::providers::mercadopago::{
    signature_manifest, REQUEST_ID_HEADER, SIGNATURE_HEADER as MERCADOPAGO_SIGNATURE_HEADER,
};
use checkout_service::services::providers::paypal::{
    PaypalAdapter, TRANSMISSION_ID_HEADER, TRANSMISSION_SIG_HEADER, TRANSMISSION_TIME_HEADER,
};
use checkout_service::services::providers::stripe::SIGNATURE_HEADER as STRIPE_SIGNATURE_HEADER;
use checkout_service::services::providers::SignaturePolicy;
use checkout_service::services::resolver::ResolverConfig;
use checkout_service::services::InMemoryStore;
use checkout_service::Application;
use once_cell::sync::Lazy;
use reqwest::{Client, Response};
use rust_decimal::Decimal;
use secrecy::Secret;
use serde_json::Value;
use service_core::config::Config;
use service_core::middleware::admin_auth::INTERNAL_API_KEY_HEADER;
use service_core::utils::signature::hmac_sha256_hex;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::MockServer;

pub const STRIPE_SECRET: &str = "whsec_test_secret";
pub const PAYPAL_SECRET: &str = "paypal_test_secret";
pub const PAYPAL_WEBHOOK_ID: &str = "WH-TEST-0001";
pub const MERCADOPAGO_SECRET: &str = "mp_test_secret";
pub const MERCADOPAGO_TOKEN: &str = "mp-access-token";
pub const PAYOUT_TOKEN: &str = "payout-token";
pub const API_KEY: &str = "test-internal-key";

/// Set `TEST_LOG=1` to see service logs in test output.
static TRACING: Lazy<()> = Lazy::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
            .with_test_writer()
            .try_init();
    }
});

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub store: InMemoryStore,
    pub client: Client,
    /// Stands in for the payment lookup, exchange-rate and transfer APIs.
    pub upstream: MockServer,
    shutdown: CancellationToken,
}

pub fn test_config(upstream: &str) -> CheckoutConfig {
    let secret = |value: &str| Some(Secret::new(value.to_string()));
    CheckoutConfig {
        common: Config {
            port: 0, // Random port
            environment: "test".to_string(),
        },
        service_name: "checkout-service-test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: None,
        redis_url: None,
        dedup_ttl_secs: 60,
        internal_api_key: Secret::new(API_KEY.to_string()),
        clicks_per_minute: 60,
        stripe: StripeConfig {
            webhook_secret: secret(STRIPE_SECRET),
            signature_policy: SignaturePolicy::Strict,
            tolerance_secs: 300,
        },
        paypal: PaypalConfig {
            webhook_secret: secret(PAYPAL_SECRET),
            webhook_id: PAYPAL_WEBHOOK_ID.to_string(),
            signature_policy: SignaturePolicy::Strict,
            tolerance_secs: 300,
        },
        mercadopago: MercadoPagoConfig {
            webhook_secret: secret(MERCADOPAGO_SECRET),
            signature_policy: SignaturePolicy::Strict,
            tolerance_secs: 300,
            api_url: upstream.to_string(),
            access_token: secret(MERCADOPAGO_TOKEN),
            timeout_ms: 2000,
        },
        resolver: ResolverConfig::default(),
        currency: CurrencyConfig {
            rates_url: upstream.to_string(),
            timeout_ms: 2000,
            cache_ttl_secs: 600,
        },
        fraud_threshold: 50,
        payouts: PayoutSettings {
            api_url: Some(upstream.to_string()),
            api_token: secret(PAYOUT_TOKEN),
            timeout_ms: 2000,
            sweep_interval_secs: 3600,
            global_minimum: Decimal::ZERO,
            max_transfer_attempts: 3,
        },
        notifications: NotificationSettings {
            url: None,
            queue_capacity: 64,
            timeout_ms: 1000,
            max_retry_secs: 5,
        },
    }
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    /// Spawn with a tweaked configuration.
    pub async fn spawn_with(configure: impl FnOnce(&mut CheckoutConfig)) -> Self {
        Lazy::force(&TRACING);

        let upstream = MockServer::start().await;
        let mut config = test_config(&upstream.uri());
        configure(&mut config);

        let store = InMemoryStore::new();
        let app = Application::build_with_store(config, Arc::new(store.clone()))
            .await
            .expect("Failed to build test application");

        let port = app.http_port();
        let address = format!("http://127.0.0.1:{}", port);
        let shutdown = app.shutdown_token();

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for HTTP server to be ready by polling health endpoint
        let client = Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            port,
            store,
            client,
            upstream,
            shutdown,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> Response {
        self.client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn admin_post(&self, path: &str) -> Response {
        self.client
            .post(self.url(path))
            .header(INTERNAL_API_KEY_HEADER, API_KEY)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn admin_get(&self, path: &str) -> Response {
        self.client
            .get(self.url(path))
            .header(INTERNAL_API_KEY_HEADER, API_KEY)
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Finalise an order the way the storefront backend does.
    pub async fn checkout_request(&self, body: &Value) -> Response {
        self.client
            .post(self.url("/checkout/orders"))
            .header(INTERNAL_API_KEY_HEADER, API_KEY)
            .json(body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Create an order and return the response body.
    pub async fn checkout(&self, body: &Value) -> Value {
        let response = self.checkout_request(body).await;
        assert_eq!(response.status().as_u16(), 201, "checkout failed");
        response.json().await.expect("Failed to parse JSON")
    }

    pub async fn stripe_webhook(&self, event: &Value) -> Response {
        let body = serde_json::to_vec(event).expect("Failed to encode event");
        let timestamp = chrono::Utc::now().timestamp();
        let mut signed = format!("{}.", timestamp).into_bytes();
        signed.extend_from_slice(&body);
        let signature = hmac_sha256_hex(STRIPE_SECRET, &signed).expect("Failed to sign");

        self.client
            .post(self.url("/webhooks/stripe"))
            .header(STRIPE_SIGNATURE_HEADER, format!("t={},v1={}", timestamp, signature))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn paypal_webhook(&self, event: &Value) -> Response {
        let body = serde_json::to_vec(event).expect("Failed to encode event");
        let transmission_id = Uuid::new_v4().to_string();
        let transmission_time = chrono::Utc::now().to_rfc3339();
        let payload = PaypalAdapter::signing_payload(
            &transmission_id,
            &transmission_time,
            PAYPAL_WEBHOOK_ID,
            &body,
        );
        let signature = hmac_sha256_hex(PAYPAL_SECRET, payload.as_bytes()).expect("Failed to sign");

        self.client
            .post(self.url("/webhooks/paypal"))
            .header(TRANSMISSION_ID_HEADER, transmission_id)
            .header(TRANSMISSION_TIME_HEADER, transmission_time)
            .header(TRANSMISSION_SIG_HEADER, signature)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Webhooks-v2 style notification for `payment_id`, signed over the
    /// `data.id` query parameter.
    pub async fn mercadopago_webhook(&self, payment_id: &str) -> Response {
        let body = serde_json::json!({
            "action": "payment.updated",
            "type": "payment",
            "data": {"id": payment_id}
        });
        let request_id = Uuid::new_v4().to_string();
        let ts = chrono::Utc::now().timestamp_millis().to_string();
        let manifest = signature_manifest(
            Some(&payment_id.to_ascii_lowercase()),
            Some(&request_id),
            &ts,
        );
        let signature =
            hmac_sha256_hex(MERCADOPAGO_SECRET, manifest.as_bytes()).expect("Failed to sign");

        self.client
            .post(self.url(&format!(
                "/webhooks/mercadopago?type=payment&data.id={}",
                payment_id
            )))
            .header(MERCADOPAGO_SIGNATURE_HEADER, format!("ts={},v1={}", ts, signature))
            .header(REQUEST_ID_HEADER, request_id)
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => Decimal::from_str(s).expect("Invalid decimal string"),
        Value::Number(n) => Decimal::from_str(&n.to_string()).expect("Invalid decimal number"),
        other => panic!("Expected a decimal, got {}", other),
    }
}

pub fn cart(currency: &str, price: &str) -> Value {
    serde_json::json!({
        "email": "buyer@example.com",
        "provider": "stripe",
        "currency": currency,
        "items": [{
            "product_id": Uuid::new_v4(),
            "base_price": price,
            "quantity": 1
        }]
    })
}

pub fn affiliate(email: &str, rate: Decimal) -> Affiliate {
    let id = Uuid::new_v4();
    let suffix = id.simple().to_string()[..6].to_string();
    Affiliate {
        id,
        code: format!("AFF{}", suffix.to_uppercase()),
        slug: format!("affiliate-{}", suffix),
        email: email.to_string(),
        user_id: None,
        status: AffiliateStatus::Active,
        affiliate_type: AffiliateType::Common,
        commission_value: rate,
        total_revenue: Decimal::ZERO,
        commission_owed: Decimal::ZERO,
        commission_paid: Decimal::ZERO,
        pix_key: Some(format!("{}@pix.example", suffix)),
        auto_transfer: false,
        minimum_payout: Decimal::ZERO,
    }
}

pub fn coupon(code: &str, kind: CouponKind, value: Decimal) -> Coupon {
    Coupon {
        id: Uuid::new_v4(),
        code: code.to_string(),
        kind,
        value,
        min_subtotal: None,
        usage_limit: None,
        per_user_limit: None,
        stackable: false,
        valid_from: None,
        valid_until: None,
        active: true,
        used_count: 0,
        allowed_emails: Vec::new(),
    }
}

/// `payment_intent.*` event for the order with id `order_id`.
pub fn stripe_payment_intent(
    event_id: &str,
    kind: &str,
    order_id: &str,
    amount_minor: i64,
    currency: &str,
) -> Value {
    serde_json::json!({
        "id": event_id,
        "type": format!("payment_intent.{}", kind),
        "data": {
            "object": {
                "id": format!("pi_{}", order_id.replace('-', "")),
                "object": "payment_intent",
                "amount": amount_minor,
                "amount_received": amount_minor,
                "currency": currency.to_ascii_lowercase(),
                "status": kind,
                "metadata": {"order_id": order_id}
            }
        }
    })
}
