mod common;

use checkout_service::models::{AffiliateType, CommissionStatus, TransferStatus};
use checkout_service::services::store::{AffiliateStore, CommissionStore};
use common::{affiliate, cart, decimal, stripe_payment_intent, TestApp, PAYOUT_TOKEN};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use uuid::Uuid;
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, ResponseTemplate};

/// Check out with `referral` and pay the order in full.
async fn referred_paid_order(app: &TestApp, referral: Value, email: &str) -> Uuid {
    let mut body = cart("BRL", "100.00");
    body["email"] = json!(email);
    for (key, value) in referral.as_object().unwrap() {
        body[key] = value.clone();
    }
    let order = app.checkout(&body).await;
    let order_id = order["order_id"].as_str().unwrap().to_string();

    let event = stripe_payment_intent(
        &format!("evt_{}", Uuid::new_v4().simple()),
        "succeeded",
        &order_id,
        10_000,
        "BRL",
    );
    let response = app.stripe_webhook(&event).await;
    assert_eq!(response.status().as_u16(), 200);
    let ack: Value = response.json().await.unwrap();
    assert_eq!(ack["outcome"], "completed");

    Uuid::parse_str(&order_id).unwrap()
}

fn transfer_ok(id: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"id": id, "status": "completed"}))
}

#[tokio::test]
async fn click_is_recorded_for_active_affiliate() {
    let app = TestApp::spawn().await;
    let partner = affiliate("partner@example.com", dec!(10));
    app.store.put_affiliate(partner.clone()).await;

    let response = app
        .client
        .post(app.url("/affiliates/clicks"))
        .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
        .json(&json!({"code": partner.code.to_lowercase()}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["affiliate_id"], partner.id.to_string());

    let click_id = Uuid::parse_str(body["click_id"].as_str().unwrap()).unwrap();
    let click = app.store.get_click(click_id).await.unwrap().unwrap();
    assert_eq!(click.ip, "203.0.113.7");
    assert!(!click.converted);
}

#[tokio::test]
async fn click_for_unknown_affiliate_is_not_found() {
    let app = TestApp::spawn().await;

    let response = app
        .post_json("/affiliates/clicks", &json!({"code": "NOPE"}))
        .await;
    assert_eq!(response.status().as_u16(), 404);

    let response = app.post_json("/affiliates/clicks", &json!({"code": ""})).await;
    assert_eq!(response.status().as_u16(), 422);
}

#[tokio::test]
async fn click_attribution_converts_and_approves_commission() {
    let app = TestApp::spawn().await;
    let partner = affiliate("partner@example.com", dec!(10));
    app.store.put_affiliate(partner.clone()).await;

    let click: Value = app
        .post_json("/affiliates/clicks", &json!({"code": partner.code}))
        .await
        .json()
        .await
        .unwrap();
    let click_id = click["click_id"].clone();

    let order_id = referred_paid_order(
        &app,
        json!({"affiliate_click_id": click_id}),
        "buyer@example.com",
    )
    .await;

    let commission = app
        .store
        .commission_for_order(order_id)
        .await
        .unwrap()
        .expect("commission recorded");
    assert_eq!(commission.affiliate_id, partner.id);
    assert_eq!(commission.commission_amount, dec!(10));
    assert_eq!(commission.status, CommissionStatus::Approved);
    assert!(commission.fraud_notes.is_none());

    let click_id = Uuid::parse_str(click_id.as_str().unwrap()).unwrap();
    let stored_click = app.store.get_click(click_id).await.unwrap().unwrap();
    assert!(stored_click.converted);
    assert_eq!(stored_click.order_id, Some(order_id));

    let stored = app.store.get_affiliate(partner.id).await.unwrap().unwrap();
    assert_eq!(stored.total_revenue, dec!(100));
    assert_eq!(stored.commission_owed, dec!(10));
}

#[tokio::test]
async fn eligible_commission_is_transferred_automatically() {
    let app = TestApp::spawn().await;
    let mut partner = affiliate("partner@example.com", dec!(10));
    partner.auto_transfer = true;
    app.store.put_affiliate(partner.clone()).await;

    Mock::given(method("POST"))
        .and(path("/transfers"))
        .and(header("authorization", format!("Bearer {}", PAYOUT_TOKEN).as_str()))
        .and(header_exists("idempotency-key"))
        .respond_with(transfer_ok("tr_auto_1"))
        .expect(1)
        .mount(&app.upstream)
        .await;

    let order_id = referred_paid_order(
        &app,
        json!({"referral_code": partner.code}),
        "buyer@example.com",
    )
    .await;

    let commission = app.store.commission_for_order(order_id).await.unwrap().unwrap();
    assert_eq!(commission.status, CommissionStatus::Paid);
    assert_eq!(commission.transfer_id.as_deref(), Some("tr_auto_1"));

    let stored = app.store.get_affiliate(partner.id).await.unwrap().unwrap();
    assert_eq!(stored.commission_owed, dec!(0));
    assert_eq!(stored.commission_paid, dec!(10));

    let ledger = app
        .store
        .financial_transactions(&format!("affiliate:{}", partner.id))
        .await
        .unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].amount, dec!(10));
}

#[tokio::test]
async fn self_referral_is_held_for_review() {
    let app = TestApp::spawn().await;
    let mut partner = affiliate("buyer@example.com", dec!(10));
    partner.auto_transfer = true;
    app.store.put_affiliate(partner.clone()).await;

    Mock::given(method("POST"))
        .and(path("/transfers"))
        .respond_with(transfer_ok("tr_never"))
        .expect(0)
        .mount(&app.upstream)
        .await;

    let order_id = referred_paid_order(
        &app,
        json!({"referral_code": partner.code}),
        "Buyer@Example.com",
    )
    .await;

    let commission = app.store.commission_for_order(order_id).await.unwrap().unwrap();
    assert_eq!(commission.status, CommissionStatus::Pending);
    assert_eq!(commission.transfer_status, TransferStatus::NotAttempted);
    assert!(commission.fraud_score >= 50);
    assert!(commission.fraud_notes.unwrap().contains("auto-referral"));
}

#[tokio::test]
async fn commercial_license_affiliate_earns_nothing() {
    let app = TestApp::spawn().await;
    let mut partner = affiliate("licensee@example.com", dec!(10));
    partner.affiliate_type = AffiliateType::CommercialLicense;
    app.store.put_affiliate(partner.clone()).await;

    let order_id = referred_paid_order(
        &app,
        json!({"referral_code": partner.code}),
        "buyer@example.com",
    )
    .await;

    assert!(app.store.commission_for_order(order_id).await.unwrap().is_none());
}

#[tokio::test]
async fn admin_routes_require_the_internal_key() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(app.url("/admin/commissions"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);

    let response = app
        .client
        .post(app.url("/admin/payouts/sweep"))
        .header("x-internal-api-key", "wrong-key")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);

    let response = app.admin_get("/admin/commissions?status=bogus").await;
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn reviewed_commission_is_paid_by_the_sweep() {
    let app = TestApp::spawn().await;
    let partner = affiliate("buyer@example.com", dec!(10));
    app.store.put_affiliate(partner.clone()).await;

    let order_id = referred_paid_order(
        &app,
        json!({"referral_code": partner.slug}),
        "buyer@example.com",
    )
    .await;
    let held = app.store.commission_for_order(order_id).await.unwrap().unwrap();
    assert_eq!(held.status, CommissionStatus::Pending);

    let listed: Value = app
        .admin_get("/admin/commissions?status=pending")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(listed["count"], 1);
    assert_eq!(listed["commissions"][0]["id"], held.id.to_string());

    let response = app
        .admin_post(&format!("/admin/commissions/{}/approve", held.id))
        .await;
    assert_eq!(response.status().as_u16(), 200);
    let approved: Value = response.json().await.unwrap();
    assert_eq!(approved["status"], "approved");

    // A second approval is a conflict.
    let response = app
        .admin_post(&format!("/admin/commissions/{}/approve", held.id))
        .await;
    assert_eq!(response.status().as_u16(), 409);

    Mock::given(method("POST"))
        .and(path("/transfers"))
        .respond_with(transfer_ok("tr_sweep_1"))
        .expect(1)
        .mount(&app.upstream)
        .await;

    let response = app.admin_post("/admin/payouts/sweep").await;
    assert_eq!(response.status().as_u16(), 200);
    let report: Value = response.json().await.unwrap();
    assert_eq!(report["affiliates_paid"], 1);
    assert_eq!(report["commissions_paid"], 1);
    assert_eq!(decimal(&report["amount_paid"]), dec!(10));

    let paid = app.store.get_commission(held.id).await.unwrap().unwrap();
    assert_eq!(paid.status, CommissionStatus::Paid);
    assert_eq!(paid.transfer_id.as_deref(), Some("tr_sweep_1"));
}

#[tokio::test]
async fn sweep_is_unavailable_without_a_transfer_api() {
    let app = TestApp::spawn_with(|config| {
        config.payouts.api_url = None;
    })
    .await;

    let response = app.admin_post("/admin/payouts/sweep").await;

    assert_eq!(response.status().as_u16(), 503);
}
