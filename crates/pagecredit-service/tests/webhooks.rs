//! Payment webhook integration tests.

mod common;

use std::sync::Arc;

use axum::body::Bytes;
use axum::http::StatusCode;
use common::{auth_header_for, test_config, TestHarness, SERVICE_API_KEY};
use pagecredit_core::PaymentStatus;
use pagecredit_service::crypto::hmac_sha256_hex;
use pagecredit_service::jobs::NoopProcessor;
use pagecredit_service::payments::{GatewayOutcome, ProviderPayload};
use pagecredit_service::ServiceConfig;
use pagecredit_store::Store;
use serde_json::json;

fn paypal_capture(event_type: &str, capture_id: &str, custom_id: &str) -> serde_json::Value {
    json!({
        "id": format!("WH-{capture_id}-{event_type}"),
        "event_type": event_type,
        "resource": {
            "id": capture_id,
            "custom_id": custom_id,
            "amount": {"value": "10.00", "currency_code": "USD"},
        }
    })
}

fn stripe_session(event_type: &str, session_id: &str, plan_id: &str) -> serde_json::Value {
    json!({
        "id": format!("evt_{session_id}"),
        "type": event_type,
        "data": {"object": {
            "id": session_id,
            "client_reference_id": "acct_test",
            "metadata": {"plan_id": plan_id},
            "amount_total": 4500,
            "currency": "usd",
            "payment_status": "paid",
        }}
    })
}

async fn audit_count(harness: &TestHarness, kind: &str) -> usize {
    let body: serde_json::Value = harness
        .server
        .get(&format!("/v1/admin/audit-log?kind={kind}"))
        .add_header("x-api-key", SERVICE_API_KEY)
        .await
        .json();
    body["records"].as_array().unwrap().len()
}

async fn entry_count(harness: &TestHarness) -> usize {
    let body: serde_json::Value = harness
        .server
        .get("/v1/credits/transactions")
        .add_header("authorization", harness.user_auth_header())
        .await
        .json();
    body["transactions"].as_array().unwrap().len()
}

// ============================================================================
// PayPal
// ============================================================================

#[tokio::test]
async fn capture_delivered_three_times_credits_once() {
    let harness = TestHarness::new();
    let body = paypal_capture("PAYMENT.CAPTURE.COMPLETED", "cap_123", "acct_test|credits_100");

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let response = harness.server.post("/webhooks/paypal").json(&body).await;
        response.assert_status_ok();
        let result: serde_json::Value = response.json();
        statuses.push(result["status"].as_str().unwrap().to_string());
    }

    assert_eq!(statuses, ["accepted", "duplicate", "duplicate"]);
    assert_eq!(harness.balance().await, 100);
    assert_eq!(entry_count(&harness).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deliveries_credit_once() {
    let harness = TestHarness::new();
    let body = serde_json::to_vec(&paypal_capture(
        "PAYMENT.CAPTURE.COMPLETED",
        "cap_123",
        "acct_test|credits_100",
    ))
    .unwrap();

    let deliveries: Vec<_> = (0..3)
        .map(|_| {
            let state = Arc::clone(&harness.state);
            let body = body.clone();
            tokio::spawn(async move { state.gateway.handle(ProviderPayload::PayPal(&body)).await })
        })
        .collect();
    let outcomes: Vec<GatewayOutcome> = futures::future::join_all(deliveries)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let accepted = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, GatewayOutcome::Accepted { credited: 100, .. }))
        .count();
    assert_eq!(accepted, 1);
    assert_eq!(harness.balance().await, 100);
    assert_eq!(entry_count(&harness).await, 1);

    let record = harness.state.store.get_payment("cap_123").await.unwrap().unwrap();
    assert_eq!(record.status, PaymentStatus::Applied);
}

#[tokio::test]
async fn client_keys_cannot_claim_payment_keys() {
    let harness = TestHarness::new();
    harness
        .server
        .post("/v1/credits/grant")
        .add_header("x-api-key", SERVICE_API_KEY)
        .json(&json!({"account_id": "acct_evil", "amount": 5, "idempotency_key": "seed"}))
        .await
        .assert_status_ok();
    harness
        .server
        .post("/v1/credits/deduct")
        .add_header("authorization", auth_header_for("acct_evil"))
        .json(&json!({"amount": 1, "idempotency_key": "payment:paypal:cap_123"}))
        .await
        .assert_status_ok();

    let body = paypal_capture("PAYMENT.CAPTURE.COMPLETED", "cap_123", "acct_test|credits_100");
    for _ in 0..3 {
        harness.server.post("/webhooks/paypal").json(&body).await.assert_status_ok();
    }

    assert_eq!(harness.balance().await, 100);
    assert_eq!(entry_count(&harness).await, 1);
    assert!(harness
        .state
        .store
        .get_entry_by_key("payment:paypal:cap_123")
        .await
        .unwrap()
        .is_some_and(|entry| entry.account_id.as_str() == "acct_test"));
}

#[tokio::test]
async fn unknown_plan_is_rejected_without_credit() {
    let harness = TestHarness::new();
    let body = paypal_capture("PAYMENT.CAPTURE.COMPLETED", "cap_404", "acct_test|MYSTERY_PLAN");

    let response = harness.server.post("/webhooks/paypal").json(&body).await;

    response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    let result: serde_json::Value = response.json();
    assert_eq!(result["code"], "unknown_plan");
    assert_eq!(entry_count(&harness).await, 0);
    assert_eq!(audit_count(&harness, "webhook_rejected").await, 1);
}

#[tokio::test]
async fn denied_then_completed_capture_is_credited() {
    let harness = TestHarness::new();
    let denied = paypal_capture("PAYMENT.CAPTURE.DENIED", "cap_77", "acct_test|credits_500");
    let completed = paypal_capture("PAYMENT.CAPTURE.COMPLETED", "cap_77", "acct_test|credits_500");

    harness.server.post("/webhooks/paypal").json(&denied).await.assert_status_ok();
    assert_eq!(harness.balance().await, 0);
    assert_eq!(audit_count(&harness, "payment_failed").await, 1);

    harness.server.post("/webhooks/paypal").json(&completed).await.assert_status_ok();
    assert_eq!(harness.balance().await, 500);
}

#[tokio::test]
async fn malformed_custom_id_is_bad_request() {
    let harness = TestHarness::new();
    let body = paypal_capture("PAYMENT.CAPTURE.COMPLETED", "cap_1", "no-separator");

    let response = harness.server.post("/webhooks/paypal").json(&body).await;

    response.assert_status_bad_request();
    let result: serde_json::Value = response.json();
    assert_eq!(result["code"], "malformed");
}

#[tokio::test]
async fn unsupported_event_is_bad_request() {
    let harness = TestHarness::new();
    let body = paypal_capture("PAYMENT.CAPTURE.REFUNDED", "cap_2", "acct_test|credits_100");

    let response = harness.server.post("/webhooks/paypal").json(&body).await;

    response.assert_status_bad_request();
    let result: serde_json::Value = response.json();
    assert_eq!(result["code"], "unsupported_event");
}

// ============================================================================
// Stripe
// ============================================================================

#[tokio::test]
async fn stripe_checkout_credits_plan() {
    let harness = TestHarness::new();
    let body = stripe_session("checkout.session.completed", "cs_test_a1", "credits_1200");

    harness.server.post("/webhooks/stripe").json(&body).await.assert_status_ok();
    harness.server.post("/webhooks/stripe").json(&body).await.assert_status_ok();

    assert_eq!(harness.balance().await, 1200);
    assert_eq!(entry_count(&harness).await, 1);
}

#[tokio::test]
async fn stripe_signature_is_enforced_when_configured() {
    let config = ServiceConfig {
        stripe_webhook_secret: Some("whsec_test".into()),
        ..test_config()
    };
    let harness = TestHarness::with(config, Arc::new(NoopProcessor));
    let body = serde_json::to_vec(&stripe_session(
        "checkout.session.completed",
        "cs_signed",
        "credits_100",
    ))
    .unwrap();

    harness
        .server
        .post("/webhooks/stripe")
        .add_header("content-type", "application/json")
        .add_header("stripe-signature", "t=1700000000,v1=deadbeef")
        .bytes(Bytes::from(body.clone()))
        .await
        .assert_status_bad_request();
    assert_eq!(harness.balance().await, 0);

    let mut signed = b"1700000000.".to_vec();
    signed.extend_from_slice(&body);
    let signature = format!("t=1700000000,v1={}", hmac_sha256_hex("whsec_test", &signed).unwrap());

    harness
        .server
        .post("/webhooks/stripe")
        .add_header("content-type", "application/json")
        .add_header("stripe-signature", signature)
        .bytes(Bytes::from(body))
        .await
        .assert_status_ok();
    assert_eq!(harness.balance().await, 100);
}
