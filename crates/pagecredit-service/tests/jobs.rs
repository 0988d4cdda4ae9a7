//! Batch job integration tests.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use common::{auth_header_for, test_config, TestHarness};
use pagecredit_core::Operation;
use pagecredit_service::jobs::{ProcessingError, Processor};
use pagecredit_service::ServiceConfig;
use serde_json::json;
use tokio::sync::{Notify, Semaphore};

/// Fails inputs containing "bad"; succeeds otherwise.
struct PickyProcessor;

#[async_trait]
impl Processor for PickyProcessor {
    async fn process(
        &self,
        _operation: Operation,
        input_ref: &str,
        _options: &serde_json::Value,
    ) -> Result<String, ProcessingError> {
        if input_ref.contains("bad") {
            Err(ProcessingError::Permanent("unreadable document".into()))
        } else {
            Ok(format!("{input_ref}.out"))
        }
    }
}

/// Blocks the `gate_at`-th call until released.
struct GatedProcessor {
    calls: AtomicUsize,
    gate_at: usize,
    entered: Notify,
    release: Semaphore,
}

impl GatedProcessor {
    fn new(gate_at: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            gate_at,
            entered: Notify::new(),
            release: Semaphore::new(0),
        }
    }
}

#[async_trait]
impl Processor for GatedProcessor {
    async fn process(
        &self,
        _operation: Operation,
        input_ref: &str,
        _options: &serde_json::Value,
    ) -> Result<String, ProcessingError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.gate_at {
            self.entered.notify_one();
            let _permit = self.release.acquire().await.unwrap();
        }
        Ok(format!("{input_ref}.out"))
    }
}

fn files(refs: &[&str]) -> serde_json::Value {
    json!(refs)
}

#[tokio::test]
async fn partial_failure_refunds_unperformed_work() {
    let harness = TestHarness::with(test_config(), Arc::new(PickyProcessor));
    harness.grant(10).await;

    let response = harness
        .server
        .post("/v1/jobs")
        .add_header("authorization", harness.user_auth_header())
        .json(&json!({
            "operation": "compress",
            "files": files(&["s3://in/1.pdf", "s3://in/2.pdf", "s3://in/bad-3.pdf", "s3://in/4.pdf", "s3://in/bad-5.pdf"]),
        }))
        .await;

    response.assert_status(StatusCode::ACCEPTED);
    let created: serde_json::Value = response.json();
    assert_eq!(created["reserved_credits"], 5);

    let job = harness.wait_for_job(created["job_id"].as_str().unwrap()).await;

    assert_eq!(job["state"], "partially_failed");
    assert_eq!(job["actual_credits"], 3);
    assert_eq!(job["refunded_credits"], 2);
    assert_eq!(job["progress"]["completed"], 3);
    assert_eq!(job["progress"]["failed"], 2);
    assert_eq!(job["files"][2]["error"], "permanent processing error: unreadable document");
    assert_eq!(harness.balance().await, 7);
}

#[tokio::test]
async fn unaffordable_job_is_payment_required() {
    let harness = TestHarness::new();
    harness.grant(2).await;

    let response = harness
        .server
        .post("/v1/jobs")
        .add_header("authorization", harness.user_auth_header())
        .json(&json!({"operation": "ocr", "files": ["a.pdf"]}))
        .await;

    response.assert_status(StatusCode::PAYMENT_REQUIRED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["details"]["required"], 3);
    assert_eq!(harness.balance().await, 2);
}

#[tokio::test]
async fn unknown_operation_is_bad_request() {
    let harness = TestHarness::new();
    harness.grant(10).await;

    harness
        .server
        .post("/v1/jobs")
        .add_header("authorization", harness.user_auth_header())
        .json(&json!({"operation": "teleport", "files": ["a.pdf"]}))
        .await
        .assert_status_bad_request();
    assert_eq!(harness.balance().await, 10);
}

#[tokio::test]
async fn idempotency_key_header_replays_submission() {
    let harness = TestHarness::new();
    harness.grant(10).await;
    let body = json!({"operation": "compress", "files": ["a.pdf", "b.pdf"]});

    let mut job_ids = Vec::new();
    for _ in 0..2 {
        let response = harness
            .server
            .post("/v1/jobs")
            .add_header("authorization", harness.user_auth_header())
            .add_header("idempotency-key", "upload-42")
            .json(&body)
            .await;
        response.assert_status(StatusCode::ACCEPTED);
        let created: serde_json::Value = response.json();
        job_ids.push(created["job_id"].as_str().unwrap().to_string());
    }

    assert_eq!(job_ids[0], job_ids[1]);
    harness.wait_for_job(&job_ids[0]).await;
    assert_eq!(harness.balance().await, 8);
}

#[tokio::test]
async fn cancel_mid_job_refunds_remaining_files() {
    let processor = Arc::new(GatedProcessor::new(3));
    let config = ServiceConfig {
        job_max_parallel_files: 1,
        ..test_config()
    };
    let harness = TestHarness::with(config, processor.clone());
    harness.grant(10).await;

    let response = harness
        .server
        .post("/v1/jobs")
        .add_header("authorization", harness.user_auth_header())
        .json(&json!({
            "operation": "compress",
            "files": ["1.pdf", "2.pdf", "3.pdf", "4.pdf", "5.pdf"],
            "request_id": "cancel-me",
        }))
        .await;
    let created: serde_json::Value = response.json();
    let job_id = created["job_id"].as_str().unwrap().to_string();

    // File 3 is in flight, files 4 and 5 have not started
    processor.entered.notified().await;
    let cancelled = harness
        .server
        .post(&format!("/v1/jobs/{job_id}/cancel"))
        .add_header("authorization", harness.user_auth_header())
        .await;
    cancelled.assert_status_ok();
    let cancelled: serde_json::Value = cancelled.json();
    assert_eq!(cancelled["cancel_requested"], true);
    processor.release.add_permits(1);

    let job = harness.wait_for_job(&job_id).await;

    assert_eq!(job["state"], "partially_failed");
    assert_eq!(job["progress"]["completed"], 3);
    assert_eq!(job["files"][3]["error"], "cancelled");
    assert_eq!(job["files"][4]["error"], "cancelled");
    assert_eq!(job["refunded_credits"], 2);
    assert_eq!(harness.balance().await, 7);
}

#[tokio::test]
async fn jobs_of_other_accounts_are_not_found() {
    let harness = TestHarness::new();
    harness.grant(10).await;

    let response = harness
        .server
        .post("/v1/jobs")
        .add_header("authorization", harness.user_auth_header())
        .json(&json!({"operation": "rotate", "files": ["a.pdf"]}))
        .await;
    let created: serde_json::Value = response.json();
    let job_id = created["job_id"].as_str().unwrap();

    harness
        .server
        .get(&format!("/v1/jobs/{job_id}"))
        .add_header("authorization", auth_header_for("acct_intruder"))
        .await
        .assert_status_not_found();
    harness
        .server
        .post(&format!("/v1/jobs/{job_id}/cancel"))
        .add_header("authorization", auth_header_for("acct_intruder"))
        .await
        .assert_status_not_found();
    harness
        .server
        .get("/v1/jobs/not-a-uuid")
        .add_header("authorization", harness.user_auth_header())
        .await
        .assert_status_not_found();
}

#[tokio::test]
async fn submissions_are_rate_limited() {
    let config = ServiceConfig {
        rate_limit_max_requests: 2,
        rate_limit_window_seconds: 3600,
        ..test_config()
    };
    let harness = TestHarness::with(config, Arc::new(PickyProcessor));
    harness.grant(10).await;
    let body = json!({"operation": "compress", "files": ["a.pdf"]});

    for _ in 0..2 {
        harness
            .server
            .post("/v1/jobs")
            .add_header("authorization", harness.user_auth_header())
            .json(&body)
            .await
            .assert_status(StatusCode::ACCEPTED);
    }
    harness
        .server
        .post("/v1/jobs")
        .add_header("authorization", harness.user_auth_header())
        .json(&body)
        .await
        .assert_status(StatusCode::TOO_MANY_REQUESTS);
}
