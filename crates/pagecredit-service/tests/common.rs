//! Common test utilities for pagecredit integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;

use pagecredit_core::AccountId;
use pagecredit_service::auth::JwtClaims;
use pagecredit_service::jobs::{NoopProcessor, Processor};
use pagecredit_service::{create_router, AppState, ServiceConfig};
use pagecredit_store::MemoryStore;

pub const JWT_SECRET: &str = "test-jwt-secret";
pub const SERVICE_API_KEY: &str = "test-service-key";

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// Shared state, for reaching past the HTTP surface.
    pub state: Arc<AppState>,
    /// The account the default user token is issued for.
    pub account_id: AccountId,
}

impl TestHarness {
    /// Harness with default settings and a no-op processor.
    pub fn new() -> Self {
        Self::with(test_config(), Arc::new(NoopProcessor))
    }

    /// Harness with a custom configuration and processor.
    pub fn with(config: ServiceConfig, processor: Arc<dyn Processor>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let state = Arc::new(AppState::new(store, config, processor));
        let server =
            TestServer::new(create_router(Arc::clone(&state))).expect("Failed to create test server");

        Self {
            server,
            state,
            account_id: AccountId::new("acct_test").unwrap(),
        }
    }

    /// Authorization header for the default user.
    pub fn user_auth_header(&self) -> String {
        auth_header_for(self.account_id.as_str())
    }

    /// Grant credits to the default user through the service API.
    pub async fn grant(&self, amount: i64) {
        self.server
            .post("/v1/credits/grant")
            .add_header("x-api-key", SERVICE_API_KEY)
            .json(&json!({
                "account_id": self.account_id,
                "amount": amount,
                "idempotency_key": format!("grant:{}", uuid::Uuid::new_v4()),
                "reason": "test setup",
            }))
            .await
            .assert_status_ok();
    }

    /// Current balance of the default user.
    pub async fn balance(&self) -> i64 {
        let body: serde_json::Value = self
            .server
            .get("/v1/credits/balance")
            .add_header("authorization", self.user_auth_header())
            .await
            .json();
        body["balance"].as_i64().unwrap()
    }

    /// Poll a job until it reaches a terminal state.
    pub async fn wait_for_job(&self, job_id: &str) -> serde_json::Value {
        for _ in 0..400 {
            let body: serde_json::Value = self
                .server
                .get(&format!("/v1/jobs/{job_id}"))
                .add_header("authorization", self.user_auth_header())
                .await
                .json();
            if matches!(
                body["state"].as_str(),
                Some("completed" | "partially_failed" | "failed")
            ) {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} did not finish");
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration used by every harness unless a test overrides it.
pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        listen_addr: "127.0.0.1:0".into(),
        auth_jwt_secret: Some(JWT_SECRET.into()),
        service_api_key: Some(SERVICE_API_KEY.into()),
        stripe_webhook_secret: None,
        paypal_webhook_secret: None,
        job_retry_base_ms: 1,
        job_retry_max_ms: 5,
        ..ServiceConfig::default()
    }
}

/// Bearer header with a freshly minted token for `account_id`.
pub fn auth_header_for(account_id: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = JwtClaims {
        sub: account_id.to_string(),
        aud: ServiceConfig::default().auth_audience,
        exp: now + 3600,
        iat: now,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap();
    format!("Bearer {token}")
}
