//! The document processing engine seam.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use pagecredit_core::Operation;

/// Why a file could not be processed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessingError {
    /// Worth retrying (timeouts, engine overload, 5xx).
    #[error("transient processing error: {0}")]
    Transient(String),
    /// Retrying will not help (bad input, unsupported document).
    #[error("permanent processing error: {0}")]
    Permanent(String),
}

impl ProcessingError {
    /// Whether another attempt may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Runs one operation on one input document.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Process `input_ref` and return a reference to the output document.
    ///
    /// # Errors
    ///
    /// Returns a [`ProcessingError`] classifying the failure.
    async fn process(
        &self,
        operation: Operation,
        input_ref: &str,
        options: &serde_json::Value,
    ) -> Result<String, ProcessingError>;
}

#[derive(Debug, Serialize)]
struct ProcessRequest<'a> {
    operation: Operation,
    input_ref: &'a str,
    options: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ProcessResponse {
    output_ref: String,
}

/// Processor that POSTs each file to an HTTP engine.
#[derive(Debug, Clone)]
pub struct HttpProcessor {
    client: Client,
    url: String,
}

impl HttpProcessor {
    /// Create a processor for the engine at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Processor for HttpProcessor {
    async fn process(
        &self,
        operation: Operation,
        input_ref: &str,
        options: &serde_json::Value,
    ) -> Result<String, ProcessingError> {
        let request = ProcessRequest {
            operation,
            input_ref,
            options,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProcessingError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProcessingError::Permanent(format!("engine returned {status}: {body}")));
        }
        if !status.is_success() {
            return Err(ProcessingError::Transient(format!("engine returned {status}")));
        }

        let body: ProcessResponse = response
            .json()
            .await
            .map_err(|e| ProcessingError::Transient(format!("unreadable engine response: {e}")))?;
        Ok(body.output_ref)
    }
}

/// Processor that echoes the input back; for local development.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProcessor;

#[async_trait]
impl Processor for NoopProcessor {
    async fn process(
        &self,
        operation: Operation,
        input_ref: &str,
        _options: &serde_json::Value,
    ) -> Result<String, ProcessingError> {
        Ok(format!("{input_ref}.{operation}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_derives_output_from_input() {
        let out = NoopProcessor
            .process(Operation::Ocr, "s3://in/a.pdf", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(out, "s3://in/a.pdf.ocr");
    }

    #[test]
    fn only_transient_errors_retry() {
        assert!(ProcessingError::Transient("timeout".into()).is_retryable());
        assert!(!ProcessingError::Permanent("corrupt".into()).is_retryable());
    }
}
