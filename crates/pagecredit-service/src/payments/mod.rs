//! Payment reconciliation gateway.
//!
//! Provider webhooks arrive here as raw bytes. Each body is normalized into a
//! [`PaymentEvent`], deduplicated by its external payment id, priced against the
//! plan table and, if the payment completed, credited through the ledger under
//! the key `payment:{provider}:{external_id}`. A provider may deliver the same
//! event any number of times; the account is credited once.

pub mod paypal;
pub mod stripe;
pub mod verify;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use pagecredit_core::{
    AccountId, AuditKind, AuditRecord, EntryKind, EntryRequest, PaymentEvent, PaymentOutcome,
    PaymentRecord, PaymentStatus, PricingConfig, Provider,
};
use pagecredit_store::{Store, StoreError};

use crate::ledger::{CreditLedger, LedgerError};

pub use verify::{HmacVerifier, VerifyError, WebhookVerifier};

/// A provider payload, tagged by its source.
#[derive(Debug, Clone, Copy)]
pub enum ProviderPayload<'a> {
    /// Stripe Checkout event body.
    Stripe(&'a [u8]),
    /// PayPal capture event body.
    PayPal(&'a [u8]),
}

impl<'a> ProviderPayload<'a> {
    /// Tag `raw` with its provider.
    #[must_use]
    pub const fn new(provider: Provider, raw: &'a [u8]) -> Self {
        match provider {
            Provider::Stripe => Self::Stripe(raw),
            Provider::PayPal => Self::PayPal(raw),
        }
    }

    /// The sending provider.
    #[must_use]
    pub const fn provider(&self) -> Provider {
        match self {
            Self::Stripe(_) => Provider::Stripe,
            Self::PayPal(_) => Provider::PayPal,
        }
    }

    /// The raw body.
    #[must_use]
    pub const fn raw(&self) -> &'a [u8] {
        match self {
            Self::Stripe(raw) | Self::PayPal(raw) => raw,
        }
    }

    /// Normalize into provider-independent form.
    ///
    /// # Errors
    ///
    /// Returns the [`Rejection`] produced by the provider parser.
    pub fn normalize(&self) -> Result<Normalized, Rejection> {
        match self {
            Self::Stripe(raw) => stripe::parse(raw),
            Self::PayPal(raw) => paypal::parse(raw),
        }
    }
}

/// A parsed payment before plan pricing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPayment {
    /// Sending provider.
    pub provider: Provider,
    /// Provider payment id.
    pub external_id: String,
    /// Account to credit.
    pub account_id: AccountId,
    /// Purchased plan.
    pub plan_id: String,
    /// Amount paid in minor units.
    pub amount_minor: i64,
    /// Uppercase ISO currency.
    pub currency: String,
    /// Completed or failed.
    pub outcome: PaymentOutcome,
    /// Verbatim body.
    pub raw_payload: serde_json::Value,
}

impl ParsedPayment {
    fn into_event(self, credits: i64) -> PaymentEvent {
        PaymentEvent {
            provider: self.provider,
            external_id: self.external_id,
            account_id: self.account_id,
            plan_id: self.plan_id,
            credits,
            amount_minor: self.amount_minor,
            currency: self.currency,
            outcome: self.outcome,
            raw_payload: self.raw_payload,
        }
    }
}

/// Result of normalizing a provider body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    /// A payment to reconcile.
    Payment(ParsedPayment),
    /// A recognized event that carries nothing to reconcile yet.
    Ignored(String),
}

/// Why a webhook was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    /// Unreadable body or missing required fields.
    #[error("malformed payload: {0}")]
    Malformed(String),
    /// Event type this service does not consume.
    #[error("unsupported event type: {0}")]
    UnsupportedEvent(String),
    /// The plan id is not in the plan table.
    #[error("unknown plan: {0}")]
    UnknownPlan(String),
}

impl Rejection {
    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::UnsupportedEvent(_) => "unsupported_event",
            Self::UnknownPlan(_) => "unknown_plan",
        }
    }
}

/// What the gateway did with a webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GatewayOutcome {
    /// First delivery, processed.
    Accepted {
        /// Provider payment id.
        external_id: String,
        /// Recorded payment status.
        payment_status: PaymentStatus,
        /// Credits added to the account.
        credited: i64,
    },
    /// Already processed; nothing changed.
    Duplicate {
        /// Provider payment id.
        external_id: String,
    },
    /// Recognized but not actionable.
    Ignored {
        /// Why.
        reason: String,
    },
    /// Refused; written to the audit log.
    Rejected {
        /// Stable code.
        code: &'static str,
        /// Human-readable reason.
        reason: String,
    },
}

/// Failures the provider should retry.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The payment log or audit log could not be written.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The ledger refused or failed the credit.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Turns provider webhooks into at-most-once ledger credits.
#[derive(Clone)]
pub struct ReconciliationGateway {
    store: Arc<dyn Store>,
    ledger: CreditLedger,
    pricing: Arc<PricingConfig>,
}

impl ReconciliationGateway {
    /// Create a gateway.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, ledger: CreditLedger, pricing: Arc<PricingConfig>) -> Self {
        Self {
            store,
            ledger,
            pricing,
        }
    }

    /// Process one webhook delivery.
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError`] when storage or the ledger fails; the payment
    /// stays retryable in that case.
    #[tracing::instrument(skip(self, payload), fields(provider = %payload.provider()))]
    pub async fn handle(&self, payload: ProviderPayload<'_>) -> Result<GatewayOutcome, GatewayError> {
        let parsed = match payload.normalize() {
            Ok(Normalized::Payment(parsed)) => parsed,
            Ok(Normalized::Ignored(reason)) => {
                tracing::info!(reason = %reason, "Webhook ignored");
                return Ok(GatewayOutcome::Ignored { reason });
            }
            Err(rejection) => return self.reject(payload, None, rejection).await,
        };

        if let Some(existing) = self.store.get_payment(&parsed.external_id).await? {
            if existing.is_settled_for(parsed.outcome) {
                tracing::debug!(external_id = %parsed.external_id, "Duplicate webhook delivery");
                return Ok(GatewayOutcome::Duplicate {
                    external_id: parsed.external_id,
                });
            }
        }

        let credits = match (self.pricing.plan_credits(&parsed.plan_id), parsed.outcome) {
            (Some(credits), _) => credits,
            (None, PaymentOutcome::Failed) => 0,
            (None, PaymentOutcome::Completed) => {
                let subject = parsed.external_id.clone();
                let rejection = Rejection::UnknownPlan(parsed.plan_id);
                return self.reject(payload, Some(subject), rejection).await;
            }
        };

        let mut record = PaymentRecord::received(parsed.into_event(credits));
        if let Some(existing) = self.store.insert_payment_if_absent(&record).await? {
            if existing.is_settled_for(record.event.outcome) {
                return Ok(GatewayOutcome::Duplicate {
                    external_id: record.event.external_id,
                });
            }
            record.created_at = existing.created_at;
        }

        match record.event.outcome {
            PaymentOutcome::Completed => self.apply_purchase(record).await,
            PaymentOutcome::Failed => self.record_failure(record).await,
        }
    }

    async fn apply_purchase(&self, mut record: PaymentRecord) -> Result<GatewayOutcome, GatewayError> {
        let event = &record.event;
        let request = EntryRequest::credit(
            EntryKind::Purchase,
            event.account_id.clone(),
            event.credits,
            payment_key(event),
            "purchase",
        )
        .with_metadata(serde_json::json!({
            "provider": event.provider,
            "external_id": event.external_id,
            "plan_id": event.plan_id,
            "amount_minor": event.amount_minor,
            "currency": event.currency,
        }));

        let outcome = match self.ledger.apply(request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(
                    external_id = %event.external_id,
                    error = %err,
                    "Ledger credit failed for recorded payment"
                );
                self.store
                    .append_audit(&AuditRecord::new(
                        AuditKind::LedgerFailure,
                        event.external_id.clone(),
                        serde_json::json!({
                            "provider": event.provider,
                            "account_id": event.account_id,
                            "credits": event.credits,
                            "error": err.to_string(),
                        }),
                    ))
                    .await?;
                return Err(err.into());
            }
        };

        record.status = PaymentStatus::Applied;
        record.updated_at = Utc::now();
        self.store.save_payment(&record).await?;

        if !outcome.is_new() {
            tracing::debug!(
                external_id = %record.event.external_id,
                "Payment credited by a concurrent delivery"
            );
            return Ok(GatewayOutcome::Duplicate {
                external_id: record.event.external_id,
            });
        }

        tracing::info!(
            external_id = %record.event.external_id,
            account_id = %record.event.account_id,
            plan_id = %record.event.plan_id,
            credits = record.event.credits,
            "Payment credited"
        );

        Ok(GatewayOutcome::Accepted {
            credited: record.event.credits,
            external_id: record.event.external_id,
            payment_status: PaymentStatus::Applied,
        })
    }

    async fn record_failure(&self, mut record: PaymentRecord) -> Result<GatewayOutcome, GatewayError> {
        if let Some(entry) = self.store.get_entry_by_key(&payment_key(&record.event)).await? {
            tracing::warn!(
                external_id = %record.event.external_id,
                entry_id = %entry.id,
                "Failure reported for a payment that was already credited"
            );
            if let Some(mut stored) = self.store.get_payment(&record.event.external_id).await? {
                if stored.status != PaymentStatus::Applied {
                    stored.status = PaymentStatus::Applied;
                    stored.updated_at = Utc::now();
                    self.store.save_payment(&stored).await?;
                }
            }
            return Ok(GatewayOutcome::Duplicate {
                external_id: record.event.external_id,
            });
        }

        tracing::warn!(
            external_id = %record.event.external_id,
            account_id = %record.event.account_id,
            "Provider reported failed payment"
        );
        self.store
            .append_audit(&AuditRecord::new(
                AuditKind::PaymentFailed,
                record.event.external_id.clone(),
                serde_json::json!({
                    "provider": record.event.provider,
                    "account_id": record.event.account_id,
                    "plan_id": record.event.plan_id,
                    "amount_minor": record.event.amount_minor,
                    "currency": record.event.currency,
                }),
            ))
            .await?;

        record.status = PaymentStatus::Failed;
        record.updated_at = Utc::now();
        if !self.store.save_payment(&record).await? {
            return Ok(GatewayOutcome::Duplicate {
                external_id: record.event.external_id,
            });
        }

        Ok(GatewayOutcome::Accepted {
            external_id: record.event.external_id,
            payment_status: PaymentStatus::Failed,
            credited: 0,
        })
    }

    async fn reject(
        &self,
        payload: ProviderPayload<'_>,
        subject: Option<String>,
        rejection: Rejection,
    ) -> Result<GatewayOutcome, GatewayError> {
        let provider = payload.provider();
        tracing::warn!(
            provider = %provider,
            code = rejection.code(),
            reason = %rejection,
            "Webhook rejected"
        );

        let body = serde_json::from_slice::<serde_json::Value>(payload.raw()).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(payload.raw()).into_owned())
        });
        self.store
            .append_audit(&AuditRecord::new(
                AuditKind::WebhookRejected,
                subject.unwrap_or_else(|| provider.to_string()),
                serde_json::json!({
                    "provider": provider,
                    "code": rejection.code(),
                    "reason": rejection.to_string(),
                    "payload": body,
                }),
            ))
            .await?;

        Ok(GatewayOutcome::Rejected {
            code: rejection.code(),
            reason: rejection.to_string(),
        })
    }
}

/// Ledger idempotency key of the credit for a provider payment.
fn payment_key(event: &PaymentEvent) -> String {
    format!("payment:{}:{}", event.provider, event.external_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagecredit_store::MemoryStore;

    fn gateway() -> (ReconciliationGateway, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let ledger = CreditLedger::new(store.clone());
        let gateway =
            ReconciliationGateway::new(store.clone(), ledger, Arc::new(PricingConfig::default()));
        (gateway, store)
    }

    fn paypal(event_type: &str, capture_id: &str, plan: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "id": format!("WH-{capture_id}"),
            "event_type": event_type,
            "resource": {
                "id": capture_id,
                "custom_id": format!("acct_1|{plan}"),
                "amount": {"value": "10.00", "currency_code": "USD"},
            }
        }))
        .unwrap()
    }

    fn account() -> AccountId {
        AccountId::new("acct_1").unwrap()
    }

    #[tokio::test]
    async fn redelivery_credits_once() {
        let (gateway, store) = gateway();
        let body = paypal(paypal::CAPTURE_COMPLETED, "cap_123", "credits_100");

        let first = gateway.handle(ProviderPayload::PayPal(&body)).await.unwrap();
        let second = gateway.handle(ProviderPayload::PayPal(&body)).await.unwrap();
        let third = gateway.handle(ProviderPayload::PayPal(&body)).await.unwrap();

        assert!(matches!(first, GatewayOutcome::Accepted { credited: 100, .. }));
        assert!(matches!(second, GatewayOutcome::Duplicate { .. }));
        assert!(matches!(third, GatewayOutcome::Duplicate { .. }));
        assert_eq!(store.get_account(&account()).await.unwrap().unwrap().balance, 100);
        assert_eq!(store.list_entries(&account(), 10, 0).await.unwrap().len(), 1);

        let record = store.get_payment("cap_123").await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Applied);
    }

    #[tokio::test]
    async fn unknown_plan_is_rejected_and_audited() {
        let (gateway, store) = gateway();
        let body = paypal(paypal::CAPTURE_COMPLETED, "cap_9", "MYSTERY_PLAN");

        let outcome = gateway.handle(ProviderPayload::PayPal(&body)).await.unwrap();

        assert!(matches!(outcome, GatewayOutcome::Rejected { code: "unknown_plan", .. }));
        assert!(store.list_entries(&account(), 10, 0).await.unwrap().is_empty());
        assert!(store.get_payment("cap_9").await.unwrap().is_none());
        let audit = store
            .list_audit(Some(AuditKind::WebhookRejected), Some("cap_9"), 10)
            .await
            .unwrap();
        assert_eq!(audit.len(), 1);
    }

    #[tokio::test]
    async fn failed_payment_is_audited_without_credit() {
        let (gateway, store) = gateway();
        let body = paypal(paypal::CAPTURE_DENIED, "cap_7", "credits_100");

        let outcome = gateway.handle(ProviderPayload::PayPal(&body)).await.unwrap();

        assert!(matches!(
            outcome,
            GatewayOutcome::Accepted {
                payment_status: PaymentStatus::Failed,
                credited: 0,
                ..
            }
        ));
        assert!(store.get_account(&account()).await.unwrap().is_none());
        let audit = store
            .list_audit(Some(AuditKind::PaymentFailed), None, 10)
            .await
            .unwrap();
        assert_eq!(audit.len(), 1);
    }

    #[tokio::test]
    async fn failed_then_completed_upgrades() {
        let (gateway, store) = gateway();
        let denied = paypal(paypal::CAPTURE_DENIED, "cap_8", "credits_500");
        let completed = paypal(paypal::CAPTURE_COMPLETED, "cap_8", "credits_500");

        gateway.handle(ProviderPayload::PayPal(&denied)).await.unwrap();
        let again = gateway.handle(ProviderPayload::PayPal(&denied)).await.unwrap();
        let upgraded = gateway.handle(ProviderPayload::PayPal(&completed)).await.unwrap();

        assert!(matches!(again, GatewayOutcome::Duplicate { .. }));
        assert!(matches!(upgraded, GatewayOutcome::Accepted { credited: 500, .. }));
        assert_eq!(store.get_account(&account()).await.unwrap().unwrap().balance, 500);
    }

    #[tokio::test]
    async fn received_record_is_retried() {
        let (gateway, store) = gateway();
        let body = paypal(paypal::CAPTURE_COMPLETED, "cap_5", "credits_100");
        let Normalized::Payment(parsed) = paypal::parse(&body).unwrap() else {
            panic!("expected a payment");
        };
        store
            .insert_payment_if_absent(&PaymentRecord::received(parsed.into_event(100)))
            .await
            .unwrap();

        let outcome = gateway.handle(ProviderPayload::PayPal(&body)).await.unwrap();

        assert!(matches!(outcome, GatewayOutcome::Accepted { credited: 100, .. }));
        assert_eq!(store.get_account(&account()).await.unwrap().unwrap().balance, 100);
    }

    #[tokio::test]
    async fn failure_after_committed_credit_is_a_duplicate() {
        let (gateway, store) = gateway();
        let completed = paypal(paypal::CAPTURE_COMPLETED, "cap_6", "credits_100");
        let Normalized::Payment(parsed) = paypal::parse(&completed).unwrap() else {
            panic!("expected a payment");
        };
        let event = parsed.into_event(100);
        store
            .insert_payment_if_absent(&PaymentRecord::received(event.clone()))
            .await
            .unwrap();
        store
            .apply_entry(EntryRequest::credit(
                EntryKind::Purchase,
                account(),
                100,
                payment_key(&event),
                "purchase",
            ))
            .await
            .unwrap();

        let denied = paypal(paypal::CAPTURE_DENIED, "cap_6", "credits_100");
        let outcome = gateway.handle(ProviderPayload::PayPal(&denied)).await.unwrap();

        assert!(matches!(outcome, GatewayOutcome::Duplicate { .. }));
        let record = store.get_payment("cap_6").await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Applied);
        assert!(store
            .list_audit(Some(AuditKind::PaymentFailed), None, 10)
            .await
            .unwrap()
            .is_empty());

        let again = gateway.handle(ProviderPayload::PayPal(&completed)).await.unwrap();
        assert!(matches!(again, GatewayOutcome::Duplicate { .. }));
        assert_eq!(store.get_account(&account()).await.unwrap().unwrap().balance, 100);
    }

    #[tokio::test]
    async fn malformed_body_is_rejected() {
        let (gateway, store) = gateway();
        let outcome = gateway.handle(ProviderPayload::Stripe(b"{")).await.unwrap();

        assert!(matches!(outcome, GatewayOutcome::Rejected { code: "malformed", .. }));
        let audit = store.list_audit(Some(AuditKind::WebhookRejected), None, 10).await.unwrap();
        assert_eq!(audit[0].subject, "stripe");
    }
}
