//! Stripe Checkout webhook payloads.

use std::collections::HashMap;

use serde::Deserialize;

use pagecredit_core::{AccountId, PaymentOutcome, Provider};

use super::{Normalized, ParsedPayment, Rejection};

/// Checkout session finished; paid unless `payment_status` says otherwise.
pub const SESSION_COMPLETED: &str = "checkout.session.completed";
/// Delayed payment method succeeded.
pub const ASYNC_PAYMENT_SUCCEEDED: &str = "checkout.session.async_payment_succeeded";
/// Delayed payment method failed.
pub const ASYNC_PAYMENT_FAILED: &str = "checkout.session.async_payment_failed";
/// Session expired without payment.
pub const SESSION_EXPIRED: &str = "checkout.session.expired";

/// Stripe event envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    /// Event id (`evt_...`).
    pub id: String,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event data.
    pub data: StripeEventData,
}

/// Stripe event data container.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    /// The object the event is about; its shape depends on the event type.
    pub object: serde_json::Value,
}

/// The subset of a Checkout Session this service reads.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    /// Session id (`cs_...`), used as the external payment id.
    pub id: String,
    /// Account id set by the frontend when creating the session.
    pub client_reference_id: Option<String>,
    /// Free-form metadata; carries `plan_id`.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Total in minor units.
    pub amount_total: Option<i64>,
    /// Lowercase ISO currency.
    pub currency: Option<String>,
    /// `paid`, `unpaid` or `no_payment_required`.
    pub payment_status: Option<String>,
}

impl CheckoutSession {
    fn account_id(&self) -> Option<&str> {
        self.client_reference_id
            .as_deref()
            .or_else(|| self.metadata.get("account_id").map(String::as_str))
            .filter(|id| !id.is_empty())
    }

    fn is_paid(&self) -> bool {
        matches!(
            self.payment_status.as_deref(),
            Some("paid" | "no_payment_required")
        )
    }
}

/// Normalize a Stripe webhook body.
///
/// # Errors
///
/// Returns `Malformed` when the body or session is unreadable or lacks an account
/// or plan, and `UnsupportedEvent` for event types this service does not consume.
pub fn parse(raw: &[u8]) -> Result<Normalized, Rejection> {
    let event: StripeEvent =
        serde_json::from_slice(raw).map_err(|e| Rejection::Malformed(e.to_string()))?;

    let outcome = match event.event_type.as_str() {
        SESSION_COMPLETED | ASYNC_PAYMENT_SUCCEEDED => PaymentOutcome::Completed,
        ASYNC_PAYMENT_FAILED | SESSION_EXPIRED => PaymentOutcome::Failed,
        other => return Err(Rejection::UnsupportedEvent(other.to_string())),
    };

    let session: CheckoutSession = serde_json::from_value(event.data.object.clone())
        .map_err(|e| Rejection::Malformed(format!("checkout session: {e}")))?;

    // Async payment methods complete the session before the money moves.
    if event.event_type == SESSION_COMPLETED && !session.is_paid() {
        return Ok(Normalized::Ignored(format!(
            "session {} completed with payment_status {}",
            session.id,
            session.payment_status.as_deref().unwrap_or("none")
        )));
    }

    if session.id.is_empty() {
        return Err(Rejection::Malformed("missing session id".into()));
    }
    let account_id = session
        .account_id()
        .ok_or_else(|| Rejection::Malformed("missing client_reference_id".into()))?;
    let account_id = account_id
        .parse::<AccountId>()
        .map_err(|e| Rejection::Malformed(format!("account id: {e}")))?;
    let plan_id = session
        .metadata
        .get("plan_id")
        .filter(|plan| !plan.is_empty())
        .ok_or_else(|| Rejection::Malformed("missing metadata.plan_id".into()))?
        .clone();

    let raw_payload =
        serde_json::from_slice(raw).map_err(|e| Rejection::Malformed(e.to_string()))?;

    tracing::debug!(event_id = %event.id, session_id = %session.id, "Parsed Stripe event");

    Ok(Normalized::Payment(ParsedPayment {
        provider: Provider::Stripe,
        external_id: session.id,
        account_id,
        plan_id,
        amount_minor: session.amount_total.unwrap_or(0),
        currency: session.currency.unwrap_or_default().to_uppercase(),
        outcome,
        raw_payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(event_type: &str, payment_status: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "id": "evt_1",
            "type": event_type,
            "data": {"object": {
                "id": "cs_test_1",
                "client_reference_id": "acct_1",
                "metadata": {"plan_id": "credits_500"},
                "amount_total": 4500,
                "currency": "usd",
                "payment_status": payment_status,
            }}
        }))
        .unwrap()
    }

    #[test]
    fn paid_session_is_completed_payment() {
        let Normalized::Payment(payment) = parse(&body(SESSION_COMPLETED, "paid")).unwrap() else {
            panic!("expected a payment");
        };
        assert_eq!(payment.external_id, "cs_test_1");
        assert_eq!(payment.account_id.as_str(), "acct_1");
        assert_eq!(payment.plan_id, "credits_500");
        assert_eq!(payment.amount_minor, 4500);
        assert_eq!(payment.currency, "USD");
        assert_eq!(payment.outcome, PaymentOutcome::Completed);
    }

    #[test]
    fn unpaid_completed_session_is_ignored() {
        assert!(matches!(
            parse(&body(SESSION_COMPLETED, "unpaid")).unwrap(),
            Normalized::Ignored(_)
        ));
    }

    #[test]
    fn async_failure_and_expiry_are_failed_payments() {
        for event_type in [ASYNC_PAYMENT_FAILED, SESSION_EXPIRED] {
            let Normalized::Payment(payment) = parse(&body(event_type, "unpaid")).unwrap() else {
                panic!("expected a payment");
            };
            assert_eq!(payment.outcome, PaymentOutcome::Failed);
        }
    }

    #[test]
    fn other_event_types_are_unsupported() {
        let raw = br#"{"id":"evt_2","type":"invoice.paid","data":{"object":{"id":"in_1"}}}"#;
        assert!(matches!(parse(raw), Err(Rejection::UnsupportedEvent(t)) if t == "invoice.paid"));
    }

    #[test]
    fn missing_plan_is_malformed() {
        let raw = br#"{"id":"evt_3","type":"checkout.session.completed",
            "data":{"object":{"id":"cs_1","client_reference_id":"acct_1","payment_status":"paid"}}}"#;
        assert!(matches!(parse(raw), Err(Rejection::Malformed(_))));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(parse(b"not json"), Err(Rejection::Malformed(_))));
    }
}
