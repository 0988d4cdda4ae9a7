//! PayPal capture webhook payloads.

use serde::Deserialize;

use pagecredit_core::{decimal_to_minor, AccountId, PaymentOutcome, Provider};

use super::{Normalized, ParsedPayment, Rejection};

/// Capture settled.
pub const CAPTURE_COMPLETED: &str = "PAYMENT.CAPTURE.COMPLETED";
/// Capture denied by PayPal.
pub const CAPTURE_DENIED: &str = "PAYMENT.CAPTURE.DENIED";
/// Capture declined by the funding source.
pub const CAPTURE_DECLINED: &str = "PAYMENT.CAPTURE.DECLINED";

/// Separator between account id and plan id in `custom_id`.
const CUSTOM_ID_SEPARATOR: char = '|';

/// PayPal webhook envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct PayPalEvent {
    /// Webhook event id (`WH-...`).
    pub id: String,
    /// Event type.
    pub event_type: String,
    /// The resource the event is about.
    pub resource: serde_json::Value,
}

/// The subset of a capture resource this service reads.
#[derive(Debug, Clone, Deserialize)]
pub struct Capture {
    /// Capture id, used as the external payment id.
    pub id: String,
    /// `"<account_id>|<plan_id>"`, set when the order was created.
    pub custom_id: Option<String>,
    /// Captured amount.
    pub amount: Option<Amount>,
}

/// PayPal money value.
#[derive(Debug, Clone, Deserialize)]
pub struct Amount {
    /// Decimal string, e.g. `"10.00"`.
    pub value: String,
    /// ISO currency code.
    pub currency_code: String,
}

fn split_custom_id(custom_id: &str) -> Option<(&str, &str)> {
    let (account, plan) = custom_id.split_once(CUSTOM_ID_SEPARATOR)?;
    let (account, plan) = (account.trim(), plan.trim());
    (!account.is_empty() && !plan.is_empty()).then_some((account, plan))
}

/// Normalize a PayPal webhook body.
///
/// # Errors
///
/// Returns `Malformed` for unreadable bodies, a missing or badly formed
/// `custom_id`, or an unparseable amount, and `UnsupportedEvent` for other
/// event types.
pub fn parse(raw: &[u8]) -> Result<Normalized, Rejection> {
    let event: PayPalEvent =
        serde_json::from_slice(raw).map_err(|e| Rejection::Malformed(e.to_string()))?;

    let outcome = match event.event_type.as_str() {
        CAPTURE_COMPLETED => PaymentOutcome::Completed,
        CAPTURE_DENIED | CAPTURE_DECLINED => PaymentOutcome::Failed,
        other => return Err(Rejection::UnsupportedEvent(other.to_string())),
    };

    let capture: Capture = serde_json::from_value(event.resource.clone())
        .map_err(|e| Rejection::Malformed(format!("capture resource: {e}")))?;
    if capture.id.is_empty() {
        return Err(Rejection::Malformed("missing capture id".into()));
    }

    let (account_id, plan_id) = capture
        .custom_id
        .as_deref()
        .and_then(split_custom_id)
        .ok_or_else(|| Rejection::Malformed("custom_id must be <account_id>|<plan_id>".into()))?;
    let account_id = account_id
        .parse::<AccountId>()
        .map_err(|e| Rejection::Malformed(format!("account id: {e}")))?;
    let plan_id = plan_id.to_string();

    let (amount_minor, currency) = match &capture.amount {
        Some(amount) => (
            decimal_to_minor(&amount.value).map_err(|e| Rejection::Malformed(e.to_string()))?,
            amount.currency_code.to_uppercase(),
        ),
        None => (0, String::new()),
    };

    let raw_payload =
        serde_json::from_slice(raw).map_err(|e| Rejection::Malformed(e.to_string()))?;

    tracing::debug!(event_id = %event.id, capture_id = %capture.id, "Parsed PayPal event");

    Ok(Normalized::Payment(ParsedPayment {
        provider: Provider::PayPal,
        external_id: capture.id,
        account_id,
        plan_id,
        amount_minor,
        currency,
        outcome,
        raw_payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(event_type: &str, custom_id: &str, value: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "id": "WH-1",
            "event_type": event_type,
            "resource": {
                "id": "cap_123",
                "custom_id": custom_id,
                "amount": {"value": value, "currency_code": "usd"},
            }
        }))
        .unwrap()
    }

    #[test]
    fn completed_capture() {
        let raw = body(CAPTURE_COMPLETED, "acct_1|credits_100", "10.00");
        let Normalized::Payment(payment) = parse(&raw).unwrap() else {
            panic!("expected a payment");
        };
        assert_eq!(payment.provider, Provider::PayPal);
        assert_eq!(payment.external_id, "cap_123");
        assert_eq!(payment.account_id.as_str(), "acct_1");
        assert_eq!(payment.plan_id, "credits_100");
        assert_eq!(payment.amount_minor, 1000);
        assert_eq!(payment.currency, "USD");
        assert_eq!(payment.outcome, PaymentOutcome::Completed);
    }

    #[test]
    fn denied_and_declined_are_failed() {
        for event_type in [CAPTURE_DENIED, CAPTURE_DECLINED] {
            let Normalized::Payment(payment) =
                parse(&body(event_type, "acct_1|credits_100", "10.00")).unwrap()
            else {
                panic!("expected a payment");
            };
            assert_eq!(payment.outcome, PaymentOutcome::Failed);
        }
    }

    #[test]
    fn custom_id_without_plan_is_malformed() {
        for custom_id in ["acct_1", "acct_1|", "|credits_100"] {
            let raw = body(CAPTURE_COMPLETED, custom_id, "10.00");
            assert!(matches!(parse(&raw), Err(Rejection::Malformed(_))), "{custom_id}");
        }
    }

    #[test]
    fn sub_cent_amount_is_malformed() {
        let raw = body(CAPTURE_COMPLETED, "acct_1|credits_100", "10.001");
        assert!(matches!(parse(&raw), Err(Rejection::Malformed(_))));
    }

    #[test]
    fn refunds_are_unsupported() {
        let raw = body("PAYMENT.CAPTURE.REFUNDED", "acct_1|credits_100", "10.00");
        assert!(matches!(parse(&raw), Err(Rejection::UnsupportedEvent(_))));
    }
}
