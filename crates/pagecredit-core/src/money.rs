//! Conversion of provider decimal amounts into minor units.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::error::BillingError;

/// Parse a decimal amount string (e.g. `"10.00"`) into minor units (`1000`).
///
/// Two decimal places are assumed; amounts with sub-cent precision are rejected
/// rather than rounded.
///
/// # Errors
///
/// Returns `BillingError::InvalidAmount` for unparseable, negative, fractional-cent,
/// or out-of-range amounts.
pub fn decimal_to_minor(value: &str) -> Result<i64, BillingError> {
    let amount = Decimal::from_str(value.trim())
        .map_err(|_| BillingError::InvalidAmount(format!("not a decimal: {value}")))?;

    if amount.is_sign_negative() {
        return Err(BillingError::InvalidAmount(format!("negative amount: {value}")));
    }

    let minor = amount * Decimal::ONE_HUNDRED;
    if minor.fract() != Decimal::ZERO {
        return Err(BillingError::InvalidAmount(format!(
            "sub-cent precision: {value}"
        )));
    }

    minor
        .to_i64()
        .ok_or_else(|| BillingError::InvalidAmount(format!("out of range: {value}")))
}
