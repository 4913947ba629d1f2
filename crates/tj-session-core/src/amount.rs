//! Decimal amount ↔ base unit conversion.
//!
//! Amounts are carried as `u128` base units; `u128` holds every value up to
//! 10^38, enough for 18-decimal currencies with twenty integer digits to spare.

use thiserror::Error;

const MAX_DECIMALS: u8 = 38;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("amount is empty")]
    Empty,
    #[error("amount cannot be negative: {0}")]
    Negative(String),
    #[error("amount is not a decimal number: {0}")]
    NotDecimal(String),
    #[error("amount {input} has more than {decimals} fractional digits")]
    TooPrecise { input: String, decimals: u8 },
    #[error("amount is too large: {0}")]
    Overflow(String),
    #[error("currency precision {0} is not supported")]
    UnsupportedDecimals(u8),
}

/// Parses a human-entered decimal such as `"0.001"` into base units.
pub fn parse_base_units(input: &str, decimals: u8) -> Result<u128, AmountError> {
    if decimals > MAX_DECIMALS {
        return Err(AmountError::UnsupportedDecimals(decimals));
    }

    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AmountError::Empty);
    }
    if trimmed.starts_with('-') {
        return Err(AmountError::Negative(trimmed.to_owned()));
    }

    let (whole, fraction) = match trimmed.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (trimmed, ""),
    };
    let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    if (whole.is_empty() && fraction.is_empty()) || !all_digits(whole) || !all_digits(fraction) {
        return Err(AmountError::NotDecimal(trimmed.to_owned()));
    }

    // Trailing zeros never make an amount too precise.
    let fraction = fraction.trim_end_matches('0');
    if fraction.len() > usize::from(decimals) {
        return Err(AmountError::TooPrecise {
            input: trimmed.to_owned(),
            decimals,
        });
    }

    let overflow = || AmountError::Overflow(trimmed.to_owned());
    let scale = 10_u128.pow(u32::from(decimals));
    let whole_units = if whole.is_empty() {
        0
    } else {
        whole.parse::<u128>().map_err(|_| overflow())?
    };
    let fraction_units = if fraction.is_empty() {
        0
    } else {
        let padding = 10_u128.pow((usize::from(decimals) - fraction.len()) as u32);
        fraction.parse::<u128>().map_err(|_| overflow())? * padding
    };

    whole_units
        .checked_mul(scale)
        .and_then(|units| units.checked_add(fraction_units))
        .ok_or_else(overflow)
}

/// Renders base units as a decimal string without trailing zeros.
pub fn format_base_units(units: u128, decimals: u8) -> String {
    let decimals = decimals.min(MAX_DECIMALS);
    let scale = 10_u128.pow(u32::from(decimals));
    let whole = units / scale;
    let fraction = units % scale;
    if fraction == 0 {
        return whole.to_string();
    }
    let fraction = format!("{fraction:0width$}", width = usize::from(decimals));
    format!("{whole}.{}", fraction.trim_end_matches('0'))
}
