use thiserror::Error;

/// Amounts are signed integers in the currency's minor unit (cents for
/// USD/EUR), so every balance movement is exact.
pub type Cents = i64;

/// Sum of many `Cents` values, wide enough that it cannot overflow.
pub type CentsTotal = i128;

/// Render minor units as a decimal string, e.g. `-1234` -> `"-12.34"`.
pub fn format_cents(cents: impl Into<CentsTotal>) -> String {
    let cents: CentsTotal = cents.into();
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseCentsError {
    #[error("invalid money format: {0:?}")]
    InvalidFormat(String),

    #[error("amount out of range: {0:?}")]
    OutOfRange(String),
}

/// Parse a decimal string into minor units.
/// `"50"` -> 5000, `"12.5"` -> 1250, `".05"` -> 5. More than two decimals is an error.
pub fn parse_cents(input: &str) -> Result<Cents, ParseCentsError> {
    let trimmed = input.trim();
    let invalid = || ParseCentsError::InvalidFormat(input.to_string());
    let out_of_range = || ParseCentsError::OutOfRange(input.to_string());

    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };

    let (units_str, fraction_str) = match digits.split_once('.') {
        Some((units, fraction)) => (units, fraction),
        None => (digits, ""),
    };

    if units_str.is_empty() && fraction_str.is_empty() {
        return Err(invalid());
    }
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(units_str) || !all_digits(fraction_str) || fraction_str.len() > 2 {
        return Err(invalid());
    }

    let units: i64 = if units_str.is_empty() {
        0
    } else {
        units_str.parse().map_err(|_| out_of_range())?
    };
    let fraction: i64 = match fraction_str.len() {
        0 => 0,
        1 => fraction_str.parse::<i64>().map_err(|_| invalid())? * 10,
        _ => fraction_str.parse().map_err(|_| invalid())?,
    };

    let cents = units
        .checked_mul(100)
        .and_then(|c| c.checked_add(fraction))
        .ok_or_else(out_of_range)?;
    Ok(if negative { -cents } else { cents })
}
