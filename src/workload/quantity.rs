//! CPU quantity parsing.
//!
//! Converts Kubernetes resource quantities (e.g. "500m", "2", "1.5", "1e3",
//! "2k", "100u") into whole millicores. Fractions of a millicore round up,
//! matching how the API server reports `MilliValue()`.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

/// Decimal exponent range accepted; anything above overflows i64 millicores
const MIN_EXPONENT: i32 = -64;
const MAX_EXPONENT: i32 = 18;

/// Error returned for a quantity outside the Kubernetes quantity grammar
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuantityError {
    #[error("invalid quantity '{0}'")]
    Invalid(String),

    #[error("quantity '{0}' is out of range")]
    OutOfRange(String),
}

/// Multiplier implied by a quantity suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scale {
    /// value * 10^n
    Decimal(i32),
    /// value * 2^n
    Binary(u32),
}

fn parse_suffix(suffix: &str) -> Option<Scale> {
    let scale = match suffix {
        "" => Scale::Decimal(0),
        "n" => Scale::Decimal(-9),
        "u" => Scale::Decimal(-6),
        "m" => Scale::Decimal(-3),
        "k" => Scale::Decimal(3),
        "M" => Scale::Decimal(6),
        "G" => Scale::Decimal(9),
        "T" => Scale::Decimal(12),
        "P" => Scale::Decimal(15),
        "E" => Scale::Decimal(18),
        "Ki" => Scale::Binary(10),
        "Mi" => Scale::Binary(20),
        "Gi" => Scale::Binary(30),
        "Ti" => Scale::Binary(40),
        "Pi" => Scale::Binary(50),
        "Ei" => Scale::Binary(60),
        _ => {
            // Scientific notation: "e3", "E-2"
            let exp = suffix.strip_prefix(['e', 'E'])?;
            let digits = exp.strip_prefix(['+', '-']).unwrap_or(exp);
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            Scale::Decimal(exp.parse().ok()?)
        }
    };
    Some(scale)
}

/// Parse a CPU quantity into millicores, rounding up
pub fn cpu_millis(quantity: &Quantity) -> Result<i64, QuantityError> {
    parse_millis(&quantity.0)
}

/// Parse a quantity string into millicores, rounding up
pub fn parse_millis(raw: &str) -> Result<i64, QuantityError> {
    let invalid = || QuantityError::Invalid(raw.to_string());
    let out_of_range = || QuantityError::OutOfRange(raw.to_string());

    let s = raw.trim();
    let (negative, unsigned) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let number_len = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(number_len);

    let (whole, fraction) = match number.split_once('.') {
        Some((w, f)) => (w, f),
        None => (number, ""),
    };
    if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
        return Err(invalid());
    }

    let scale = parse_suffix(suffix).ok_or_else(invalid)?;

    // Mantissa as an integer with `fraction.len()` implied decimal places
    let mut mantissa: i128 = 0;
    for digit in whole.bytes().chain(fraction.bytes()) {
        mantissa = mantissa
            .checked_mul(10)
            .and_then(|m| m.checked_add(i128::from(digit - b'0')))
            .ok_or_else(out_of_range)?;
    }
    let fraction_digits = i32::try_from(fraction.len()).map_err(|_| out_of_range())?;

    let millis = match scale {
        Scale::Decimal(exp) => {
            if !(MIN_EXPONENT..=MAX_EXPONENT).contains(&exp) {
                return Err(out_of_range());
            }
            // millicores = mantissa * 10^(exp + 3 - fraction_digits)
            let shift = exp + 3 - fraction_digits;
            if shift >= 0 {
                mantissa
                    .checked_mul(pow10(shift).ok_or_else(out_of_range)?)
                    .ok_or_else(out_of_range)?
            } else {
                match pow10(-shift) {
                    Some(divisor) => ceil_div(mantissa, divisor),
                    // Divisor beyond i128: any non-zero value is below one millicore
                    None => i128::from(mantissa != 0),
                }
            }
        }
        Scale::Binary(bits) => {
            let scaled = mantissa
                .checked_mul(1i128 << bits)
                .and_then(|m| m.checked_mul(1000))
                .ok_or_else(out_of_range)?;
            ceil_div(scaled, pow10(fraction_digits).ok_or_else(out_of_range)?)
        }
    };

    let millis = i64::try_from(millis).map_err(|_| out_of_range())?;
    Ok(if negative { -millis } else { millis })
}

fn pow10(exp: i32) -> Option<i128> {
    10i128.checked_pow(u32::try_from(exp).ok()?)
}

fn ceil_div(value: i128, divisor: i128) -> i128 {
    (value + divisor - 1) / divisor
}
