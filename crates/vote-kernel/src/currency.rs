//! Conversion of user-facing decimal amounts into the currency's smallest unit.

use num_bigint::BigUint;
use num_traits::Zero;

use crate::error::VoteError;

/// `10^decimals` as a big integer: one whole unit of currency.
pub fn one_unit(decimals: u32) -> BigUint {
    BigUint::from(10u32).pow(decimals)
}

/// Parse a positive decimal string (e.g. `"1.25"`) into smallest units.
///
/// Rejects empty input, signs, exponents, more fractional digits than
/// `decimals`, and zero.
pub fn to_smallest_unit(amount: &str, decimals: u32) -> Result<BigUint, VoteError> {
    let invalid = || VoteError::InvalidAmount(amount.to_string());
    let trimmed = amount.trim();
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let (whole, fraction) = match trimmed.split_once('.') {
        Some((w, f)) => (w, f),
        None => (trimmed, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return Err(invalid());
    }
    if fraction.len() > decimals as usize {
        return Err(invalid());
    }

    let mut digits = String::with_capacity(whole.len() + decimals as usize);
    digits.push_str(whole);
    digits.push_str(fraction);
    for _ in fraction.len()..decimals as usize {
        digits.push('0');
    }

    let value = BigUint::parse_bytes(digits.as_bytes(), 10).ok_or_else(invalid)?;
    if value.is_zero() {
        return Err(invalid());
    }
    Ok(value)
}

/// Parse a whole-number string of smallest units (used for config values).
pub fn parse_units(value: &str) -> Option<BigUint> {
    BigUint::parse_bytes(value.trim().as_bytes(), 10)
}

/// Multiply `value` by `numerator / denominator`, flooring the result.
pub fn scale(value: &BigUint, numerator: u64, denominator: u64) -> BigUint {
    if denominator == 0 {
        return value.clone();
    }
    value * numerator / denominator
}

/// Serde adapter writing big integers as decimal strings and accepting either
/// strings or plain integers when reading.
pub mod serde_units {
    use num_bigint::BigUint;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Number(u64),
    }

    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_str_radix(10))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(BigUint::from(n)),
            Repr::Text(text) => super::parse_units(&text)
                .ok_or_else(|| D::Error::custom(format!("invalid unit amount {text:?}"))),
        }
    }
}
