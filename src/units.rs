//! Human-readable size parsing

use thiserror::Error;

/// Parse a size such as `8Gi`, `64Mi`, `1.5G` or `4096`
///
/// Suffixes are case-insensitive and always denote binary multiples, so `1k`
/// and `1Ki` both mean 1024 bytes. Fractional sizes are rounded down to a
/// whole number of bytes.
///
pub fn parse_size(input: &str) -> Result<u64, ParseSizeError> {
    let normalized = input.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return Err(ParseSizeError::Empty);
    }
    let (mantissa, multiplier) = SUFFIXES
        .iter()
        .find_map(|&(suffix, multiplier)| {
            normalized
                .strip_suffix(suffix)
                .map(|mantissa| (mantissa.trim_end(), multiplier))
        })
        .unwrap_or((normalized.as_str(), 1));

    if let Ok(bytes) = mantissa.parse::<u64>() {
        return bytes
            .checked_mul(multiplier)
            .ok_or_else(|| ParseSizeError::TooLarge(input.to_owned()));
    }
    let value = mantissa
        .parse::<f64>()
        .map_err(|_| ParseSizeError::Invalid(input.to_owned()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ParseSizeError::Invalid(input.to_owned()));
    }
    let bytes = value * multiplier as f64;
    if bytes >= u64::MAX as f64 {
        return Err(ParseSizeError::TooLarge(input.to_owned()));
    }
    Ok(bytes as u64)
}

/// Recognized size suffixes and their multipliers
const SUFFIXES: [(&str, u64); 8] = [
    ("ki", 1 << 10),
    ("mi", 1 << 20),
    ("gi", 1 << 30),
    ("ti", 1 << 40),
    ("k", 1 << 10),
    ("m", 1 << 20),
    ("g", 1 << 30),
    ("t", 1 << 40),
];

/// A size could not be parsed
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ParseSizeError {
    /// Nothing to parse
    #[error("empty size")]
    Empty,

    /// Not a nonnegative number with an optional unit suffix
    #[error("invalid size {0:?}, expected a number with an optional k/Ki/M/Mi/G/Gi/T/Ti suffix")]
    Invalid(String),

    /// Doesn't fit in 64 bits
    #[error("size {0:?} is too large")]
    TooLarge(String),
}
