//! Byte quantities with binary and decimal suffixes (`512Mi`, `16Gi`, `4G`)

use serde::de::{self, Deserializer, Visitor};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid quantity '{value}': {reason}")]
pub struct QuantityError {
    pub value: String,
    pub reason: &'static str,
}

const SUFFIXES: &[(&str, u64)] = &[
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
];

/// Parse a byte quantity. A bare integer is taken as bytes.
pub fn parse_bytes(value: &str) -> Result<u64, QuantityError> {
    let error = |reason| QuantityError {
        value: value.to_string(),
        reason,
    };

    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(error("empty"));
    }

    let (digits, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, multiplier)| {
            trimmed
                .strip_suffix(suffix)
                .map(|digits| (digits, *multiplier))
        })
        .unwrap_or((trimmed, 1));

    let number: u64 = digits
        .parse()
        .map_err(|_| error("expected an unsigned integer with an optional suffix"))?;
    number.checked_mul(multiplier).ok_or_else(|| error("overflows u64"))
}

/// Render bytes with the largest binary suffix that divides them exactly
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0".to_string();
    }
    for (suffix, multiplier) in SUFFIXES[..5].iter().rev() {
        if bytes % multiplier == 0 {
            return format!("{}{}", bytes / multiplier, suffix);
        }
    }
    bytes.to_string()
}

/// serde helper accepting either an integer or a suffixed string
pub fn deserialize_bytes<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = u64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a byte count or a quantity such as \"16Gi\"")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<u64, E> {
            Ok(value)
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<u64, E> {
            u64::try_from(value).map_err(|_| E::custom("quantity must not be negative"))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<u64, E> {
            parse_bytes(value).map_err(E::custom)
        }
    }

    deserializer.deserialize_any(BytesVisitor)
}
