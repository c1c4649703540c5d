#![forbid(unsafe_code)]

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Number,
    String,
    Time,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullKind {
    Null,
    #[serde(rename = "nan")]
    NaN,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Scalar {
    Null(NullKind),
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl Scalar {
    pub const NULL: Self = Self::Null(NullKind::Null);

    #[must_use]
    pub fn is_missing(&self) -> bool {
        match self {
            Self::Null(_) => true,
            Self::Float64(v) => v.is_nan(),
            _ => false,
        }
    }

    /// Numeric view of the scalar. Booleans and strings are not numbers here:
    /// reducers treat them as present-but-non-numeric cells.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Int64(v) => Some(*v as f64),
            Self::Float64(v) if !v.is_nan() => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float64(a), Self::Float64(b)) => (a.is_nan() && b.is_nan()) || (a == b),
            (Self::Null(NullKind::NaN), Self::Float64(v))
            | (Self::Float64(v), Self::Null(NullKind::NaN)) => v.is_nan(),
            (Self::Int64(a), Self::Float64(b)) | (Self::Float64(b), Self::Int64(a)) => {
                *a as f64 == *b
            }
            (Self::Null(_), Self::Null(_)) => true,
            _ => self == other,
        }
    }

    /// Field type a value of this scalar naturally belongs to.
    #[must_use]
    pub fn natural_type(&self) -> Option<FieldType> {
        match self {
            Self::Null(_) => None,
            Self::Int64(_) | Self::Float64(_) => Some(FieldType::Number),
            Self::Utf8(_) => Some(FieldType::String),
            Self::Bool(_) => Some(FieldType::Other),
        }
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

impl From<Option<f64>> for Scalar {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Self::NULL, Self::Float64)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("value {value:?} does not belong in a {field_type:?} field")]
    FieldTypeMismatch { value: String, field_type: FieldType },
}

/// Check that `value` may be stored in a field of `field_type`. Missing
/// values fit every type.
pub fn check_field_value(field_type: FieldType, value: &Scalar) -> Result<(), TypeError> {
    let fits = match (field_type, value) {
        (_, Scalar::Null(_)) | (FieldType::Other, _) => true,
        (FieldType::Number, Scalar::Int64(_) | Scalar::Float64(_)) => true,
        (FieldType::Time, Scalar::Int64(_) | Scalar::Float64(_)) => true,
        (FieldType::String, Scalar::Utf8(_)) => true,
        _ => false,
    };
    if fits {
        Ok(())
    } else {
        Err(TypeError::FieldTypeMismatch {
            value: format!("{value:?}"),
            field_type,
        })
    }
}

// ---------------------------------------------------------------------------
// Lenient numeric input
// ---------------------------------------------------------------------------

/// A numeric option that callers may supply either as a JSON number or as a
/// string. Strings that do not parse degrade to "unset".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumberOrString {
    Number(f64),
    String(String),
}

impl NumberOrString {
    #[must_use]
    pub fn resolve(&self) -> Option<f64> {
        match self {
            Self::Number(v) => v.is_finite().then_some(*v),
            Self::String(s) => parse_lenient_f64(s),
        }
    }
}

impl From<f64> for NumberOrString {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for NumberOrString {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

/// Parse a user-supplied numeric string. Blank, non-numeric and non-finite
/// input yields `None`; this never fails.
#[must_use]
pub fn parse_lenient_f64(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Deserialize an optional number-or-string field straight into `Option<f64>`.
pub fn deserialize_lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<NumberOrString>::deserialize(deserializer)?;
    let resolved = raw.as_ref().and_then(NumberOrString::resolve);
    if let (Some(NumberOrString::String(text)), None) = (&raw, resolved)
        && !text.trim().is_empty()
    {
        warn!(input = %text, "ignoring non-numeric option value");
    }
    Ok(resolved)
}

// ---------------------------------------------------------------------------
// Decimal helpers
// ---------------------------------------------------------------------------

/// Round to `decimals` fractional digits, halves toward positive infinity.
#[must_use]
pub fn round_decimals(value: f64, decimals: u32) -> f64 {
    let factor = 10_f64.powi(decimals as i32);
    let scaled = value * factor;
    if !scaled.is_finite() {
        return value;
    }
    (scaled + 0.5).floor() / factor
}

/// Number of fractional digits in the shortest round-trip representation.
#[must_use]
pub fn fractional_digits(value: f64) -> u32 {
    if !value.is_finite() {
        return 0;
    }
    let text = value.to_string();
    match text.split_once('.') {
        Some((_, frac)) => frac.len() as u32,
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        FieldType, NullKind, NumberOrString, Scalar, check_field_value, fractional_digits,
        parse_lenient_f64, round_decimals,
    };

    #[test]
    fn nan_counts_as_missing() {
        assert!(Scalar::Float64(f64::NAN).is_missing());
        assert!(Scalar::Null(NullKind::Null).is_missing());
        assert!(!Scalar::Int64(0).is_missing());
        assert_eq!(Scalar::Float64(f64::NAN).as_number(), None);
    }

    #[test]
    fn strings_and_bools_are_not_numbers() {
        assert_eq!(Scalar::Utf8("4".into()).as_number(), None);
        assert_eq!(Scalar::Bool(true).as_number(), None);
        assert_eq!(Scalar::Int64(4).as_number(), Some(4.0));
    }

    #[test]
    fn null_kinds_serialize_with_plain_tags() {
        let nan = serde_json::to_string(&Scalar::Null(NullKind::NaN)).expect("encode");
        assert_eq!(nan, r#"{"kind":"null","value":"nan"}"#);
        let back: Scalar = serde_json::from_str(&nan).expect("decode");
        assert_eq!(back, Scalar::Null(NullKind::NaN));
        let null = serde_json::to_string(&Scalar::NULL).expect("encode");
        assert_eq!(null, r#"{"kind":"null","value":"null"}"#);
    }

    #[test]
    fn semantic_eq_bridges_int_and_float() {
        assert!(Scalar::Int64(3).semantic_eq(&Scalar::Float64(3.0)));
        assert!(Scalar::Float64(f64::NAN).semantic_eq(&Scalar::Null(NullKind::NaN)));
        assert!(!Scalar::Int64(3).semantic_eq(&Scalar::Float64(3.5)));
    }

    #[test]
    fn field_type_check_accepts_missing_everywhere() {
        assert!(check_field_value(FieldType::String, &Scalar::NULL).is_ok());
        assert!(check_field_value(FieldType::Number, &Scalar::Float64(1.5)).is_ok());
        assert!(check_field_value(FieldType::Number, &Scalar::Utf8("x".into())).is_err());
        assert!(check_field_value(FieldType::Other, &Scalar::Bool(false)).is_ok());
    }

    #[test]
    fn lenient_parse_degrades_to_none() {
        assert_eq!(parse_lenient_f64(" 2.5 "), Some(2.5));
        assert_eq!(parse_lenient_f64(""), None);
        assert_eq!(parse_lenient_f64("auto"), None);
        assert_eq!(parse_lenient_f64("inf"), None);
        assert_eq!(NumberOrString::from("10").resolve(), Some(10.0));
        assert_eq!(NumberOrString::from(f64::NAN).resolve(), None);
    }

    #[test]
    fn number_or_string_deserializes_both_forms() {
        let n: NumberOrString = serde_json::from_str("4").expect("number");
        let s: NumberOrString = serde_json::from_str("\"0.5\"").expect("string");
        assert_eq!(n.resolve(), Some(4.0));
        assert_eq!(s.resolve(), Some(0.5));
    }

    #[test]
    fn round_decimals_trims_float_noise() {
        assert_eq!(round_decimals(0.1 + 0.2, 9), 0.3);
        assert_eq!(round_decimals(2.0000000004, 9), 2.0);
    }

    #[test]
    fn round_decimals_sends_ties_upward() {
        assert_eq!(round_decimals(2.5, 0), 3.0);
        assert_eq!(round_decimals(-1.5, 0), -1.0);
        assert_eq!(round_decimals(-2.25, 1), -2.2);
        assert_eq!(round_decimals(-0.7, 0), -1.0);
    }

    #[test]
    fn fractional_digits_follows_shortest_repr() {
        assert_eq!(fractional_digits(1.0), 0);
        assert_eq!(fractional_digits(2.5), 1);
        assert_eq!(fractional_digits(0.25), 2);
        assert_eq!(fractional_digits(1e-9), 9);
        assert_eq!(fractional_digits(f64::NAN), 0);
    }
}
