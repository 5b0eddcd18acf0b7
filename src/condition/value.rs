//! The evaluator's dynamic value type and its coercion rules.
//!
//! `Value` is an explicit tagged union; there is no reflection-style
//! dispatch anywhere in the evaluator. Arrays are homogeneous: mixing
//! element types inside one array is invalid.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::EvalError;

#[derive(Debug, Clone)]
pub enum Value {
    Bool(bool),
    /// All numerics are normalized to double precision.
    Number(f64),
    String(String),
    /// An instant; compares against numbers as unix seconds.
    DateTime(DateTime<Utc>),
    Array(Vec<Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::DateTime(_) => "datetime",
            Value::Array(_) => "array",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Total order used by the comparison operators. Numbers, strings and
    /// datetimes compare within their own type; datetimes coerce to unix
    /// seconds against numbers, and strings coerce to datetimes against
    /// temporal operands. Anything else is a type error.
    pub fn compare(&self, other: &Value) -> Result<Ordering, EvalError> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b).ok_or_else(|| {
                EvalError::InvalidAttributeValue("NaN is not comparable".into())
            }),
            (Value::String(a), Value::String(b)) => Ok(a.as_bytes().cmp(b.as_bytes())),
            (Value::DateTime(a), Value::DateTime(b)) => Ok(a.cmp(b)),
            (Value::Number(a), Value::DateTime(b)) => cmp_f64(*a, unix_seconds(b)),
            (Value::DateTime(a), Value::Number(b)) => cmp_f64(unix_seconds(a), *b),
            (Value::Number(a), Value::String(s)) => {
                let ts = parse_datetime(s).ok_or_else(|| type_mismatch("compare", self, other))?;
                cmp_f64(*a, unix_seconds(&ts))
            }
            (Value::String(s), Value::Number(b)) => {
                let ts = parse_datetime(s).ok_or_else(|| type_mismatch("compare", self, other))?;
                cmp_f64(unix_seconds(&ts), *b)
            }
            (Value::DateTime(a), Value::String(s)) => {
                let ts = parse_datetime(s)
                    .ok_or_else(|| EvalError::InvalidDatetimeValue(s.clone()))?;
                Ok(a.cmp(&ts))
            }
            (Value::String(s), Value::DateTime(b)) => {
                let ts = parse_datetime(s)
                    .ok_or_else(|| EvalError::InvalidDatetimeValue(s.clone()))?;
                Ok(ts.cmp(b))
            }
            _ => Err(type_mismatch("compare", self, other)),
        }
    }
}

fn cmp_f64(a: f64, b: f64) -> Result<Ordering, EvalError> {
    a.partial_cmp(&b)
        .ok_or_else(|| EvalError::InvalidAttributeValue("NaN is not comparable".into()))
}

fn unix_seconds(t: &DateTime<Utc>) -> f64 {
    t.timestamp() as f64
}

fn type_mismatch(op: &str, a: &Value, b: &Value) -> EvalError {
    EvalError::InvalidAttributeType(format!(
        "cannot {op} {} with {}",
        a.type_name(),
        b.type_name()
    ))
}

/// Equality follows the preserved per-case behavior: values of different
/// types are unequal (not an error), numbers and datetimes cross-compare
/// as unix seconds.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Number(a), Value::DateTime(b)) => *a == unix_seconds(b),
            (Value::DateTime(a), Value::Number(b)) => unix_seconds(a) == *b,
            (Value::Array(a), Value::Array(b)) => a == b,
            _ => false,
        }
    }
}

/// All elements of an array must share one type. Numbers of any
/// precision count as the same type.
pub fn check_homogeneous(items: &[Value]) -> Result<(), EvalError> {
    let mut types = items.iter().map(|v| v.type_name());
    if let Some(first) = types.next() {
        for t in types {
            if t != first {
                return Err(EvalError::InvalidAttributeValue(format!(
                    "array mixes {first} and {t} elements"
                )));
            }
        }
    }
    Ok(())
}

/// Parse a datetime string. Accepted layouts: RFC3339 (with or without
/// fractional seconds), RubyDate, UnixDate (timezone abbreviation is
/// ignored), `YYYY-MM-DD HH:MM:SS` and `YYYY-MM-DD` (both taken as UTC).
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    // RubyDate: "Mon Jan 02 15:04:05 -0700 2006"
    if let Ok(t) = DateTime::parse_from_str(s, "%a %b %d %H:%M:%S %z %Y") {
        return Some(t.with_timezone(&Utc));
    }
    // UnixDate: "Mon Jan  2 15:04:05 MST 2006". Chrono cannot parse
    // timezone abbreviations, so drop that token and read the rest as UTC.
    let fields: Vec<&str> = s.split_whitespace().collect();
    if fields.len() == 6 {
        let without_zone = format!(
            "{} {} {} {} {}",
            fields[0], fields[1], fields[2], fields[3], fields[5]
        );
        if let Ok(t) = NaiveDateTime::parse_from_str(&without_zone, "%a %b %e %H:%M:%S %Y") {
            return Some(Utc.from_utc_datetime(&t));
        }
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&t));
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
    }
    None
}

// ---------- JSON conversion ----------

impl TryFrom<serde_json::Value> for Value {
    type Error = EvalError;

    fn try_from(v: serde_json::Value) -> Result<Self, Self::Error> {
        match v {
            serde_json::Value::Bool(b) => Ok(Value::Bool(b)),
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(Value::Number)
                .ok_or_else(|| EvalError::InvalidAttributeValue(format!("number {n} overflows"))),
            serde_json::Value::String(s) => Ok(Value::String(s)),
            serde_json::Value::Array(items) => {
                let converted: Result<Vec<Value>, EvalError> =
                    items.into_iter().map(Value::try_from).collect();
                let converted = converted?;
                check_homogeneous(&converted)?;
                Ok(Value::Array(converted))
            }
            serde_json::Value::Null => Err(EvalError::InvalidAttributeValue(
                "null is not a valid attribute value".into(),
            )),
            serde_json::Value::Object(_) => Err(EvalError::InvalidAttributeValue(
                "objects are not valid attribute values".into(),
            )),
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(v: &Value) -> serde_json::Value {
        match v {
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::DateTime(t) => serde_json::Value::String(t.to_rfc3339()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(serde_json::Value::from).collect())
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde_json::Value::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Value::try_from(raw).map_err(D::Error::custom)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s}"),
            Value::DateTime(t) => write!(f, "{}", t.to_rfc3339()),
            Value::Array(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_same_type() {
        assert_eq!(Value::Number(1.0), Value::Number(1.0));
        assert_eq!(Value::from("lol"), Value::from("lol"));
        assert_ne!(Value::from("lol"), Value::from("LoL"));
    }

    #[test]
    fn test_equality_across_types_is_false_not_error() {
        assert_ne!(Value::Bool(true), Value::from("true"));
        assert_ne!(Value::Number(1.0), Value::Bool(true));
        assert_ne!(Value::Number(0.0), Value::from("0"));
    }

    #[test]
    fn test_number_ordering() {
        assert_eq!(
            Value::Number(35.0)
                .compare(&Value::Number(34.99))
                .unwrap(),
            Ordering::Greater
        );
    }

    #[test]
    fn test_string_ordering_is_bytewise() {
        assert_eq!(
            Value::from("abcd").compare(&Value::from("abc")).unwrap(),
            Ordering::Greater
        );
        assert_eq!(
            Value::from("ab").compare(&Value::from("abc")).unwrap(),
            Ordering::Less
        );
    }

    #[test]
    fn test_bool_ordering_is_error() {
        let err = Value::Bool(true).compare(&Value::Bool(false)).unwrap_err();
        assert!(matches!(err, EvalError::InvalidAttributeType(_)));
    }

    #[test]
    fn test_number_vs_datetime_string() {
        // A unix timestamp from 2020 is before 2026-11-02.
        let now = Value::Number(1_600_000_000.0);
        assert_eq!(
            now.compare(&Value::from("2026-11-02")).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            now.compare(&Value::from("2017-09-04 12:00:00")).unwrap(),
            Ordering::Greater
        );
    }

    #[test]
    fn test_number_vs_plain_string_is_error() {
        let err = Value::Number(1.0).compare(&Value::from("abc")).unwrap_err();
        assert!(matches!(err, EvalError::InvalidAttributeType(_)));
    }

    #[test]
    fn test_parse_datetime_layouts() {
        assert!(parse_datetime("2026-11-02T10:30:00Z").is_some());
        assert!(parse_datetime("2026-11-02T10:30:00.123456789+02:00").is_some());
        assert!(parse_datetime("Mon Jan 02 15:04:05 -0700 2006").is_some());
        assert!(parse_datetime("Mon Jan  2 15:04:05 MST 2006").is_some());
        assert!(parse_datetime("2017-09-04 12:00:00").is_some());
        assert!(parse_datetime("2017-09-04").is_some());
        assert!(parse_datetime("not a date").is_none());
    }

    #[test]
    fn test_homogeneous_arrays() {
        assert!(check_homogeneous(&[Value::Number(1.0), Value::Number(2.5)]).is_ok());
        assert!(check_homogeneous(&[]).is_ok());
        let err =
            check_homogeneous(&[Value::Number(1.0), Value::from("x")]).unwrap_err();
        assert!(matches!(err, EvalError::InvalidAttributeValue(_)));
    }

    #[test]
    fn test_json_conversion() {
        let raw = serde_json::json!({"a": [1, 2.5, -3]});
        let v = Value::try_from(raw["a"].clone()).unwrap();
        let items = v.as_array().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[2], Value::Number(-3.0));

        assert!(Value::try_from(serde_json::json!(null)).is_err());
        assert!(Value::try_from(serde_json::json!({"k": 1})).is_err());
        assert!(Value::try_from(serde_json::json!([1, "x"])).is_err());
    }
}
