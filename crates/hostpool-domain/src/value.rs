use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// A single machine attribute or query leaf.
///
/// Untagged: variant order matters for deserialization. `Time` must precede
/// `Str` so RFC 3339 strings come back as timestamps after a store round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Time(DateTime<Utc>),
    Str(String),
    StrList(Vec<String>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Time(_) => "time",
            Value::Str(_) => "str",
            Value::StrList(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Timestamp view. Accepts `Str` holding RFC 3339 so callers never care
    /// which side of a serialization boundary the value came from.
    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Time(t) => Some(*t),
            Value::Str(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Value::StrList(l) => Some(l),
            _ => None,
        }
    }

    /// Ordering used by the comparison operators. `Int` and `Float` compare
    /// numerically against each other; everything else compares within its
    /// own variant.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Time(_), _) | (_, Value::Time(_)) => {
                match (self.as_time(), other.as_time()) {
                    (Some(a), Some(b)) => Some(a.cmp(&b)),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Equality with document-store array semantics: a scalar equals a list
    /// field when the list contains it.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::StrList(list), Value::Str(s)) | (Value::Str(s), Value::StrList(list)) => {
                list.iter().any(|v| v == s) || self == other
            }
            _ => self.compare(other) == Some(Ordering::Equal) || self == other,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::Time(t)
    }
}

impl From<Vec<String>> for Value {
    fn from(l: Vec<String>) -> Self {
        Value::StrList(l)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::Time(t) => write!(f, "{}", t.to_rfc3339()),
            Value::Str(s) => write!(f, "{}", s),
            Value::StrList(l) => write!(f, "{}", l.join(",")),
            Value::Map(_) => write!(f, "<map>"),
        }
    }
}

/// Convert any serializable type into a [`Value`].
pub fn to_value<T: Serialize>(v: &T) -> Result<Value, DomainError> {
    Ok(serde_json::from_value(serde_json::to_value(v)?)?)
}

/// Convert a [`Value`] back into a concrete type.
pub fn from_value<T: DeserializeOwned>(v: &Value) -> Result<T, DomainError> {
    Ok(serde_json::from_value(serde_json::to_value(v)?)?)
}

// ── Declared parameter types ──────────────────────────────────────────────────

/// The type a parameter descriptor declares for its values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Bool,
    Int,
    Float,
    Time,
    Str,
    StrList,
}

impl ValueType {
    pub fn name(&self) -> &'static str {
        match self {
            ValueType::Bool => "bool",
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::Time => "time",
            ValueType::Str => "str",
            ValueType::StrList => "list",
        }
    }

    /// Coerce a value into this type, accepting the usual request-boundary
    /// spellings (`"8192"`, `"1"`, `"true"`, RFC 3339 strings, bare scalars
    /// promoted to single-element lists).
    pub fn coerce(&self, value: Value) -> Result<Value, DomainError> {
        let err = |got: &Value, wanted: &ValueType| DomainError::Coercion {
            got: got.type_name().to_string(),
            wanted: wanted.name().to_string(),
        };
        match (self, value) {
            (ValueType::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
            (ValueType::Bool, Value::Str(s)) => match s.to_ascii_lowercase().as_str() {
                "1" | "true" => Ok(Value::Bool(true)),
                "0" | "false" => Ok(Value::Bool(false)),
                _ => Err(err(&Value::Str(s), self)),
            },
            (ValueType::Bool, Value::Int(n)) => Ok(Value::Bool(n != 0)),

            (ValueType::Int, Value::Int(n)) => Ok(Value::Int(n)),
            (ValueType::Int, Value::Float(f)) => Ok(Value::Int(f as i64)),
            (ValueType::Int, Value::Str(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| err(&Value::Str(s.clone()), self)),

            (ValueType::Float, Value::Float(f)) => Ok(Value::Float(f)),
            (ValueType::Float, Value::Int(n)) => Ok(Value::Float(n as f64)),
            (ValueType::Float, Value::Str(s)) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| err(&Value::Str(s.clone()), self)),

            (ValueType::Time, Value::Time(t)) => Ok(Value::Time(t)),
            (ValueType::Time, v @ Value::Str(_)) => {
                v.as_time().map(Value::Time).ok_or_else(|| err(&v, self))
            }

            (ValueType::Str, Value::Str(s)) => Ok(Value::Str(s)),
            (ValueType::Str, Value::Int(n)) => Ok(Value::Str(n.to_string())),
            (ValueType::Str, Value::Bool(b)) => Ok(Value::Str(b.to_string())),
            (ValueType::Str, Value::Float(f)) => Ok(Value::Str(f.to_string())),

            (ValueType::StrList, Value::StrList(l)) => Ok(Value::StrList(l)),
            (ValueType::StrList, Value::Str(s)) => Ok(Value::StrList(vec![s])),

            (_, v) => Err(err(&v, self)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn rfc3339_string_deserializes_as_time() {
        let v: Value = serde_json::from_str("\"2024-03-01T12:00:00Z\"").unwrap();
        assert!(matches!(v, Value::Time(_)));
    }

    #[test]
    fn plain_string_stays_a_string() {
        let v: Value = serde_json::from_str("\"x86_64\"").unwrap();
        assert_eq!(v, Value::Str("x86_64".into()));
    }

    #[test]
    fn time_round_trips_through_json() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let json = serde_json::to_string(&Value::Time(t)).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Value::Time(t));
    }

    #[test]
    fn int_and_float_compare_numerically() {
        assert_eq!(
            Value::Int(4).compare(&Value::Float(4.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Float(8.0).compare(&Value::Int(8)),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn scalar_matches_list_membership() {
        let flags = Value::StrList(vec!["pdpe1gb".into(), "vmx".into()]);
        assert!(flags.loose_eq(&Value::Str("vmx".into())));
        assert!(!flags.loose_eq(&Value::Str("sse2".into())));
    }

    #[test]
    fn coerce_request_spellings() {
        assert_eq!(
            ValueType::Int.coerce(Value::Str("8192".into())).unwrap(),
            Value::Int(8192)
        );
        assert_eq!(
            ValueType::Bool.coerce(Value::Str("TRUE".into())).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            ValueType::StrList.coerce(Value::Str("x".into())).unwrap(),
            Value::StrList(vec!["x".into()])
        );
        assert!(ValueType::Int.coerce(Value::Str("lots".into())).is_err());
    }
}
