//! Scalar values produced by field expressions
//!
//! Every extracted value is one of these scalars. Before a value joins a row
//! it is coerced into the storage family of its column, so the storage layer
//! only ever binds values that already match the declared column type.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use std::fmt;

use crate::error::ExtractionError;
use crate::schema::{StorageFamily, StorageType};

/// A single scalar value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Date(_) => "date",
            Value::Timestamp(_) => "timestamp",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert a JSON leaf into a scalar. Arrays and objects are not scalars.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, ExtractionError> {
        match value {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Boolean(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Value::Integer(i)),
                None => n
                    .as_f64()
                    .map(Value::Float)
                    .ok_or_else(|| ExtractionError::type_mismatch("number", n.to_string())),
            },
            serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
            serde_json::Value::Array(_) => Err(ExtractionError::type_mismatch("scalar", "list")),
            serde_json::Value::Object(_) => Err(ExtractionError::type_mismatch("scalar", "object")),
        }
    }

    /// Parse a value into a timestamp (text, unix seconds, date or timestamp)
    pub fn to_timestamp(&self) -> Result<DateTime<Utc>, ExtractionError> {
        match self {
            Value::Timestamp(ts) => Ok(*ts),
            Value::Date(d) => Ok(Utc.from_utc_datetime(&d.and_time(chrono::NaiveTime::MIN))),
            Value::Integer(secs) => DateTime::from_timestamp(*secs, 0)
                .ok_or_else(|| ExtractionError::InvalidTimestamp(secs.to_string())),
            Value::Text(s) => parse_timestamp(s),
            other => Err(ExtractionError::type_mismatch("timestamp", other.type_name())),
        }
    }

    /// Coerce into the storage family of `target`
    pub fn coerce(self, target: &StorageType) -> Result<Value, ExtractionError> {
        if self.is_null() {
            return Ok(Value::Null);
        }

        match target.family() {
            StorageFamily::Text => Ok(match self {
                Value::Text(s) => Value::Text(s),
                other => Value::Text(other.to_string()),
            }),
            StorageFamily::Integer => self.coerce_integer().map(Value::Integer),
            StorageFamily::Real => self.coerce_float().map(Value::Float),
            StorageFamily::Boolean => self.coerce_boolean().map(Value::Boolean),
            StorageFamily::Date => match self {
                Value::Date(d) => Ok(Value::Date(d)),
                Value::Text(ref s) => match NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d") {
                    Ok(d) => Ok(Value::Date(d)),
                    Err(_) => self.to_timestamp().map(|ts| Value::Date(ts.date_naive())),
                },
                other => other.to_timestamp().map(|ts| Value::Date(ts.date_naive())),
            },
            StorageFamily::DateTime => self.to_timestamp().map(Value::Timestamp),
        }
    }

    fn coerce_integer(self) -> Result<i64, ExtractionError> {
        match self {
            Value::Integer(i) => Ok(i),
            Value::Boolean(b) => Ok(i64::from(b)),
            // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive
            Value::Float(f) if f.fract() == 0.0 && (i64::MIN as f64..i64::MAX as f64).contains(&f) => {
                Ok(f as i64)
            },
            Value::Text(ref s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| ExtractionError::type_mismatch("integer", format!("text '{}'", s))),
            Value::Timestamp(ts) => Ok(ts.timestamp()),
            other => Err(ExtractionError::type_mismatch("integer", other.type_name())),
        }
    }

    fn coerce_float(self) -> Result<f64, ExtractionError> {
        match self {
            Value::Float(f) => Ok(f),
            Value::Integer(i) => Ok(i as f64),
            Value::Text(ref s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| ExtractionError::type_mismatch("float", format!("text '{}'", s))),
            other => Err(ExtractionError::type_mismatch("float", other.type_name())),
        }
    }

    fn coerce_boolean(self) -> Result<bool, ExtractionError> {
        match self {
            Value::Boolean(b) => Ok(b),
            Value::Integer(0) => Ok(false),
            Value::Integer(1) => Ok(true),
            Value::Text(ref s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(true),
                "false" | "no" | "0" => Ok(false),
                _ => Err(ExtractionError::type_mismatch("boolean", format!("text '{}'", s))),
            },
            other => Err(ExtractionError::type_mismatch("boolean", other.type_name())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => f.write_str(s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

/// Parse the timestamp shapes that appear in feeds: RFC 3339 (Atom),
/// RFC 2822 (RSS), naive date-times (taken as UTC) and bare dates.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ExtractionError> {
    let s = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc2822(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN)));
    }

    Err(ExtractionError::InvalidTimestamp(raw.to_string()))
}
