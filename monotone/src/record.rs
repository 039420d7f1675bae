/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Observation records and the typed parse boundary.
//!
//! Raw input is one JSON object per line. Parsing validates the three
//! fields named by [`FieldNames`] and produces an [`Observation`];
//! anything that does not fit the schema is rejected with a
//! [`ParseError`] rather than defaulted.

use std::cmp::Ordering;
use std::fmt;

use chrono::DateTime;
use chrono::Utc;

use crate::config::FieldNames;
use crate::ordering::IngestIndex;
use crate::ordering::OrderingKey;

/// Instant at which an observation was taken, normalized to UTC.
pub type Timestamp = DateTime<Utc>;

/// The type of error for decoding a raw record.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record is not valid utf-8: {0}")]
    InvalidUtf8(#[source] std::str::Utf8Error),

    #[error("record is not a json object")]
    NotAnObject,

    #[error("missing field `{field}`")]
    MissingField { field: String },

    #[error("field `{field}`: expected {expected}, got {got}")]
    WrongType {
        field: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("field `{field}`: invalid timestamp {raw:?}: {reason}")]
    InvalidTimestamp {
        field: String,
        raw: String,
        reason: String,
    },

    #[error("field `{field}`: number {raw} is not totally ordered")]
    NotTotallyOrdered { field: String, raw: String },
}

/// Two values met in a comparison but have no common order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum OrderingError {
    #[error("cannot compare a {left} value with a {right} value")]
    IncomparableKinds { left: ValueKind, right: ValueKind },
}

/// The comparison domain of a [`Value`]. Values compare only within
/// a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Numeric,
    Text,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Numeric => write!(f, "numeric"),
            ValueKind::Text => write!(f, "text"),
        }
    }
}

/// An observed value.
///
/// Integers and floats share the numeric kind and compare by
/// magnitude; text compares lexicographically by bytes. Floats are
/// always finite: [`Value::float`] refuses NaN and infinities, and the
/// parser goes through it.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Build a float value. Returns `None` for non-finite input.
    pub fn float(value: f64) -> Option<Self> {
        value.is_finite().then_some(Value::Float(value))
    }

    /// The comparison domain of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Integer(_) | Value::Float(_) => ValueKind::Numeric,
            Value::Text(_) => ValueKind::Text,
        }
    }

    /// Compare two values under the total order of their shared kind.
    pub fn try_cmp(&self, other: &Self) -> Result<Ordering, OrderingError> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => Ok(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => Ok(cmp_finite(*a, *b)),
            (Value::Integer(a), Value::Float(b)) => Ok(cmp_int_float(*a, *b)),
            (Value::Float(a), Value::Integer(b)) => Ok(cmp_int_float(*b, *a).reverse()),
            (Value::Text(a), Value::Text(b)) => Ok(a.cmp(b)),
            _ => Err(OrderingError::IncomparableKinds {
                left: self.kind(),
                right: other.kind(),
            }),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{:?}", v),
        }
    }
}

// Finite floats: partial_cmp is total, and -0.0 == 0.0.
fn cmp_finite(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or_else(|| a.total_cmp(&b))
}

// Exact comparison of an integer against a finite float, without
// rounding the integer through f64.
fn cmp_int_float(i: i64, f: f64) -> Ordering {
    const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
    if f >= TWO_POW_63 {
        return Ordering::Less;
    }
    if f < -TWO_POW_63 {
        return Ordering::Greater;
    }
    let whole = f.trunc();
    match i.cmp(&(whole as i64)) {
        Ordering::Equal => cmp_finite(0.0, f - whole),
        other => other,
    }
}

/// A single timestamped observation of one key.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub timestamp: Timestamp,
    pub key: String,
    pub value: Value,
}

impl Observation {
    pub fn new(timestamp: Timestamp, key: impl Into<String>, value: Value) -> Self {
        Self {
            timestamp,
            key: key.into(),
            value,
        }
    }
}

/// An observation in flight through the job: the record itself, the
/// running verdict it contributes (always `true` for a single
/// observation), and its position in the global order.
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentedObservation {
    observation: Observation,
    monotonic_so_far: bool,
    order: OrderingKey,
}

impl AugmentedObservation {
    /// Admit an observation read at `index` into the job.
    pub fn ingest(observation: Observation, index: IngestIndex) -> Self {
        let order = OrderingKey::new(observation.timestamp, index);
        Self {
            observation,
            monotonic_so_far: true,
            order,
        }
    }

    pub fn key(&self) -> &str {
        &self.observation.key
    }

    pub fn value(&self) -> &Value {
        &self.observation.value
    }

    pub fn monotonic_so_far(&self) -> bool {
        self.monotonic_so_far
    }

    pub fn order(&self) -> &OrderingKey {
        &self.order
    }

    pub fn observation(&self) -> &Observation {
        &self.observation
    }

    /// Consume the record, keeping only what a fold needs.
    pub fn into_parts(self) -> (String, Value, bool) {
        (
            self.observation.key,
            self.observation.value,
            self.monotonic_so_far,
        )
    }
}

/// Decode one raw line into an [`Observation`].
pub fn parse_observation(line: &str, fields: &FieldNames) -> Result<Observation, ParseError> {
    let raw: serde_json::Value = serde_json::from_str(line)?;
    let serde_json::Value::Object(mut record) = raw else {
        return Err(ParseError::NotAnObject);
    };
    let mut take = |field: &str| {
        record
            .remove(field)
            .ok_or_else(|| ParseError::MissingField {
                field: field.to_string(),
            })
    };

    let timestamp = take(fields.timestamp.as_str())?;
    let key = take(fields.key.as_str())?;
    let value = take(fields.value.as_str())?;

    Ok(Observation {
        timestamp: parse_timestamp(&fields.timestamp, timestamp)?,
        key: parse_key(&fields.key, key)?,
        value: parse_value(&fields.value, value)?,
    })
}

fn parse_timestamp(field: &str, raw: serde_json::Value) -> Result<Timestamp, ParseError> {
    let invalid = |raw: String, reason: &str| ParseError::InvalidTimestamp {
        field: field.to_string(),
        raw,
        reason: reason.to_string(),
    };
    match raw {
        serde_json::Value::String(text) => match DateTime::parse_from_rfc3339(&text) {
            Ok(parsed) => Ok(parsed.with_timezone(&Utc)),
            Err(e) => Err(invalid(text, &e.to_string())),
        },
        serde_json::Value::Number(number) => {
            let Some(millis) = number.as_i64() else {
                return Err(invalid(
                    number.to_string(),
                    "epoch milliseconds must be an integer",
                ));
            };
            DateTime::<Utc>::from_timestamp_millis(millis)
                .ok_or_else(|| invalid(number.to_string(), "out of range"))
        }
        other => Err(ParseError::WrongType {
            field: field.to_string(),
            expected: "RFC 3339 string or epoch milliseconds",
            got: json_type_name(&other),
        }),
    }
}

fn parse_key(field: &str, raw: serde_json::Value) -> Result<String, ParseError> {
    match raw {
        serde_json::Value::String(key) => Ok(key),
        other => Err(ParseError::WrongType {
            field: field.to_string(),
            expected: "string",
            got: json_type_name(&other),
        }),
    }
}

fn parse_value(field: &str, raw: serde_json::Value) -> Result<Value, ParseError> {
    match raw {
        serde_json::Value::String(text) => Ok(Value::Text(text)),
        serde_json::Value::Number(number) => {
            if let Some(i) = number.as_i64() {
                return Ok(Value::Integer(i));
            }
            number
                .as_f64()
                .and_then(Value::float)
                .ok_or_else(|| ParseError::NotTotallyOrdered {
                    field: field.to_string(),
                    raw: number.to_string(),
                })
        }
        other => Err(ParseError::WrongType {
            field: field.to_string(),
            expected: "number or string",
            got: json_type_name(&other),
        }),
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
