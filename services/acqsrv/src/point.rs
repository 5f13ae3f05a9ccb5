//! Measurement data model.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Decoded register value.
///
/// The numeric kind is fixed by the originating target: raw reads keep the
/// register's declared kind, and applying any scale/offset/rounding
/// transform promotes the value to `F64`. Keeping this a closed union keeps
/// every sink serializer exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    F64(f64),
}

impl Value {
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::U16(v) => f64::from(v),
            Value::I16(v) => f64::from(v),
            Value::U32(v) => f64::from(v),
            Value::I32(v) => f64::from(v),
            Value::F32(v) => f64::from(v),
            Value::F64(v) => v,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Value::U16(v) => write!(f, "{v}"),
            Value::I16(v) => write!(f, "{v}"),
            Value::U32(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
        }
    }
}

/// One timestamped, labeled measurement. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub timestamp: DateTime<Utc>,
    pub label: String,
    pub value: Value,
}

impl Point {
    pub fn new(timestamp: DateTime<Utc>, label: impl Into<String>, value: Value) -> Self {
        Self {
            timestamp,
            label: label.into(),
            value,
        }
    }

    /// Milliseconds since the Unix epoch, the precision every sink emits.
    pub fn epoch_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}
