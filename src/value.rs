use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Error;

/// A point in time expressed as seconds and nanoseconds since the Unix
/// epoch. Encoded as two integers so that the wire form is independent of
/// the platform's native time representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn now() -> Timestamp {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Timestamp {
                secs: d.as_secs() as i64,
                nanos: d.subsec_nanos(),
            },
            // Clock before the epoch; clamp rather than fail.
            Err(_) => Timestamp { secs: 0, nanos: 0 },
        }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.secs as f64 + self.nanos as f64 / 1e9
    }
}

/// Self-describing value carried by requests, replies and signals.
///
/// This is the complete set of kinds that cross the wire. Service-specific
/// types must be lowered to one of these kinds at the service boundary,
/// typically as a `Record`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Named record: a tag plus a field map. Used for remote exception
    /// descriptors and any service-defined structured value.
    Record {
        tag: String,
        fields: BTreeMap<String, Value>,
    },
    Timestamp(Timestamp),
}

impl Value {
    pub fn record(tag: impl Into<String>) -> Value {
        Value::Record {
            tag: tag.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn record_with(tag: impl Into<String>, fields: Vec<(&str, Value)>) -> Value {
        Value::Record {
            tag: tag.into(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<Timestamp> {
        match self {
            Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// Short kind name for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Record { .. } => "record",
            Value::Timestamp(_) => "timestamp",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Str(v) => write!(f, "{:?}", v),
            Value::List(v) => write!(f, "<list of {}>", v.len()),
            Value::Map(v) => write!(f, "<map of {}>", v.len()),
            Value::Record { tag, fields } => write!(f, "<record {} of {}>", tag, fields.len()),
            Value::Timestamp(ts) => write!(f, "{}.{:09}", ts.secs, ts.nanos),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int(v as i64)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Value {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Value {
        Value::List(v)
    }
}

impl From<Timestamp> for Value {
    fn from(v: Timestamp) -> Value {
        Value::Timestamp(v)
    }
}

/// Positional and keyword arguments of a method invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Args {
    pub positional: Vec<Value>,
    pub keyword: BTreeMap<String, Value>,
}

impl Args {
    pub fn none() -> Args {
        Args::default()
    }

    pub fn positional(values: Vec<Value>) -> Args {
        Args {
            positional: values,
            keyword: BTreeMap::new(),
        }
    }

    pub fn with_keyword(mut self, key: impl Into<String>, value: Value) -> Args {
        self.keyword.insert(key.into(), value);
        self
    }

    /// Positional argument at `index`, or an `InvalidArgument` error.
    pub fn require(&self, index: usize) -> Result<&Value, Error> {
        self.positional
            .get(index)
            .ok_or_else(|| Error::invalid_argument(format!("missing positional argument {}", index)))
    }

    /// Positional string argument at `index`, or an `InvalidArgument` error.
    pub fn require_str(&self, index: usize) -> Result<&str, Error> {
        let value = self.require(index)?;
        value.as_str().ok_or_else(|| {
            Error::invalid_argument(format!(
                "argument {} must be a string, got {}",
                index,
                value.kind_name()
            ))
        })
    }

    /// Positional integer argument at `index`, or an `InvalidArgument` error.
    pub fn require_i64(&self, index: usize) -> Result<i64, Error> {
        let value = self.require(index)?;
        value.as_i64().ok_or_else(|| {
            Error::invalid_argument(format!(
                "argument {} must be an integer, got {}",
                index,
                value.kind_name()
            ))
        })
    }

    pub fn keyword(&self, key: &str) -> Option<&Value> {
        self.keyword.get(key)
    }
}
