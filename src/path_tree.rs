use crate::error::{BridgeError, PathTreeError};
use crate::publish_sink::PublishSink;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// A value stored under a bus path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Number(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Number(v) => Some(*v),
            Value::Text(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Number(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// Display formatting attached to a path when it is declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Formatter {
    KiloWattHours,
    Amps,
    Watts,
    Volts,
    CubicMeters,
    /// DSMR `YYMMDDhhmmss` timestamp, shown as `YYYY-MM-DD hh:mm:ss`.
    Timestamp,
}

impl Formatter {
    pub fn format(self, value: &Value) -> String {
        match self {
            Formatter::KiloWattHours => match value.as_f64() {
                Some(kwh) => format!("{kwh:.2}kWh"),
                None => value.to_string(),
            },
            Formatter::Amps => format!("{value}A"),
            Formatter::Watts => format!("{value}W"),
            Formatter::Volts => format!("{value}V"),
            Formatter::CubicMeters => format!("{value}m3"),
            Formatter::Timestamp => format_dsmr_timestamp(value),
        }
    }
}

fn format_dsmr_timestamp(value: &Value) -> String {
    let raw = value.to_string();
    match NaiveDateTime::parse_from_str(&raw, "%y%m%d%H%M%S") {
        Ok(timestamp) => timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
        Err(_) => raw,
    }
}

/// Text shown for a path: empty while unset, otherwise the formatted value.
pub fn display_text(formatter: Option<Formatter>, value: Option<&Value>) -> String {
    match (formatter, value) {
        (_, None) => String::new(),
        (Some(formatter), Some(value)) => formatter.format(value),
        (None, Some(value)) => value.to_string(),
    }
}

#[derive(Debug)]
struct Entry {
    formatter: Option<Formatter>,
    value: Option<Value>,
}

/// Cached mirror of one service's bus namespace.
///
/// Every path must be declared before it is written, and a write only reaches
/// the sink when the value actually differs from the cached one.
pub struct PathTree {
    entries: BTreeMap<String, Entry>,
    sink: Box<dyn PublishSink>,
}

impl PathTree {
    pub fn new(sink: Box<dyn PublishSink>) -> Self {
        Self {
            entries: BTreeMap::new(),
            sink,
        }
    }

    /// Registers `path` with no value. Repeating a declaration with the same
    /// formatter is a no-op.
    pub fn declare(&mut self, path: &str, formatter: Option<Formatter>) -> Result<(), BridgeError> {
        if let Some(existing) = self.entries.get(path) {
            if existing.formatter == formatter {
                return Ok(());
            }
            return Err(PathTreeError::ConflictingFormatter {
                path: path.to_string(),
                existing: existing.formatter,
                requested: formatter,
            }
            .into());
        }

        self.sink.declare(path)?;
        self.entries.insert(
            path.to_string(),
            Entry {
                formatter,
                value: None,
            },
        );
        Ok(())
    }

    /// Stores `value` and writes it to the sink if it differs from the cached
    /// value. Returns whether the sink was written.
    pub fn set_if_changed(&mut self, path: &str, value: Option<Value>) -> Result<bool, BridgeError> {
        let entry = self
            .entries
            .get_mut(path)
            .ok_or_else(|| PathTreeError::Undeclared(path.to_string()))?;

        if entry.value == value {
            return Ok(false);
        }

        let text = display_text(entry.formatter, value.as_ref());
        self.sink.write(path, value.as_ref(), &text)?;
        entry.value = value;
        Ok(true)
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.entries.get(path).and_then(|entry| entry.value.as_ref())
    }

    pub fn text(&self, path: &str) -> Option<String> {
        self.entries
            .get(path)
            .map(|entry| display_text(entry.formatter, entry.value.as_ref()))
    }

    pub fn is_declared(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
