//! Column values stored inside pads

use chrono::{DateTime, SubsecRound, Utc};
use std::fmt;

use super::accumulator::Accumulator;

/// Terminal status a pipeline step may assign to a pad
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    Warning,
    Error,
    Excluded,
    Ignored,
}

impl Status {
    const ALL: [Status; 5] = [
        Status::Ok,
        Status::Warning,
        Status::Error,
        Status::Excluded,
        Status::Ignored,
    ];

    /// Stable ordinal used by the binary format
    pub fn ordinal(self) -> u8 {
        match self {
            Status::Ok => 0,
            Status::Warning => 1,
            Status::Error => 2,
            Status::Excluded => 3,
            Status::Ignored => 4,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(ordinal as usize).copied()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::Warning => "WARNING",
            Status::Error => "ERROR",
            Status::Excluded => "EXCLUDED",
            Status::Ignored => "IGNORED",
        };
        f.write_str(name)
    }
}

/// A single cell of a pad's column map
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Double(f64),
    Integer(i64),
    String(String),
    Status(Status),
    Date(DateTime<Utc>),
    Accumulator(Accumulator),
    /// Standard error of the accumulator stored in column `source`
    AccumulatorStdErr { source: String },
    /// Sample standard deviation of the accumulator stored in column `source`
    AccumulatorStdDevSample { source: String },
}

impl Value {
    /// Numeric contribution of a raw value
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(value) => Some(*value),
            Value::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_status(&self) -> Option<Status> {
        match self {
            Value::Status(status) => Some(*status),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Date(date) => Some(*date),
            _ => None,
        }
    }

    pub fn as_accumulator(&self) -> Option<&Accumulator> {
        match self {
            Value::Accumulator(accumulator) => Some(accumulator),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Status> for Value {
    fn from(value: Status) -> Self {
        Value::Status(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Date(value.trunc_subsecs(3))
    }
}

impl From<Accumulator> for Value {
    fn from(value: Accumulator) -> Self {
        Value::Accumulator(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ordinals_round_trip() {
        for status in Status::ALL {
            assert_eq!(Status::from_ordinal(status.ordinal()), Some(status));
        }
        assert_eq!(Status::from_ordinal(5), None);
    }

    #[test]
    fn test_numeric_contribution() {
        assert_eq!(Value::Double(1.5).as_f64(), Some(1.5));
        assert_eq!(Value::Integer(3).as_f64(), Some(3.0));
        assert_eq!(Value::Boolean(true).as_f64(), None);
        assert_eq!(Value::from("x").as_f64(), None);
    }
}
