use crate::telemetry::{
    AbsentReason, Field, Measurement, Reading, SourceId, DEFAULT_SOURCE_TYPE,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::fmt;

const SOURCE_ID_KEY: &str = "nodeId";
const SOURCE_TYPE_KEY: &str = "nodeType";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    NotAnObject,
    MissingSourceId,
    InvalidSourceId,
    UnknownSource(i64),
    NoMeasurements,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::NotAnObject => write!(f, "candidate is not an object"),
            Rejection::MissingSourceId => write!(f, "missing {SOURCE_ID_KEY}"),
            Rejection::InvalidSourceId => write!(f, "{SOURCE_ID_KEY} is not an integer"),
            Rejection::UnknownSource(id) => write!(f, "source {id} is not part of the fleet"),
            Rejection::NoMeasurements => write!(f, "no measurement survived validation"),
        }
    }
}

pub fn validate_candidate(candidate: &Value, arrival_time: DateTime<Utc>) -> Result<Reading, Rejection> {
    match candidate {
        Value::Object(map) => validate_fields(map, arrival_time),
        _ => Err(Rejection::NotAnObject),
    }
}

/// Turns one untyped field map into a [`Reading`]. Out-of-range or non-numeric measurements
/// are dropped individually; the record is rejected only when the source id is unusable or
/// nothing measurable is left.
pub fn validate_fields(
    map: &Map<String, Value>,
    arrival_time: DateTime<Utc>,
) -> Result<Reading, Rejection> {
    let raw_id = map.get(SOURCE_ID_KEY).ok_or(Rejection::MissingSourceId)?;
    let id = coerce_integer(raw_id).ok_or(Rejection::InvalidSourceId)?;
    let source = SourceId::new(id).ok_or(Rejection::UnknownSource(id))?;

    let source_type = map
        .get(SOURCE_TYPE_KEY)
        .and_then(coerce_label)
        .unwrap_or_else(|| DEFAULT_SOURCE_TYPE.to_string());

    let mut measurements = [Measurement::Absent(AbsentReason::Missing); Field::COUNT];
    for field in Field::ALL {
        let raw = field.wire_keys().iter().find_map(|key| map.get(*key));
        measurements[field.index()] = match raw {
            None => Measurement::Absent(AbsentReason::Missing),
            Some(raw) => match coerce_float(raw) {
                None => Measurement::Absent(AbsentReason::NotNumeric),
                Some(value) if field.accepts(value) => Measurement::Present(value),
                Some(_) => Measurement::Absent(AbsentReason::OutOfRange),
            },
        };
    }

    if !measurements.iter().any(|m| m.is_present()) {
        return Err(Rejection::NoMeasurements);
    }

    Ok(Reading::new(source, source_type, measurements, arrival_time))
}

/// Integers pass through, finite floats truncate toward zero, booleans count as 0/1, and
/// strings must hold an integer literal.
fn coerce_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|v| v.is_finite())
                .map(f64::trunc)
                .filter(|v| *v >= i64::MIN as f64 && *v < i64::MAX as f64)
                .map(|v| v as i64)
        }),
        Value::Bool(flag) => Some(i64::from(*flag)),
        Value::String(raw) => raw.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn coerce_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn coerce_label(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(raw) => Some(raw.clone()),
        other => Some(other.to_string()),
    }
}
