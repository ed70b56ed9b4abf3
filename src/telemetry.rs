use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

pub const SOURCE_COUNT: usize = 3;
pub const DEFAULT_SOURCE_TYPE: &str = "Unknown";

/// Identifier of one of the three sensor units. Only constructed through
/// [`SourceId::new`], so every value in the pipeline is in `1..=3`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SourceId(u8);

impl SourceId {
    pub const ALL: [SourceId; SOURCE_COUNT] = [SourceId(1), SourceId(2), SourceId(3)];

    pub fn new(raw: i64) -> Option<Self> {
        match raw {
            1..=3 => Some(Self(raw as u8)),
            _ => None,
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Position in fixed-size per-source tables.
    pub fn index(self) -> usize {
        usize::from(self.0 - 1)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Pm25,
    Pm10,
    Eco2,
    Tvoc,
    Co,
    No2,
    Temperature,
    Humidity,
}

impl Field {
    pub const COUNT: usize = 8;
    pub const ALL: [Field; Field::COUNT] = [
        Field::Pm25,
        Field::Pm10,
        Field::Eco2,
        Field::Tvoc,
        Field::Co,
        Field::No2,
        Field::Temperature,
        Field::Humidity,
    ];

    /// Canonical wire / column name.
    pub fn name(self) -> &'static str {
        match self {
            Field::Pm25 => "pm25",
            Field::Pm10 => "pm10",
            Field::Eco2 => "eco2",
            Field::Tvoc => "tvoc",
            Field::Co => "co",
            Field::No2 => "no2",
            Field::Temperature => "temperature",
            Field::Humidity => "humidity",
        }
    }

    /// Keys accepted on the wire, in precedence order. Sensor firmware sends `temp`.
    pub fn wire_keys(self) -> &'static [&'static str] {
        match self {
            Field::Temperature => &["temperature", "temp"],
            Field::Pm25 => &["pm25"],
            Field::Pm10 => &["pm10"],
            Field::Eco2 => &["eco2"],
            Field::Tvoc => &["tvoc"],
            Field::Co => &["co"],
            Field::No2 => &["no2"],
            Field::Humidity => &["humidity"],
        }
    }

    /// Inclusive accepted range.
    pub fn range(self) -> (f64, f64) {
        match self {
            Field::Temperature => (-50.0, 100.0),
            Field::Humidity => (0.0, 100.0),
            _ => (0.0, 10_000.0),
        }
    }

    pub fn accepts(self, value: f64) -> bool {
        let (min, max) = self.range();
        value.is_finite() && value >= min && value <= max
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbsentReason {
    Missing,
    NotNumeric,
    OutOfRange,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Measurement {
    Present(f64),
    Absent(AbsentReason),
}

impl Measurement {
    pub fn value(self) -> Option<f64> {
        match self {
            Measurement::Present(value) => Some(value),
            Measurement::Absent(_) => None,
        }
    }

    pub fn is_present(self) -> bool {
        matches!(self, Measurement::Present(_))
    }
}

/// One validated telemetry sample. Built by the validator and immutable afterwards.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Reading {
    source: SourceId,
    source_type: String,
    measurements: [Measurement; Field::COUNT],
    arrival_time: DateTime<Utc>,
}

impl Reading {
    pub(crate) fn new(
        source: SourceId,
        source_type: String,
        measurements: [Measurement; Field::COUNT],
        arrival_time: DateTime<Utc>,
    ) -> Self {
        Self {
            source,
            source_type,
            measurements,
            arrival_time,
        }
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn source_type(&self) -> &str {
        &self.source_type
    }

    pub fn arrival_time(&self) -> DateTime<Utc> {
        self.arrival_time
    }

    pub fn measurement(&self, field: Field) -> Measurement {
        self.measurements[field.index()]
    }

    pub fn value(&self, field: Field) -> Option<f64> {
        self.measurement(field).value()
    }

    pub fn present(&self) -> impl Iterator<Item = (Field, f64)> + '_ {
        Field::ALL
            .into_iter()
            .filter_map(|field| self.value(field).map(|value| (field, value)))
    }

    /// Wire-shaped field map of this reading (canonical keys, present fields only).
    pub fn to_field_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("nodeId".to_string(), Value::from(self.source.get()));
        map.insert(
            "nodeType".to_string(),
            Value::String(self.source_type.clone()),
        );
        for (field, value) in self.present() {
            map.insert(field.name().to_string(), Value::from(value));
        }
        map
    }
}
