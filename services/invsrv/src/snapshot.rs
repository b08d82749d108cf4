//! Decoded snapshot types

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::clock::Stamp;

/// Decoded value of one measurement
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(v) => Some(*v),
            Value::Text(_) => None,
        }
    }
}

// Largest integer an f64 represents exactly
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Number(v) if v.fract() == 0.0 && v.abs() < MAX_EXACT_INT => {
                serializer.serialize_i64(*v as i64)
            },
            Value::Number(v) => serializer.serialize_f64(*v),
            Value::Text(s) => serializer.serialize_str(s),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Number(v) => write!(f, "{}", v),
            Value::Text(s) => f.write_str(s),
        }
    }
}

/// One named, unit-tagged measurement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricValue {
    pub name: String,
    /// Empty for status/text values
    pub unit: String,
    pub value: Value,
}

/// Result of one collection cycle
///
/// Each consumer queue receives its own copy; nothing mutates a snapshot
/// after the collector creates it.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    values: BTreeMap<String, MetricValue>,
    stamp: Stamp,
}

impl Snapshot {
    pub fn new(values: BTreeMap<String, MetricValue>, stamp: Stamp) -> Self {
        Self { values, stamp }
    }

    /// Wall-clock collection time, for display
    pub fn collected_at(&self) -> DateTime<Utc> {
        self.stamp.wall
    }

    pub fn stamp(&self) -> Stamp {
        self.stamp
    }

    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.values.get(name)
    }

    pub fn values(&self) -> impl Iterator<Item = &MetricValue> {
        self.values.values()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Name → value mapping without units or collection time
    pub fn to_payload(&self) -> BTreeMap<&str, &Value> {
        self.values
            .iter()
            .map(|(name, metric)| (name.as_str(), &metric.value))
            .collect()
    }

    /// Age against a monotonic reading of the clock that stamped it
    pub fn age(&self, monotonic_now: Duration) -> Duration {
        monotonic_now.saturating_sub(self.stamp.monotonic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::stamp_at;

    fn metric(name: &str, unit: &str, value: Value) -> (String, MetricValue) {
        (
            name.to_string(),
            MetricValue {
                name: name.to_string(),
                unit: unit.to_string(),
                value,
            },
        )
    }

    #[test]
    fn test_payload_serialization() {
        let snapshot = Snapshot::new(
            [
                metric("battery_soc", "%", Value::Number(87.0)),
                metric("battery_voltage", "V", Value::Number(52.31)),
                metric("overall_state", "", Value::Text("ok".into())),
            ]
            .into_iter()
            .collect(),
            stamp_at(0),
        );

        let json = serde_json::to_string(&snapshot.to_payload()).unwrap();
        assert_eq!(
            json,
            r#"{"battery_soc":87,"battery_voltage":52.31,"overall_state":"ok"}"#
        );
    }

    #[test]
    fn test_age() {
        let snapshot = Snapshot::new(BTreeMap::new(), stamp_at(100));
        assert_eq!(snapshot.age(Duration::from_secs(190)).as_secs(), 90);
        assert_eq!(snapshot.age(Duration::from_secs(95)), Duration::ZERO);
    }
}
