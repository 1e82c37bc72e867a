//! Per-test result records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::sampler::Sample;

/// Heterogeneous metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Structured(Value),
}

impl MetricValue {
    /// Best-effort conversion from a JSON value extracted from a page.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Number(number) => {
                if let Some(int) = number.as_i64() {
                    MetricValue::Integer(int)
                } else {
                    MetricValue::Float(number.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(text) => MetricValue::Text(text),
            other => MetricValue::Structured(other),
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Integer(value) => write!(f, "{value}"),
            MetricValue::Float(value) => write!(f, "{value}"),
            MetricValue::Text(value) => f.write_str(value),
            MetricValue::Structured(value) => write!(f, "{value}"),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Float(value)
    }
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        MetricValue::Integer(value)
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        MetricValue::Text(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Text(value.to_string())
    }
}

impl From<Value> for MetricValue {
    fn from(value: Value) -> Self {
        MetricValue::from_json(value)
    }
}

/// Insertion-ordered metric map. Re-inserting a key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metrics {
    entries: Vec<(String, MetricValue)>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetricValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&MetricValue> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetricValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Entries ordered lexicographically by key.
    pub fn sorted(&self) -> Vec<(&str, &MetricValue)> {
        let mut entries: Vec<_> = self.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }
}

impl Serialize for Metrics {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter())
    }
}

/// Outcome of one benchmark run.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metrics: Metrics,
    pub samples: Vec<Sample>,
}

impl TestResult {
    /// Empty, not-yet-successful result stamped with the current time.
    pub fn begin(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            start: now,
            end: now,
            success: false,
            error: None,
            metrics: Metrics::new(),
            samples: Vec::new(),
        }
    }

    /// Failed result for a test that produced no result of its own.
    pub fn failed(
        name: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        error: &anyhow::Error,
    ) -> Self {
        Self {
            name: name.into(),
            start,
            end,
            success: false,
            error: Some(format!("{error:#}")),
            metrics: Metrics::new(),
            samples: Vec::new(),
        }
    }

    pub fn finish_ok(&mut self) {
        self.end = Utc::now();
        self.success = true;
        self.error = None;
    }

    pub fn finish_err(&mut self, error: impl fmt::Display) {
        self.end = Utc::now();
        self.success = false;
        self.error = Some(error.to_string());
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end.signed_duration_since(self.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_replaces_existing_key_in_place() {
        let mut metrics = Metrics::new();
        metrics.insert("b", 1i64);
        metrics.insert("a", 2.5);
        metrics.insert("b", "replaced");
        let keys: Vec<&str> = metrics.iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(metrics.get("b"), Some(&MetricValue::Text("replaced".into())));
    }

    #[test]
    fn sorted_orders_keys_lexicographically() {
        let mut metrics = Metrics::new();
        metrics.insert("zeta", 1i64);
        metrics.insert("alpha", 2i64);
        metrics.insert("Mid", 3i64);
        let keys: Vec<&str> = metrics.sorted().into_iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec!["Mid", "alpha", "zeta"]);
    }

    #[test]
    fn json_numbers_keep_integer_and_float_shape() {
        assert_eq!(MetricValue::from_json(json!(7)), MetricValue::Integer(7));
        assert_eq!(MetricValue::from_json(json!(7.25)), MetricValue::Float(7.25));
        assert_eq!(
            MetricValue::from_json(json!([{"type": "stalled"}])).to_string(),
            r#"[{"type":"stalled"}]"#
        );
    }

    #[test]
    fn failed_result_preserves_error_chain() {
        let err = anyhow::anyhow!("socket closed").context("navigation failed");
        let now = Utc::now();
        let result = TestResult::failed("motionmark", now, now, &err);
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("navigation failed: socket closed")
        );
        assert!(result.samples.is_empty());
    }
}
