//! Execution result types.
//!
//! Backends write their results as JSON. Three shapes are accepted by
//! [`ResultPayload::from_json`]:
//!
//! ```text
//! {"counts": {"00": 498, "11": 502}, "backend": "..."}   counts + metadata
//! {"00": 498, "11": 502}                                 flat counts
//! {"c": {"00": 498, "11": 502}}                          per-register counts
//! ```

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{HalError, HalResult};

/// Measurement counts from circuit execution.
///
/// Maps bitstrings to occurrence counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    counts: FxHashMap<String, u64>,
}

impl Counts {
    /// Create empty counts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create counts from an iterator of (bitstring, count) pairs.
    /// Duplicate bitstrings are accumulated.
    pub fn from_pairs(iter: impl IntoIterator<Item = (impl Into<String>, u64)>) -> Self {
        let mut counts = Self::new();
        for (k, v) in iter {
            counts.insert(k, v);
        }
        counts
    }

    /// Insert a count for a bitstring. Accumulation saturates at `u64::MAX`.
    pub fn insert(&mut self, bitstring: impl Into<String>, count: u64) {
        let slot = self.counts.entry(bitstring.into()).or_default();
        *slot = slot.saturating_add(count);
    }

    /// Get the count for a bitstring.
    pub fn get(&self, bitstring: &str) -> u64 {
        self.counts.get(bitstring).copied().unwrap_or(0)
    }

    /// Iterate over (bitstring, count) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.counts.iter()
    }

    /// Get the total number of shots, saturating at `u64::MAX`.
    pub fn total_shots(&self) -> u64 {
        self.counts
            .values()
            .fold(0u64, |acc, &count| acc.saturating_add(count))
    }

    /// Total number of shots, or `None` if it does not fit in a `u64`.
    pub fn checked_total(&self) -> Option<u64> {
        self.counts
            .values()
            .try_fold(0u64, |acc, &count| acc.checked_add(count))
    }

    /// Get the most frequent bitstring.
    pub fn most_frequent(&self) -> Option<(&String, &u64)> {
        self.counts.iter().max_by_key(|&(_, count)| count)
    }

    /// Get probabilities for each bitstring.
    #[allow(clippy::cast_precision_loss)]
    pub fn probabilities(&self) -> FxHashMap<String, f64> {
        let total = self.total_shots() as f64;
        if total == 0.0 {
            return FxHashMap::default();
        }
        self.counts
            .iter()
            .map(|(k, &v)| (k.clone(), v as f64 / total))
            .collect()
    }

    /// Get sorted counts (by count, descending; ties by bitstring).
    pub fn sorted(&self) -> Vec<(&String, &u64)> {
        let mut items: Vec<_> = self.counts.iter().collect();
        items.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        items
    }

    /// Width of the bitstrings, if non-empty.
    pub fn bit_width(&self) -> Option<usize> {
        self.counts.keys().next().map(String::len)
    }

    /// Get the number of unique bitstrings.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Check if counts are empty.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Parse a flat `{bitstring: count}` object.
    fn from_map(map: &Map<String, Value>, context: &str) -> HalResult<Self> {
        let mut counts = Self::new();
        let mut width = None;
        let mut total = 0u64;

        for (bitstring, value) in map {
            if bitstring.is_empty() || !bitstring.chars().all(|c| c == '0' || c == '1') {
                return Err(HalError::InvalidResult(format!(
                    "{context}: '{bitstring}' is not a bitstring"
                )));
            }
            match width {
                None => width = Some(bitstring.len()),
                Some(w) if w != bitstring.len() => {
                    return Err(HalError::InvalidResult(format!(
                        "{context}: mixed bitstring widths {w} and {}",
                        bitstring.len()
                    )));
                }
                Some(_) => {}
            }
            let count = value.as_u64().ok_or_else(|| {
                HalError::InvalidResult(format!(
                    "{context}: count for '{bitstring}' is not a non-negative integer: {value}"
                ))
            })?;
            total = total.checked_add(count).ok_or_else(|| {
                HalError::InvalidResult(format!("{context}: shot total overflows"))
            })?;
            counts.insert(bitstring.clone(), count);
        }

        Ok(counts)
    }
}

impl FromIterator<(String, u64)> for Counts {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        let mut counts = Self::new();
        for (key, value) in iter {
            counts.insert(key, value);
        }
        counts
    }
}

/// Parsed contents of a results artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    /// Counts of the primary (or only) classical register.
    pub counts: Counts,
    /// Per-register counts; empty unless the backend reported registers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub registers: BTreeMap<String, Counts>,
    /// Opaque backend metadata.
    #[serde(default)]
    pub metadata: Value,
}

impl ResultPayload {
    /// Payload with counts only.
    pub fn new(counts: Counts) -> Self {
        Self {
            counts,
            registers: BTreeMap::new(),
            metadata: Value::Null,
        }
    }

    /// Parse and validate a results document.
    pub fn from_json(value: Value) -> HalResult<Self> {
        let Value::Object(mut map) = value else {
            return Err(HalError::InvalidResult(
                "results document is not a JSON object".into(),
            ));
        };

        if let Some(inner) = map.remove("counts") {
            let mut payload = Self::from_json(inner)?;
            payload.metadata = Value::Object(map);
            return Ok(payload);
        }

        if map.is_empty() {
            return Err(HalError::InvalidResult("results document is empty".into()));
        }

        if map.values().all(Value::is_object) {
            let mut registers = BTreeMap::new();
            for (name, value) in &map {
                if let Value::Object(inner) = value {
                    let counts = Counts::from_map(inner, &format!("register '{name}'"))?;
                    registers.insert(name.clone(), counts);
                }
            }
            let counts = registers.values().next().cloned().unwrap_or_default();
            return Ok(Self {
                counts,
                registers,
                metadata: Value::Null,
            });
        }

        Ok(Self::new(Counts::from_map(&map, "counts")?))
    }

    /// Parse a results document from text.
    pub fn from_str_json(raw: &str) -> HalResult<Self> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_json(value)
    }

    /// Total shots across the primary register.
    pub fn total_shots(&self) -> u64 {
        self.counts.total_shots()
    }
}

const QUEUE_KEYS: &[&str] = &["queue_wait_secs", "queue_time", "queue_wait"];
const EXECUTION_KEYS: &[&str] = &[
    "execution_secs",
    "execution_time",
    "elapsed_time",
    "elapsed",
];

/// Timing and diagnostics reported for an executed job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// Seconds the job spent queued before it started.
    pub queue_wait_secs: f64,
    /// Seconds the job spent executing.
    pub execution_secs: f64,
    /// Raw backend-reported diagnostics.
    #[serde(default)]
    pub diagnostics: Value,
}

impl ExecutionMetrics {
    /// Zeroed metrics with no diagnostics.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Best-effort extraction from a metrics document.
    pub fn from_json(value: Value) -> Self {
        Self::from_json_or(value, 0.0, 0.0)
    }

    /// Like [`from_json`](Self::from_json), using the given times for fields
    /// the document does not report.
    pub fn from_json_or(value: Value, queue_wait_secs: f64, execution_secs: f64) -> Self {
        let queue = lookup_secs(&value, QUEUE_KEYS).unwrap_or(queue_wait_secs);
        let exec = lookup_secs(&value, EXECUTION_KEYS).unwrap_or(execution_secs);
        Self {
            queue_wait_secs: non_negative(queue),
            execution_secs: non_negative(exec),
            diagnostics: value,
        }
    }

    /// Metrics built only from observed times.
    pub fn observed(queue_wait_secs: f64, execution_secs: f64) -> Self {
        Self::from_json_or(Value::Null, queue_wait_secs, execution_secs)
    }
}

fn lookup_secs(value: &Value, keys: &[&str]) -> Option<f64> {
    let map = value.as_object()?;
    keys.iter().find_map(|k| map.get(*k).and_then(Value::as_f64))
}

fn non_negative(v: f64) -> f64 {
    if v.is_finite() && v > 0.0 { v } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flat_counts() {
        let payload = ResultPayload::from_json(json!({"00": 498, "11": 502})).unwrap();
        assert_eq!(payload.total_shots(), 1000);
        assert_eq!(payload.counts.get("11"), 502);
        assert!(payload.registers.is_empty());
        assert_eq!(payload.counts.bit_width(), Some(2));
    }

    #[test]
    fn test_counts_with_metadata() {
        let payload = ResultPayload::from_json(json!({
            "counts": {"0": 10, "1": 6},
            "backend": "simulator_rtcs",
        }))
        .unwrap();
        assert_eq!(payload.total_shots(), 16);
        assert_eq!(payload.metadata["backend"], "simulator_rtcs");
    }

    #[test]
    fn test_register_counts() {
        let payload = ResultPayload::from_json(json!({
            "b": {"1": 3},
            "a": {"01": 4, "10": 6},
        }))
        .unwrap();
        assert_eq!(payload.registers.len(), 2);
        // first register in name order
        assert_eq!(payload.counts.get("10"), 6);
    }

    #[test]
    fn test_invalid_bitstring() {
        let err = ResultPayload::from_json(json!({"0x": 3})).unwrap_err();
        assert!(err.to_string().contains("not a bitstring"));
    }

    #[test]
    fn test_negative_count() {
        assert!(ResultPayload::from_json(json!({"00": -1})).is_err());
    }

    #[test]
    fn test_overflowing_total() {
        let err = ResultPayload::from_json(json!({"0": u64::MAX, "1": 1})).unwrap_err();
        assert!(err.to_string().contains("overflows"));

        let counts = Counts::from_pairs([("0", u64::MAX), ("1", 1)]);
        assert_eq!(counts.total_shots(), u64::MAX);
        assert_eq!(counts.checked_total(), None);
    }

    #[test]
    fn test_mixed_widths() {
        assert!(ResultPayload::from_json(json!({"00": 1, "1": 1})).is_err());
    }

    #[test]
    fn test_not_an_object() {
        assert!(ResultPayload::from_json(json!([1, 2])).is_err());
        assert!(ResultPayload::from_str_json("{not json").is_err());
        assert!(ResultPayload::from_json(json!({})).is_err());
    }

    #[test]
    fn test_metrics_fields() {
        let m = ExecutionMetrics::from_json(json!({"queue_time": 1.5, "elapsed_time": 0.25}));
        assert_eq!(m.queue_wait_secs, 1.5);
        assert_eq!(m.execution_secs, 0.25);
        assert_eq!(m.diagnostics["queue_time"], 1.5);
    }

    #[test]
    fn test_metrics_fallback_and_clamp() {
        let m = ExecutionMetrics::from_json_or(json!({"execution_time": -3.0}), 2.0, 7.0);
        assert_eq!(m.queue_wait_secs, 2.0);
        assert_eq!(m.execution_secs, 0.0);

        let m = ExecutionMetrics::from_json(json!("garbage"));
        assert_eq!(m, ExecutionMetrics::from_json_or(json!("garbage"), 0.0, 0.0));
    }

    #[test]
    fn test_sorted_counts() {
        let counts = Counts::from_pairs([("01", 5u64), ("00", 9), ("11", 5)]);
        let sorted = counts.sorted();
        assert_eq!(sorted[0].0, "00");
        assert_eq!(sorted[1].0, "01");
        assert_eq!(sorted[2].0, "11");
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn parsed_total_equals_sum(entries in proptest::collection::btree_map("[01]{6}", 0u64..10_000, 1..8)) {
                let expected: u64 = entries.values().sum();
                let doc: Map<String, Value> = entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect();
                let payload = ResultPayload::from_json(Value::Object(doc)).unwrap();
                prop_assert_eq!(payload.total_shots(), expected);
            }
        }
    }
}
