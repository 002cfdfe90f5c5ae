//! Per-record tallies that survive the trip through the result map.
//!
//! Worker stages typically count things: records routed, records matching a
//! filter, per-category totals. A [`CountMap`] is a string-keyed counter that
//! serializes into the stage result and can be merged across workers after
//! the join.

use std::collections::BTreeMap;
use std::io::Write;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A string-keyed tally, mergeable across stages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CountMap {
    counts: BTreeMap<String, f64>,
}

impl CountMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments `key` by one.
    pub fn count(&mut self, key: impl Into<String>) {
        self.count_by(key, 1.0);
    }

    /// Increments `key` by an arbitrary amount.
    pub fn count_by(&mut self, key: impl Into<String>, inc: f64) {
        *self.counts.entry(key.into()).or_default() += inc;
    }

    pub fn get(&self, key: &str) -> f64 {
        self.counts.get(key).copied().unwrap_or(0.0)
    }

    /// Folds another tally into this one.
    pub fn merge(&mut self, other: &CountMap) {
        for (key, value) in &other.counts {
            *self.counts.entry(key.clone()).or_default() += value;
        }
    }

    /// Collects the tallies published by several stages, e.g. all entries of
    /// a run's result map that deserialize as counters.
    pub fn merged<'a>(values: impl IntoIterator<Item = &'a Value>) -> Self {
        let mut total = CountMap::new();
        for value in values {
            if let Ok(other) = serde_json::from_value::<CountMap>(value.clone()) {
                total.merge(&other);
            }
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.counts.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Serializes into a stage result value.
    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Writes the tallies as key/value TSV rows in key order.
    pub fn write_tsv(&self, mut out: impl Write) -> std::io::Result<()> {
        for (key, value) in &self.counts {
            writeln!(out, "{key}\t{value}")?;
        }
        Ok(())
    }
}
