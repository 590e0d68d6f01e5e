use crate::detect::Detection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-label detection counts for one unit of work.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelTally {
    counts: HashMap<String, usize>,
}

impl LabelTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_detections(dets: &[Detection]) -> Self {
        let mut tally = Self::new();
        tally.record(dets);
        tally
    }

    /// Adds one count per detection; counts only ever grow.
    pub fn record(&mut self, dets: &[Detection]) {
        for det in dets {
            *self.counts.entry(det.label.clone()).or_insert(0) += 1;
        }
    }

    pub fn merge(&mut self, other: &LabelTally) {
        for (label, count) in &other.counts {
            *self.counts.entry(label.clone()).or_insert(0) += count;
        }
    }

    pub fn get(&self, label: &str) -> usize {
        self.counts.get(label).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.counts.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Entries ordered by label, for stable display.
    pub fn sorted(&self) -> Vec<(&str, usize)> {
        let mut entries: Vec<_> = self.iter().collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
        entries
    }
}
