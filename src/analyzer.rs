//! Hysteresis-based suspicion scoring over ranked allocation data.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::mem;
use std::sync::Arc;

use crate::call_stack::CallStack;
use crate::ranked_list::RankedList;

/// A value under analysis: an allocation size at tier 1, an interned call
/// stack at tier 2.
///
/// Call stacks compare by their interned address, which is stable for the
/// lifetime of the detector and gives the report stream a deterministic
/// order within a single run.
#[derive(Debug, Clone)]
pub enum LeakValue {
  Size(u32),
  Stack(Arc<CallStack>),
}

impl LeakValue {
  fn rank(&self) -> (u8, u64) {
    match self {
      Self::Size(size) => (0, u64::from(*size)),
      Self::Stack(stack) => (1, Arc::as_ptr(stack) as u64),
    }
  }
}

impl PartialEq for LeakValue {
  fn eq(&self, other: &Self) -> bool {
    self.rank() == other.rank()
  }
}

impl Eq for LeakValue {}

impl PartialOrd for LeakValue {
  fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
    Some(self.cmp(other))
  }
}

impl Ord for LeakValue {
  fn cmp(&self, other: &Self) -> CmpOrdering {
    self.rank().cmp(&other.rank())
  }
}

/// Converts a time series of top-K rankings into a stable suspect set.
///
/// Each sample is diffed against the previous one; entries whose growth
/// stands out from their peers gain a suspicion point, entries that stop
/// standing out lose one, and entries whose count shrinks are cleared
/// entirely. A value is reported once its score reaches the threshold and
/// stays reported until its count is seen shrinking.
#[derive(Debug)]
pub struct LeakAnalyzer {
  prev_ranked_entries: RankedList,
  ranked_entries: RankedList,
  ranking_size: usize,
  reported_leaks: BTreeSet<LeakValue>,
  score_threshold: u32,
  suspicion_scores: BTreeMap<LeakValue, u32>,
}

impl LeakAnalyzer {
  #[must_use]
  pub fn new(ranking_size: usize, score_threshold: u32) -> Self {
    Self {
      prev_ranked_entries: RankedList::new(ranking_size),
      ranked_entries: RankedList::new(ranking_size),
      ranking_size,
      reported_leaks: BTreeSet::new(),
      score_threshold,
      suspicion_scores: BTreeMap::new(),
    }
  }

  /// Feeds the ranking for the current analysis cycle.
  pub fn add_sample(&mut self, ranked_list: RankedList) {
    self.prev_ranked_entries =
      mem::replace(&mut self.ranked_entries, ranked_list);

    let mut deltas = RankedList::new(self.ranking_size);
    for entry in self.ranked_entries.iter() {
      let prev = self
        .prev_ranked_entries
        .count_for(&entry.value)
        .unwrap_or(0);
      deltas.add(entry.value.clone(), entry.count - prev);
    }

    self.analyze_deltas(&deltas);
  }

  /// Values currently considered leaks, in ascending value order.
  pub fn suspected_leaks(&self) -> impl Iterator<Item = &LeakValue> {
    self.reported_leaks.iter()
  }

  #[must_use]
  pub fn has_suspected_leaks(&self) -> bool {
    !self.reported_leaks.is_empty()
  }

  /// Renders the current ranking and suspect state for verbose logging.
  #[must_use]
  pub fn dump(&self) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "top {} entries:", self.ranked_entries.len());
    for entry in self.ranked_entries.iter() {
      let _ = writeln!(out, "  {}: {}", describe(&entry.value), entry.count);
    }

    let _ = writeln!(out, "suspicion scores:");
    for (value, score) in &self.suspicion_scores {
      let _ = writeln!(out, "  {}: {}", describe(value), score);
    }

    let _ = write!(out, "suspected leaks:");
    for value in &self.reported_leaks {
      let _ = write!(out, " {}", describe(value));
    }

    out
  }

  fn analyze_deltas(&mut self, deltas: &RankedList) {
    let suspects = rising_outliers(deltas);

    let tracked: Vec<LeakValue> = self.suspicion_scores.keys().cloned().collect();
    for value in tracked {
      if suspects.contains(&value) {
        continue;
      }

      let shrunk = match deltas.count_for(&value) {
        None => true,
        Some(delta) => delta < 0,
      };

      if shrunk {
        // The count went down: this was churn, not a leak.
        self.suspicion_scores.remove(&value);
        self.reported_leaks.remove(&value);
      } else if let Some(score) = self.suspicion_scores.get_mut(&value) {
        *score -= 1;
        if *score == 0 {
          // Decayed out of the histogram; a plateaued leak stays reported.
          self.suspicion_scores.remove(&value);
        }
      }
    }

    for value in suspects {
      let score = self.suspicion_scores.entry(value.clone()).or_insert(0);
      *score = (*score + 1).min(self.score_threshold.max(1));

      if *score >= self.score_threshold {
        self.reported_leaks.insert(value);
      }
    }
  }
}

/// Picks the entries whose positive delta stands out above the peer group.
///
/// An entry is an outlier if its delta is positive, strictly above the mean
/// of all deltas in the ranking, and at least one standard deviation above
/// it. A singleton ranking with a positive delta is its own outlier; the
/// score threshold keeps one-off spikes from being reported.
fn rising_outliers(deltas: &RankedList) -> Vec<LeakValue> {
  if deltas.is_empty() {
    return Vec::new();
  }

  if deltas.len() == 1 {
    return deltas
      .iter()
      .filter(|entry| entry.count > 0)
      .map(|entry| entry.value.clone())
      .collect();
  }

  let n = deltas.len() as f64;
  let mean = deltas.iter().map(|entry| entry.count as f64).sum::<f64>() / n;
  let variance = deltas
    .iter()
    .map(|entry| {
      let deviation = entry.count as f64 - mean;
      deviation * deviation
    })
    .sum::<f64>()
    / n;
  let cutoff = mean + variance.sqrt();

  deltas
    .iter()
    .filter(|entry| {
      let delta = entry.count as f64;
      entry.count > 0 && delta > mean && delta >= cutoff
    })
    .map(|entry| entry.value.clone())
    .collect()
}

fn describe(value: &LeakValue) -> String {
  match value {
    LeakValue::Size(size) => format!("size {size}"),
    LeakValue::Stack(stack) => format!("stack {:p}", Arc::as_ptr(stack)),
  }
}
