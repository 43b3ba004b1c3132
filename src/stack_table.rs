//! Per-size aggregation of allocations by call stack (tier 2).

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use nohash_hasher::BuildNoHashHasher;

use crate::analyzer::{LeakAnalyzer, LeakValue};
use crate::call_stack::CallStack;
use crate::ranked_list::RankedList;

const RANKED_LIST_SIZE: usize = 16;

#[derive(Debug)]
struct StackEntry {
  net_allocs: u32,
  stack: Arc<CallStack>,
}

/// Net allocation counts per call stack for one size bucket.
///
/// Entries are bucketed by the stack's precomputed 32-bit hash; that hash is
/// the only identity the address map preserves across an allocation's
/// lifetime, so frees address the table by hash as well. Zero-net entries
/// are erased and can be re-created later.
#[derive(Debug)]
pub struct CallStackTable {
  entries: HashMap<u32, StackEntry, BuildNoHashHasher<u32>>,
  leak_analyzer: LeakAnalyzer,
  num_allocs: u32,
  num_frees: u32,
}

impl CallStackTable {
  #[must_use]
  pub fn new(suspicion_threshold: u32) -> Self {
    Self {
      entries: HashMap::default(),
      leak_analyzer: LeakAnalyzer::new(RANKED_LIST_SIZE, suspicion_threshold),
      num_allocs: 0,
      num_frees: 0,
    }
  }

  /// Records one allocation attributed to `stack`.
  pub fn add(&mut self, stack: &Arc<CallStack>) {
    let entry = self
      .entries
      .entry(stack.hash())
      .or_insert_with(|| StackEntry {
        net_allocs: 0,
        stack: Arc::clone(stack),
      });

    entry.net_allocs += 1;
    self.num_allocs += 1;
  }

  /// Records one free attributed to the stack with the given hash.
  ///
  /// Unknown hashes are ignored: the table may have been attached after the
  /// matching allocation was recorded.
  pub fn remove(&mut self, hash: u32) {
    let Some(entry) = self.entries.get_mut(&hash) else {
      return;
    };

    entry.net_allocs -= 1;
    self.num_frees += 1;

    // Delete zero-net entries to free up space.
    if entry.net_allocs == 0 {
      self.entries.remove(&hash);
    }
  }

  /// Ranks the positive-net stacks and feeds the embedded analyzer.
  pub fn test_for_leaks(&mut self) {
    let mut ranked_list = RankedList::new(RANKED_LIST_SIZE);

    for entry in self.entries.values() {
      if entry.net_allocs > 0 {
        ranked_list.add(
          LeakValue::Stack(Arc::clone(&entry.stack)),
          i64::from(entry.net_allocs),
        );
      }
    }

    self.leak_analyzer.add_sample(ranked_list);
  }

  #[must_use]
  pub fn leak_analyzer(&self) -> &LeakAnalyzer {
    &self.leak_analyzer
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  #[must_use]
  pub fn num_allocs(&self) -> u32 {
    self.num_allocs
  }

  #[must_use]
  pub fn num_frees(&self) -> u32 {
    self.num_frees
  }

  /// Renders table totals and the analyzer state for verbose logging.
  #[must_use]
  pub fn dump(&self) -> String {
    let mut out = String::new();

    let _ = writeln!(
      out,
      "allocs: {}, frees: {}, net: {}, distinct stacks: {}",
      self.num_allocs,
      self.num_frees,
      self.num_allocs - self.num_frees,
      self.entries.len()
    );
    let _ = write!(out, "{}", self.leak_analyzer.dump());

    out
  }
}
