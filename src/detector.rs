//! Two-tier statistical leak detection over recorded events.
//!
//! Tier 1 ranks net allocation counts per quantised size bucket and feeds a
//! [`LeakAnalyzer`]; sizes it flags get a [`CallStackTable`] attached
//! lazily. Tier 2 then ranks the call stacks within each attached table.
//! Suspected stacks become [`LeakReport`]s with mapping-relative frame
//! offsets.

use super::*;

const RANKED_LIST_SIZE: usize = 16;

// Sizes are quantised to 4-byte buckets; the table covers allocations up to
// (NUM_SIZE_ENTRIES * 4 - 1) bytes.
const NUM_SIZE_ENTRIES: usize = 2048;
const SIZE_QUANTUM: usize = 4;

// Oversize allocations fold into bucket zero, sharing it with zero-byte
// allocations.
fn size_to_index(size: usize) -> usize {
  let index = size / SIZE_QUANTUM;
  if index < NUM_SIZE_ENTRIES { index } else { 0 }
}

fn index_to_size(index: usize) -> u32 {
  (SIZE_QUANTUM * index) as u32
}

// The compact map stores a 15-bit size; anything wider records as zero,
// which lands in the same folded bucket on the free path.
fn storable_size(size: usize) -> u16 {
  if size <= 0x7fff { size as u16 } else { 0 }
}

/// Per-bucket table of "does this size need a stack unwind".
///
/// Written under the detector lock when a table is attached, read lock-free
/// from the allocation hot path so unsampled events never wait on the
/// detector.
pub struct StackTraceFlags {
  flags: [AtomicBool; NUM_SIZE_ENTRIES],
}

impl StackTraceFlags {
  #[must_use]
  pub const fn new() -> Self {
    Self {
      flags: [const { AtomicBool::new(false) }; NUM_SIZE_ENTRIES],
    }
  }

  #[must_use]
  pub fn should_capture(&self, size: usize) -> bool {
    self.flags[size_to_index(size)].load(Ordering::Acquire)
  }

  pub(crate) fn mark(&self, size: usize) {
    self.flags[size_to_index(size)].store(true, Ordering::Release);
  }

  pub(crate) fn clear_all(&self) {
    for flag in &self.flags {
      flag.store(false, Ordering::Release);
    }
  }
}

impl Default for StackTraceFlags {
  fn default() -> Self {
    Self::new()
  }
}

/// A suspected leak: an allocation size and the frames of its call stack,
/// translated to offsets within the host binary's mapping where possible.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct LeakReport {
  pub alloc_size_bytes: u32,
  pub call_stack_offsets: Vec<u64>,
}

impl Serialize for LeakReport {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    let mut state = serializer.serialize_struct("LeakReport", 2)?;
    state.serialize_field("alloc_size_bytes", &self.alloc_size_bytes)?;
    state.serialize_field("call_stack_offsets", &self.call_stack_offsets)?;
    state.end()
  }
}

/// Running counters, including the degradation counters that replace hard
/// failures.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetectorStats {
  pub alloc_size: u64,
  /// Events dropped because the arena could not grow.
  pub dropped_events: u64,
  pub free_size: u64,
  pub num_allocs: u64,
  pub num_allocs_with_call_stack: u64,
  pub num_frees: u64,
  pub num_stack_tables: u32,
  /// Times a bucket transiently showed more frees than allocs and was
  /// clamped to a net of zero.
  pub underflow_clamps: u64,
}

#[derive(Default)]
struct AllocSizeEntry {
  num_allocs: u32,
  num_frees: u32,
  stack_table: Option<Box<CallStackTable>>,
}

/// The leak detection engine. One instance per process, driven under the
/// caller's lock; see the `state` module for the global installation.
pub struct LeakDetector {
  address_map: CompactAddressMap,
  arena: Arc<Arena>,
  call_stack_suspicion_threshold: u32,
  call_stacks: CallStackManager,
  flags: Arc<StackTraceFlags>,
  mapping_addr: u64,
  mapping_size: u64,
  size_entries: Vec<AllocSizeEntry>,
  size_leak_analyzer: LeakAnalyzer,
  stats: DetectorStats,
  verbose: bool,
}

impl LeakDetector {
  /// # Errors
  ///
  /// Returns an error if the private arena cannot be mapped.
  pub fn new(config: &DetectorConfig) -> io::Result<Self> {
    Self::with_flags(config, Arc::new(StackTraceFlags::new()))
  }

  /// Builds a detector publishing its stack-trace flags through `flags`,
  /// which the caller may share with lock-free readers.
  ///
  /// # Errors
  ///
  /// Returns an error if the private arena cannot be mapped.
  pub fn with_flags(
    config: &DetectorConfig,
    flags: Arc<StackTraceFlags>,
  ) -> io::Result<Self> {
    let arena = Arc::new(Arena::new()?);
    let address_map = CompactAddressMap::new(Arc::clone(&arena))
      .ok_or_else(|| io::Error::other("arena exhausted during setup"))?;

    Ok(Self {
      address_map,
      arena,
      call_stack_suspicion_threshold: config.call_stack_suspicion_threshold,
      call_stacks: CallStackManager::new(),
      flags,
      mapping_addr: config.mapping_addr,
      mapping_size: config.mapping_size,
      size_entries: (0..NUM_SIZE_ENTRIES)
        .map(|_| AllocSizeEntry::default())
        .collect(),
      size_leak_analyzer: LeakAnalyzer::new(
        RANKED_LIST_SIZE,
        config.size_suspicion_threshold,
      ),
      stats: DetectorStats::default(),
      verbose: config.verbose,
    })
  }

  /// Whether an allocation of `size` should arrive with captured frames.
  #[must_use]
  pub fn should_get_stack_trace_for_size(&self, size: usize) -> bool {
    self.size_entries[size_to_index(size)].stack_table.is_some()
  }

  /// The lock-free view of [`Self::should_get_stack_trace_for_size`].
  #[must_use]
  pub fn flags(&self) -> Arc<StackTraceFlags> {
    Arc::clone(&self.flags)
  }

  /// Records a sampled allocation. `frames` may be empty when the size has
  /// no stack table attached or capture failed.
  pub fn record_alloc(&mut self, ptr: u64, size: usize, frames: &[u64]) {
    self.stats.num_allocs += 1;
    self.stats.alloc_size += size as u64;

    let index = size_to_index(size);
    self.size_entries[index].num_allocs += 1;

    let mut call_stack_hash = None;
    if let Some(table) = self.size_entries[index].stack_table.as_mut() {
      if !frames.is_empty() {
        let stack = self.call_stacks.intern(frames);
        table.add(&stack);
        call_stack_hash = Some(stack.hash());
        self.stats.num_allocs_with_call_stack += 1;
      }
    }

    if !self.address_map.insert(ptr, storable_size(size), call_stack_hash) {
      self.stats.dropped_events += 1;
    }
  }

  /// Records a sampled free. Unknown pointers are ignored; their
  /// allocation was not sampled.
  pub fn record_free(&mut self, ptr: u64) {
    let Some(record) = self.address_map.find_and_remove(ptr) else {
      return;
    };

    let entry = &mut self.size_entries[size_to_index(record.size as usize)];
    entry.num_frees += 1;

    if let (Some(table), Some(hash)) =
      (entry.stack_table.as_mut(), record.call_stack_hash)
    {
      table.remove(hash);
    }

    self.stats.num_frees += 1;
    self.stats.free_size += u64::from(record.size);
  }

  /// Runs one analysis pass and replaces `reports` with the suspected
  /// leaks, ordered by size and then by call-stack offsets.
  pub fn test_for_leaks(
    &mut self,
    do_logging: bool,
    reports: &mut Vec<LeakReport>,
  ) {
    if do_logging {
      self.log_stats();
    }

    // Tier 1: rank the net allocation counts of every size bucket.
    let mut size_ranked_list = RankedList::new(RANKED_LIST_SIZE);
    for (index, entry) in self.size_entries.iter().enumerate() {
      if entry.num_frees > entry.num_allocs {
        self.stats.underflow_clamps += 1;
      }
      let net = entry.num_allocs.saturating_sub(entry.num_frees);
      size_ranked_list.add(LeakValue::Size(index_to_size(index)), i64::from(net));
    }
    self.size_leak_analyzer.add_sample(size_ranked_list);

    if do_logging && self.verbose {
      tracing::debug!("size analyzer:\n{}", self.size_leak_analyzer.dump());
    }

    // Attach a call stack table to each newly suspected size.
    let suspected_sizes: Vec<u32> = self
      .size_leak_analyzer
      .suspected_leaks()
      .filter_map(|value| match value {
        LeakValue::Size(size) => Some(*size),
        LeakValue::Stack(_) => None,
      })
      .collect();

    for size in suspected_sizes {
      let entry = &mut self.size_entries[size_to_index(size as usize)];
      if entry.stack_table.is_some() {
        continue;
      }

      if do_logging {
        tracing::info!(size, "adding stack table for suspected size");
      }

      entry.stack_table = Some(Box::new(CallStackTable::new(
        self.call_stack_suspicion_threshold,
      )));
      self.flags.mark(size as usize);
      self.stats.num_stack_tables += 1;
    }

    // Tier 2: check every attached table. A table created just above only
    // sees its first sample on the next pass, so the extra visit is cheap.
    reports.clear();
    let mapping_addr = self.mapping_addr;
    let mapping_size = self.mapping_size;

    for index in 0..self.size_entries.len() {
      let alloc_size_bytes = index_to_size(index);
      let Some(table) = self.size_entries[index].stack_table.as_mut() else {
        continue;
      };
      if table.is_empty() {
        continue;
      }

      if do_logging && self.verbose {
        tracing::debug!(
          size = alloc_size_bytes,
          "stack table:\n{}",
          table.dump()
        );
      }

      table.test_for_leaks();

      for value in table.leak_analyzer().suspected_leaks() {
        let LeakValue::Stack(stack) = value else {
          continue;
        };

        let call_stack_offsets: Vec<u64> = stack
          .frames()
          .iter()
          .map(|&frame| offset_in_mapping(mapping_addr, mapping_size, frame))
          .collect();

        if do_logging {
          tracing::info!(
            size = alloc_size_bytes,
            offsets = ?call_stack_offsets,
            "suspected call stack"
          );
        }

        reports.push(LeakReport {
          alloc_size_bytes,
          call_stack_offsets,
        });
      }
    }

    reports.sort();
  }

  #[must_use]
  pub fn stats(&self) -> DetectorStats {
    self.stats
  }

  #[must_use]
  pub fn arena_stats(&self) -> ArenaStats {
    self.arena.stats()
  }

  #[must_use]
  pub fn address_map_stats(&self) -> AddressMapStats {
    self.address_map.stats()
  }

  /// Number of live entries in the address map.
  #[must_use]
  pub fn num_live_entries(&self) -> usize {
    self.address_map.len()
  }

  fn log_stats(&self) {
    let with_stack_pct = if self.stats.num_allocs > 0 {
      100.0 * self.stats.num_allocs_with_call_stack as f64
        / self.stats.num_allocs as f64
    } else {
      0.0
    };

    tracing::info!(
      alloc_size = self.stats.alloc_size,
      free_size = self.stats.free_size,
      net_alloc_size = self.stats.alloc_size - self.stats.free_size,
      stack_tables = self.stats.num_stack_tables,
      with_stack_pct,
      call_stacks = self.call_stacks.len(),
      live_entries = self.address_map.len(),
      dropped_events = self.stats.dropped_events,
      "leak detector stats"
    );
  }
}

fn offset_in_mapping(mapping_addr: u64, mapping_size: u64, addr: u64) -> u64 {
  if mapping_addr != 0
    && addr >= mapping_addr
    && addr < mapping_addr + mapping_size
  {
    addr - mapping_addr
  } else {
    addr
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeSet;

  // The mapping location in memory for a fictional executable.
  const MAPPING_ADDR: u64 = 0x800000;
  const MAPPING_SIZE: u64 = 0x200000;

  // Some call stacks within the fictional executable; entries marked with
  // a trailing comment lie outside the mapping range, e.g. JIT code.
  const STACK0: &[u64] = &[0x800100, 0x900000, 0x880080, 0x810000];
  const STACK1: &[u64] = &[
    0x940000, 0x980000, 0xdeadbeef, // outside
    0x9a0000,
  ];
  const STACK2: &[u64] = &[0x8f0d00, 0x803abc, 0x9100a0];
  const STACK3: &[u64] = &[
    0x90fcde, 0x900df00d, // outside
    0x801000, 0x880088, 0xdeadcafe, // outside
    0x9f0000, 0x8700a0, 0x96037c,
  ];
  const STACK4: &[u64] = &[
    0x8c0000, 0x85d00d, 0x921337, 0x780000, // outside
  ];
  const STACK5: &[u64] = &[
    0x990000, 0x888888, 0x830ac0, 0x8e0000, 0xc00000, // outside
  ];

  // Analysis cadence for the end-to-end scenarios, in allocated bytes.
  const ANALYSIS_INTERVAL: u64 = 8192;

  struct Harness {
    detector: LeakDetector,
    next_analysis_size: u64,
    next_ptr: u64,
    stored_reports: BTreeSet<LeakReport>,
    total_alloced_size: u64,
    total_num_allocs: u64,
    total_num_frees: u64,
  }

  impl Harness {
    fn new() -> Self {
      let config = DetectorConfig::default()
        .with_mapping(MAPPING_ADDR, MAPPING_SIZE)
        .with_suspicion_thresholds(4, 4);

      Self {
        detector: LeakDetector::new(&config).expect("arena setup failed"),
        next_analysis_size: ANALYSIS_INTERVAL,
        next_ptr: 0x4000_0000,
        stored_reports: BTreeSet::new(),
        total_alloced_size: 0,
        total_num_allocs: 0,
        total_num_frees: 0,
      }
    }

    // Mirrors the hook pipeline: frames only travel when the detector asks
    // for them, and an analysis runs every ANALYSIS_INTERVAL bytes.
    fn alloc(&mut self, size: usize, stack: &[u64]) -> u64 {
      let ptr = self.next_ptr;
      self.next_ptr += 1024;

      let frames = if self.detector.should_get_stack_trace_for_size(size) {
        stack
      } else {
        &[]
      };
      self.detector.record_alloc(ptr, size, frames);

      self.total_num_allocs += 1;
      self.total_alloced_size += size as u64;

      if self.total_alloced_size >= self.next_analysis_size {
        let mut reports = Vec::new();
        self.detector.test_for_leaks(false, &mut reports);
        self.stored_reports.extend(reports);

        while self.total_alloced_size >= self.next_analysis_size {
          self.next_analysis_size += ANALYSIS_INTERVAL;
        }
      }

      ptr
    }

    fn free(&mut self, ptr: u64) {
      self.detector.record_free(ptr);
      self.total_num_frees += 1;
    }
  }

  fn expected_offsets(stack: &[u64]) -> Vec<u64> {
    stack
      .iter()
      .map(|&frame| {
        if frame >= MAPPING_ADDR && frame < MAPPING_ADDR + MAPPING_SIZE {
          frame - MAPPING_ADDR
        } else {
          frame
        }
      })
      .collect()
  }

  #[test]
  fn counters_follow_allocs_and_frees() {
    let mut harness = Harness::new();

    let ptr0 = harness.alloc(12, STACK0);
    let ptr1 = harness.alloc(16, STACK0);
    let ptr2 = harness.alloc(24, STACK0);
    assert_eq!(3, harness.detector.stats().num_allocs);
    assert_eq!(3, harness.detector.num_live_entries());

    harness.free(ptr1);
    assert_eq!(1, harness.detector.stats().num_frees);
    assert_eq!(2, harness.detector.num_live_entries());

    let ptr3 = harness.alloc(72, STACK1);
    let ptr4 = harness.alloc(104, STACK1);
    let ptr5 = harness.alloc(96, STACK1);
    let ptr6 = harness.alloc(24, STACK1);
    assert_eq!(7, harness.detector.stats().num_allocs);

    for ptr in [ptr2, ptr4, ptr6, ptr0, ptr3, ptr5] {
      harness.free(ptr);
    }
    assert_eq!(7, harness.detector.stats().num_frees);
    assert_eq!(0, harness.detector.num_live_entries());
    assert_eq!(
      harness.detector.stats().alloc_size,
      harness.detector.stats().free_size
    );
  }

  #[test]
  fn free_of_unknown_pointer_is_a_no_op() {
    let mut harness = Harness::new();

    harness.alloc(64, STACK0);
    harness.detector.record_free(0xdead_beef_0000);

    let stats = harness.detector.stats();
    assert_eq!(1, stats.num_allocs);
    assert_eq!(0, stats.num_frees);
    assert_eq!(0, stats.free_size);
  }

  #[test]
  fn steady_state_produces_no_reports() {
    let mut harness = Harness::new();

    let sizes = [12usize, 16, 24, 72, 96, 104];
    for _ in 0..1000 {
      for (i, &size) in sizes.iter().enumerate() {
        let stack = [STACK0, STACK1, STACK2, STACK3, STACK4, STACK5][i];
        let ptr = harness.alloc(size, stack);
        harness.free(ptr);
      }
    }

    assert_eq!(harness.total_num_allocs, harness.total_num_frees);
    assert!(harness.stored_reports.is_empty());
    assert_eq!(0, harness.detector.num_live_entries());
  }

  #[test]
  fn linear_growth_at_two_sites_is_reported_in_size_order() {
    let mut harness = Harness::new();

    let leak_size_a = 56usize;
    let leak_size_b = 68usize;

    for _ in 0..20 {
      // Two leaky sites: nothing allocated here is ever freed.
      for _ in 0..4 {
        harness.alloc(leak_size_a, STACK3);
      }
      for _ in 0..3 {
        harness.alloc(leak_size_b, STACK4);
      }

      // Matched churn at other sites, including the leaky sizes.
      for _ in 0..30 {
        let a = harness.alloc(16, STACK0);
        let b = harness.alloc(40, STACK1);
        let c = harness.alloc(leak_size_a, STACK2);
        let d = harness.alloc(leak_size_b, STACK5);
        for ptr in [a, b, c, d] {
          harness.free(ptr);
        }
      }
    }

    assert!(harness.total_num_allocs > harness.total_num_frees);
    assert_eq!(2, harness.stored_reports.len());

    let reports: Vec<&LeakReport> = harness.stored_reports.iter().collect();
    assert_eq!(leak_size_a as u32, reports[0].alloc_size_bytes);
    assert_eq!(expected_offsets(STACK3), reports[0].call_stack_offsets);
    assert_eq!(leak_size_b as u32, reports[1].alloc_size_bytes);
    assert_eq!(expected_offsets(STACK4), reports[1].call_stack_offsets);
  }

  #[test]
  fn stack_traces_requested_only_after_tier1_promotion() {
    let mut harness = Harness::new();
    let leak_size = 48usize;

    assert!(!harness.detector.should_get_stack_trace_for_size(leak_size));
    let flags = harness.detector.flags();
    assert!(!flags.should_capture(leak_size));

    for _ in 0..500 {
      for _ in 0..4 {
        harness.alloc(leak_size, STACK2);
      }
      let a = harness.alloc(16, STACK0);
      let b = harness.alloc(32, STACK1);
      harness.free(a);
      harness.free(b);
    }

    assert!(harness.detector.should_get_stack_trace_for_size(leak_size));
    assert!(flags.should_capture(leak_size));
    assert!(harness.detector.stats().num_stack_tables >= 1);
    // Reports for this size carry the offsets of the one leaky stack.
    assert!(
      harness
        .stored_reports
        .iter()
        .any(|report| report.alloc_size_bytes == leak_size as u32
          && report.call_stack_offsets == expected_offsets(STACK2))
    );
  }

  #[test]
  fn frames_outside_the_mapping_are_reported_raw() {
    assert_eq!(0x80080, offset_in_mapping(0x800000, 0x200000, 0x880080));
    assert_eq!(
      0xdeadbeef,
      offset_in_mapping(0x800000, 0x200000, 0xdeadbeef)
    );
    // A zero mapping disables normalisation entirely.
    assert_eq!(0x880080, offset_in_mapping(0, 0, 0x880080));
  }

  #[test]
  fn oversize_allocations_fold_into_bucket_zero() {
    let mut harness = Harness::new();

    let ptr = harness.alloc(10_000, STACK0);
    let stats = harness.detector.stats();
    assert_eq!(1, stats.num_allocs);

    // The free must resolve to the same folded bucket.
    harness.free(ptr);
    assert_eq!(1, harness.detector.stats().num_frees);
    assert_eq!(0, harness.detector.num_live_entries());
  }

  #[test]
  fn reports_serialize_as_json() {
    let report = LeakReport {
      alloc_size_bytes: 56,
      call_stack_offsets: vec![0x100, 0xdeadbeef],
    };

    let json = serde_json::to_string(&report).expect("serialize failed");
    assert_eq!(
      r#"{"alloc_size_bytes":56,"call_stack_offsets":[256,3735928559]}"#,
      json
    );
  }
}
