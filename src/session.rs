//! Event-stream orchestration around a [`LeakDetector`].
//!
//! A session applies the pointer-keyed sampling filter, keeps the running
//! total of allocated bytes that paces the analyses, and accumulates the
//! report stream. The global hooks in the `state` module drive one session
//! under the process-wide lock; the replay driver and tests drive their own.

use super::*;

pub struct DetectorSession {
  detector: LeakDetector,
  dump_interval_bytes: u64,
  flags: Arc<StackTraceFlags>,
  last_analysis_size: u64,
  reports: BTreeSet<LeakReport>,
  sampling_factor: u64,
  scratch: Vec<LeakReport>,
  stack_depth: usize,
  total_alloc_size: u64,
}

impl DetectorSession {
  /// # Errors
  ///
  /// Returns an error if the detector's private arena cannot be mapped.
  pub fn new(config: &DetectorConfig) -> io::Result<Self> {
    let detector = LeakDetector::new(config)?;

    Ok(Self::with_detector(detector, config))
  }

  #[must_use]
  pub fn with_detector(
    detector: LeakDetector,
    config: &DetectorConfig,
  ) -> Self {
    let flags = detector.flags();

    Self {
      detector,
      dump_interval_bytes: config.dump_interval_bytes,
      flags,
      last_analysis_size: 0,
      reports: BTreeSet::new(),
      sampling_factor: config.sampling_factor,
      scratch: Vec::new(),
      stack_depth: config.stack_depth,
      total_alloc_size: 0,
    }
  }

  /// Deterministic, pointer-keyed sampling decision: an allocation and its
  /// matching free always land on the same side.
  #[must_use]
  pub fn should_sample(&self, ptr: u64) -> bool {
    hash::pointer_hash(ptr) < self.sampling_factor
  }

  #[must_use]
  pub fn should_capture_stack(&self, size: usize) -> bool {
    self.stack_depth > 0 && self.flags.should_capture(size)
  }

  /// Full allocation pipeline: byte accounting, sampling, frame gating,
  /// recording, and the periodic analysis.
  pub fn on_alloc(&mut self, ptr: u64, size: usize, frames: &[u64]) {
    self.add_total_alloc_size(size);

    if ptr == 0 || !self.should_sample(ptr) {
      return;
    }

    let frames = if self.should_capture_stack(size) {
      frames
    } else {
      &[]
    };
    self.record_sampled_alloc(ptr, size, frames);
    self.maybe_test_for_leaks(true);
  }

  pub fn on_free(&mut self, ptr: u64) {
    if ptr == 0 || !self.should_sample(ptr) {
      return;
    }

    self.record_sampled_free(ptr);
  }

  /// Counts an allocation's bytes toward the analysis cadence. Applies to
  /// every allocation, sampled or not.
  pub fn add_total_alloc_size(&mut self, size: usize) {
    self.total_alloc_size += size as u64;
  }

  /// Records an allocation that already passed the sampling filter.
  pub fn record_sampled_alloc(
    &mut self,
    ptr: u64,
    size: usize,
    frames: &[u64],
  ) {
    let depth = frames.len().min(self.stack_depth);
    self.detector.record_alloc(ptr, size, &frames[..depth]);
  }

  pub fn record_sampled_free(&mut self, ptr: u64) {
    self.detector.record_free(ptr);
  }

  /// Runs an analysis if enough bytes have been allocated since the last
  /// one. Returns whether an analysis ran.
  pub fn maybe_test_for_leaks(&mut self, do_logging: bool) -> bool {
    if self.total_alloc_size
      <= self.last_analysis_size + self.dump_interval_bytes
    {
      return false;
    }
    self.last_analysis_size = self.total_alloc_size;

    let mut scratch = mem::take(&mut self.scratch);
    self.detector.test_for_leaks(do_logging, &mut scratch);
    self.reports.extend(scratch.drain(..));
    self.scratch = scratch;

    true
  }

  /// Drains the accumulated report set, ordered by size and then by
  /// call-stack offsets.
  pub fn take_reports(&mut self) -> Vec<LeakReport> {
    mem::take(&mut self.reports).into_iter().collect()
  }

  #[must_use]
  pub fn detector(&self) -> &LeakDetector {
    &self.detector
  }

  #[must_use]
  pub fn flags(&self) -> Arc<StackTraceFlags> {
    Arc::clone(&self.flags)
  }

  #[must_use]
  pub fn stack_depth(&self) -> usize {
    self.stack_depth
  }

  #[must_use]
  pub fn total_alloc_size(&self) -> u64 {
    self.total_alloc_size
  }
}
