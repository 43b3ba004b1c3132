/// Controls how the detector samples events and runs its analyses.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
  /// The number of consecutive suspicions before a call stack is reported,
  /// within an already-suspected size bucket.
  pub call_stack_suspicion_threshold: u32,
  /// Bytes of cumulative allocation between leak analyses. Counts all
  /// allocations, sampled or not.
  pub dump_interval_bytes: u64,
  /// Base address of the host binary's text mapping, for offset
  /// normalisation of reported frames. Zero disables normalisation.
  pub mapping_addr: u64,
  /// Size of the host binary's text mapping.
  pub mapping_size: u64,
  /// Keep an event iff the pointer hash is below this value, in `0..=256`.
  /// 256 samples everything; 0 disables the detector.
  pub sampling_factor: u64,
  /// The number of consecutive suspicions before an allocation size is
  /// reported and gets a call-stack table attached.
  pub size_suspicion_threshold: u32,
  /// Maximum frames captured per sampled allocation.
  pub stack_depth: usize,
  /// Whether analyses dump intermediate ranked lists to the log.
  pub verbose: bool,
}

impl Default for DetectorConfig {
  fn default() -> Self {
    Self {
      call_stack_suspicion_threshold: 4,
      dump_interval_bytes: 32 * 1024 * 1024,
      mapping_addr: 0,
      mapping_size: 0,
      sampling_factor: 1,
      size_suspicion_threshold: 4,
      stack_depth: 4,
      verbose: false,
    }
  }
}

impl DetectorConfig {
  /// Builder-style helper to set the text mapping used for offset
  /// normalisation.
  #[must_use]
  pub fn with_mapping(mut self, addr: u64, size: u64) -> Self {
    self.mapping_addr = addr;
    self.mapping_size = size;
    self
  }

  #[must_use]
  pub fn with_sampling_factor(mut self, factor: u64) -> Self {
    self.sampling_factor = factor.min(256);
    self
  }

  #[must_use]
  pub fn with_stack_depth(mut self, depth: usize) -> Self {
    self.stack_depth = depth;
    self
  }

  #[must_use]
  pub fn with_dump_interval_bytes(mut self, bytes: u64) -> Self {
    self.dump_interval_bytes = bytes;
    self
  }

  #[must_use]
  pub fn with_suspicion_thresholds(mut self, size: u32, call_stack: u32) -> Self {
    self.size_suspicion_threshold = size;
    self.call_stack_suspicion_threshold = call_stack;
    self
  }

  #[must_use]
  pub fn with_verbose(mut self, verbose: bool) -> Self {
    self.verbose = verbose;
    self
  }
}
