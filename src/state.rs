//! Process-wide detector lifecycle and allocation hooks.
//!
//! There is at most one active detector per process. The critical section
//! is a spin lock: the hooks run inside the host's allocator, where a
//! parking mutex could allocate and recurse. A thread-local flag makes the
//! hooks strictly non-reentrant; a hook firing while the current thread is
//! already inside the detector drops its event.
//!
//! The pre-lock prologue reads only lock-free state: the sampling factor
//! and stack depth live in atomics, and the per-size capture flags are
//! published through a [`OnceLock`] so stack unwinding happens before the
//! lock is taken.

use super::*;

const MAX_STACK_DEPTH: usize = 32;

// Frames of the capture helper and hook machinery itself, stripped from
// every captured stack.
const STRIP_FRAMES: usize = 2;

static SESSION: spin::Mutex<Option<DetectorSession>> = spin::Mutex::new(None);

static SAMPLING_FACTOR: AtomicU64 = AtomicU64::new(0);
static STACK_DEPTH: AtomicUsize = AtomicUsize::new(0);

// One flag table for the life of the process, cleared on shutdown and
// shared with every detector instance installed here.
static SHARED_FLAGS: OnceLock<Arc<StackTraceFlags>> = OnceLock::new();

thread_local! {
  static IN_DETECTOR: Cell<bool> = const { Cell::new(false) };
}

struct ReentrancyGuard;

impl ReentrancyGuard {
  fn enter() -> Option<Self> {
    IN_DETECTOR.with(|flag| {
      if flag.get() {
        None
      } else {
        flag.set(true);
        Some(Self)
      }
    })
  }
}

impl Drop for ReentrancyGuard {
  fn drop(&mut self) {
    IN_DETECTOR.with(|flag| flag.set(false));
  }
}

fn shared_flags() -> &'static Arc<StackTraceFlags> {
  SHARED_FLAGS.get_or_init(|| Arc::new(StackTraceFlags::new()))
}

/// Installs the process-wide detector.
///
/// The first caller wins; a second initialization is a no-op that logs a
/// warning and returns false. A zero sampling factor refuses installation
/// outright rather than leave a hot path with no effect.
///
/// # Errors
///
/// Returns an error if the detector's private arena cannot be mapped.
pub fn initialize(config: &DetectorConfig) -> io::Result<bool> {
  if config.sampling_factor == 0 {
    tracing::warn!("not enabling leak detector: sampling factor is zero");
    return Ok(false);
  }

  let mut slot = SESSION.lock();
  if slot.is_some() {
    tracing::warn!("leak detector is already initialized");
    return Ok(false);
  }

  let flags = Arc::clone(shared_flags());
  flags.clear_all();

  let detector = LeakDetector::with_flags(config, flags)?;
  *slot = Some(DetectorSession::with_detector(detector, config));

  SAMPLING_FACTOR.store(config.sampling_factor, Ordering::Release);
  STACK_DEPTH.store(
    config.stack_depth.min(MAX_STACK_DEPTH),
    Ordering::Release,
  );

  tracing::info!(
    sampling_factor = config.sampling_factor,
    stack_depth = config.stack_depth,
    "starting leak detector"
  );

  Ok(true)
}

/// Tears the detector down, dropping any events still in flight.
pub fn shutdown() {
  let mut slot = SESSION.lock();
  let Some(session) = slot.take() else {
    return;
  };

  SAMPLING_FACTOR.store(0, Ordering::Release);
  STACK_DEPTH.store(0, Ordering::Release);
  if let Some(flags) = SHARED_FLAGS.get() {
    flags.clear_all();
  }

  let arena = session.detector().arena_stats();
  tracing::info!(
    arena_bytes = arena.bytes_allocated,
    arena_overflowed = arena.overflowed,
    "stopped leak detector"
  );

  drop(session);
}

#[must_use]
pub fn is_initialized() -> bool {
  SESSION.lock().is_some()
}

/// Allocation hook. Wire this into the host allocator's post-alloc path.
pub fn on_alloc(ptr: u64, size: usize) {
  let Some(_guard) = ReentrancyGuard::enter() else {
    return;
  };

  {
    let mut slot = SESSION.lock();
    let Some(session) = slot.as_mut() else {
      return;
    };
    session.add_total_alloc_size(size);
  }

  if ptr == 0 || !should_sample(ptr) {
    return;
  }

  // Unwind outside the lock; the flag table tells us whether this size is
  // being profiled without touching locked state.
  let mut frames: SmallVec<[u64; MAX_STACK_DEPTH]> = SmallVec::new();
  let depth = STACK_DEPTH.load(Ordering::Acquire);
  if depth > 0 && shared_flags().should_capture(size) {
    frames.resize(depth.min(MAX_STACK_DEPTH), 0);
    let captured = stack_capture::capture_stack_frames(&mut frames, STRIP_FRAMES);
    frames.truncate(captured);
  }

  let mut slot = SESSION.lock();
  if let Some(session) = slot.as_mut() {
    session.record_sampled_alloc(ptr, size, &frames);
    session.maybe_test_for_leaks(true);
  }
}

/// Free hook. Wire this into the host allocator's pre-free path.
pub fn on_free(ptr: u64) {
  let Some(_guard) = ReentrancyGuard::enter() else {
    return;
  };

  if ptr == 0 || !should_sample(ptr) {
    return;
  }

  let mut slot = SESSION.lock();
  if let Some(session) = slot.as_mut() {
    session.record_sampled_free(ptr);
  }
}

/// Drains the reports accumulated by the periodic analyses.
#[must_use]
pub fn take_reports() -> Vec<LeakReport> {
  SESSION
    .lock()
    .as_mut()
    .map(DetectorSession::take_reports)
    .unwrap_or_default()
}

fn should_sample(ptr: u64) -> bool {
  hash::pointer_hash(ptr) < SAMPLING_FACTOR.load(Ordering::Acquire)
}
