//! Private bump arena backing the address map.
//!
//! The detector runs inside allocation hooks, so its own bookkeeping must
//! never touch the observed allocator. The arena maps anonymous memory
//! directly and hands out bump-allocated blocks from it. Blocks are never
//! returned individually; the whole arena is unmapped when it is dropped at
//! detector shutdown.

use std::io;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use memmap2::MmapMut;
use spin::Mutex;

/// Granularity of anonymous mappings. Oversized requests get a dedicated
/// mapping of their own size.
const CHUNK_SIZE: usize = 1 << 20;

/// Telemetry snapshot for the arena.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArenaStats {
  pub bytes_allocated: usize,
  pub bytes_mapped: usize,
  pub num_chunks: usize,
  pub overflowed: bool,
}

#[derive(Debug)]
struct ArenaInner {
  bytes_allocated: usize,
  chunks: Vec<MmapMut>,
  // Bump offset into the last chunk.
  offset: usize,
}

/// Mmap-backed bump allocator.
///
/// Blocks handed out by [`Arena::alloc`] stay valid until the arena is
/// dropped; the mappings themselves never move even when the internal chunk
/// list grows.
#[derive(Debug)]
pub struct Arena {
  inner: Mutex<ArenaInner>,
  overflowed: AtomicBool,
}

impl Arena {
  /// Maps the first chunk.
  ///
  /// # Errors
  ///
  /// Returns an error if the initial anonymous mapping fails.
  pub fn new() -> io::Result<Self> {
    let first = MmapMut::map_anon(CHUNK_SIZE)?;

    Ok(Self {
      inner: Mutex::new(ArenaInner {
        bytes_allocated: 0,
        chunks: vec![first],
        offset: 0,
      }),
      overflowed: AtomicBool::new(false),
    })
  }

  /// Allocates one zeroed `T`. `T` must not require `Drop`; the arena never
  /// runs destructors.
  #[must_use]
  pub fn alloc<T>(&self) -> Option<NonNull<T>> {
    self
      .alloc_bytes(size_of::<T>(), align_of::<T>())
      .map(NonNull::cast)
  }

  /// Allocates a zeroed array of `count` `T`s and returns a pointer to its
  /// first element.
  #[must_use]
  pub fn alloc_array<T>(&self, count: usize) -> Option<NonNull<T>> {
    let size = size_of::<T>().checked_mul(count)?;

    self.alloc_bytes(size, align_of::<T>()).map(NonNull::cast)
  }

  /// Allocates `size` zeroed bytes aligned to `align`.
  ///
  /// Returns `None` and latches the overflow flag if the kernel refuses a
  /// new mapping. `align` must not exceed the page size.
  #[must_use]
  pub fn alloc_bytes(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
    let mut inner = self.inner.lock();

    let mut offset = (inner.offset + align - 1) & !(align - 1);

    let remaining = inner
      .chunks
      .last()
      .map_or(0, |chunk| chunk.len().saturating_sub(offset));

    if size > remaining {
      let chunk_len = CHUNK_SIZE.max(size);
      let chunk = match MmapMut::map_anon(chunk_len) {
        Ok(chunk) => chunk,
        Err(_) => {
          self.overflowed.store(true, Ordering::Release);
          return None;
        }
      };

      inner.chunks.push(chunk);
      offset = 0;
    }

    // Anonymous mappings are zero-filled and the bump pointer never reuses a
    // range, so the returned block is always zeroed.
    let chunk = inner.chunks.last_mut()?;
    let ptr = unsafe { chunk.as_mut_ptr().add(offset) };

    inner.offset = offset + size;
    inner.bytes_allocated += size;

    NonNull::new(ptr)
  }

  /// Whether any allocation has failed since the arena was created.
  #[must_use]
  pub fn overflowed(&self) -> bool {
    self.overflowed.load(Ordering::Acquire)
  }

  #[must_use]
  pub fn stats(&self) -> ArenaStats {
    let inner = self.inner.lock();

    ArenaStats {
      bytes_allocated: inner.bytes_allocated,
      bytes_mapped: inner.chunks.iter().map(|chunk| chunk.len()).sum(),
      num_chunks: inner.chunks.len(),
      overflowed: self.overflowed(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn allocations_are_distinct_and_zeroed() {
    let arena = Arena::new().expect("mmap failed");

    let a = arena.alloc::<u64>().expect("alloc failed");
    let b = arena.alloc::<u64>().expect("alloc failed");
    assert_ne!(a, b);

    unsafe {
      assert_eq!(0, *a.as_ptr());
      assert_eq!(0, *b.as_ptr());
      *a.as_ptr() = 17;
      assert_eq!(0, *b.as_ptr());
    }
  }

  #[test]
  fn alignment_is_respected() {
    let arena = Arena::new().expect("mmap failed");

    let _ = arena.alloc_bytes(1, 1).expect("alloc failed");
    let ptr = arena.alloc_bytes(16, 8).expect("alloc failed");
    assert_eq!(0, ptr.as_ptr() as usize % 8);
  }

  #[test]
  fn large_requests_get_their_own_chunk() {
    let arena = Arena::new().expect("mmap failed");

    let big = 4 << 20;
    let ptr = arena.alloc_bytes(big, 8).expect("alloc failed");
    unsafe {
      // Touch both ends of the block.
      *ptr.as_ptr() = 1;
      *ptr.as_ptr().add(big - 1) = 1;
    }

    let stats = arena.stats();
    assert!(stats.num_chunks >= 2);
    assert!(stats.bytes_mapped >= big);
  }

  #[test]
  fn stats_track_allocated_bytes() {
    let arena = Arena::new().expect("mmap failed");

    let _ = arena.alloc_array::<u32>(100).expect("alloc failed");

    let stats = arena.stats();
    assert_eq!(400, stats.bytes_allocated);
    assert!(!stats.overflowed);
  }
}
