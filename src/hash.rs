//! Streaming 32-bit hashing for call stacks and pointer sampling.
//!
//! The call-stack interner hashes frame arrays incrementally, one frame per
//! trie level, so the hash is exposed in three stages: `hash_step` folds a
//! chunk of bytes into a running state, `hash_finish` applies the final
//! avalanche, and `hash` combines both for one-shot use. Splitting a byte
//! stream at any 4-byte boundary produces the same digest as hashing it
//! whole.

/// One-shot hash of `data`. Equivalent to `hash_finish(hash_step(0, data))`.
#[must_use]
pub fn hash(data: &[u8]) -> u32 {
  if data.is_empty() {
    return 0;
  }

  hash_finish(hash_step(0, data))
}

/// Folds `data` into the running state `hash` without avalanching.
#[must_use]
pub fn hash_step(hash: u32, data: &[u8]) -> u32 {
  let mut hash = hash;
  let mut chunks = data.chunks_exact(4);

  for chunk in &mut chunks {
    hash = hash.wrapping_add(get16(chunk));
    let tmp = (get16(&chunk[2..]) << 11) ^ hash;
    hash = (hash << 16) ^ tmp;
    hash = hash.wrapping_add(hash >> 11);
  }

  let rem = chunks.remainder();
  match rem.len() {
    3 => {
      hash = hash.wrapping_add(get16(rem));
      hash ^= hash << 16;
      hash ^= ((rem[2] as i8 as i32) << 18) as u32;
      hash = hash.wrapping_add(hash >> 11);
    }
    2 => {
      hash = hash.wrapping_add(get16(rem));
      hash ^= hash << 11;
      hash = hash.wrapping_add(hash >> 17);
    }
    1 => {
      hash = hash.wrapping_add(rem[0] as i8 as i32 as u32);
      hash ^= hash << 10;
      hash = hash.wrapping_add(hash >> 1);
    }
    _ => {}
  }

  hash
}

/// Applies the final avalanche pass to a running state.
#[must_use]
pub fn hash_finish(hash: u32) -> u32 {
  let mut hash = hash;

  hash ^= hash << 3;
  hash = hash.wrapping_add(hash >> 5);
  hash ^= hash << 4;
  hash = hash.wrapping_add(hash >> 17);
  hash ^= hash << 25;
  hash = hash.wrapping_add(hash >> 6);

  hash
}

/// Maps a pointer value to its top eight hash bits, in `0..256`.
///
/// Used for the sampling decision: an event is kept iff
/// `pointer_hash(ptr) < sampling_factor`. The multiplier comes from the
/// Farmhash finalizer, which mixes well even for page-aligned addresses.
#[must_use]
pub fn pointer_hash(ptr: u64) -> u64 {
  const MULTIPLIER: u64 = 0x9ddf_ea08_eb38_2d69;

  ptr.wrapping_mul(MULTIPLIER) >> 56
}

fn get16(data: &[u8]) -> u32 {
  u32::from(u16::from_le_bytes([data[0], data[1]]))
}
