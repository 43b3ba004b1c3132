//! Interning of unique call stacks.

use std::collections::HashMap;
use std::sync::Arc;

use nohash_hasher::BuildNoHashHasher;

use crate::hash;

/// An immutable, interned call stack.
///
/// Identity is the `Arc` pointer: the manager guarantees that equal frame
/// sequences intern to the same allocation, so pointer equality is content
/// equality. The hash is computed once at interning time and is the only
/// part of the stack consulted by the per-size tables.
#[derive(Debug)]
pub struct CallStack {
  frames: Box<[u64]>,
  hash: u32,
}

impl CallStack {
  #[must_use]
  pub fn depth(&self) -> usize {
    self.frames.len()
  }

  /// Raw instruction-pointer values, innermost frame first.
  #[must_use]
  pub fn frames(&self) -> &[u64] {
    &self.frames
  }

  #[must_use]
  pub fn hash(&self) -> u32 {
    self.hash
  }
}

#[derive(Debug, Default)]
struct Node {
  call_stack: Option<Arc<CallStack>>,
  children: HashMap<u64, Node, BuildNoHashHasher<u64>>,
  // Running digest of the frames on the path from the root to this node.
  hash_state: u32,
}

/// Owns every unique [`CallStack`].
///
/// Implemented as a trie keyed one frame per level, walked from the
/// outermost frame inward, so stacks sharing a common prefix share trie
/// nodes. The digest is folded incrementally along the path and finalised
/// only at the leaf.
#[derive(Debug, Default)]
pub struct CallStackManager {
  num_call_stacks: usize,
  root: Node,
}

impl CallStackManager {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the canonical stack for `frames`, creating it on first sight.
  ///
  /// Repeated calls with equal content return clones of the same `Arc`.
  pub fn intern(&mut self, frames: &[u64]) -> Arc<CallStack> {
    let mut node = &mut self.root;

    for &frame in frames.iter().rev() {
      let parent_state = node.hash_state;
      node = node.children.entry(frame).or_insert_with(|| Node {
        call_stack: None,
        children: HashMap::default(),
        hash_state: hash::hash_step(parent_state, &frame.to_le_bytes()),
      });
    }

    if let Some(call_stack) = &node.call_stack {
      return Arc::clone(call_stack);
    }

    let call_stack = Arc::new(CallStack {
      frames: frames.to_vec().into_boxed_slice(),
      hash: hash::hash_finish(node.hash_state),
    });

    node.call_stack = Some(Arc::clone(&call_stack));
    self.num_call_stacks += 1;

    call_stack
  }

  /// Number of distinct stacks interned so far.
  #[must_use]
  pub fn len(&self) -> usize {
    self.num_call_stacks
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.num_call_stacks == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const STACK0: &[u64] = &[0xaabbccdd, 0x11223344, 0x55667788, 0x99887766];
  const STACK1: &[u64] = &[0xdeadbeef, 0x900df00d, 0xcafedeed, 0xdeafbabe];
  const STACK2: &[u64] = &[0x12345678, 0xabcdef01, 0xfdecab98];
  const STACK3: &[u64] = &[
    0xdead0001, 0xbeef0002, 0x900d0003, 0xf00d0004, 0xcafe0005, 0xdeed0006,
    0xdeaf0007, 0xbabe0008,
  ];

  #[test]
  fn equal_content_interns_to_same_pointer() {
    let mut manager = CallStackManager::new();

    let first = manager.intern(STACK0);
    let second = manager.intern(STACK0);

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(1, manager.len());
  }

  #[test]
  fn distinct_content_interns_to_distinct_pointers() {
    let mut manager = CallStackManager::new();

    let a = manager.intern(STACK0);
    let b = manager.intern(STACK1);

    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(2, manager.len());
    assert_eq!(STACK0, a.frames());
    assert_eq!(STACK1, b.frames());
  }

  #[test]
  fn truncated_stack_is_distinct() {
    let mut manager = CallStackManager::new();

    let long = manager.intern(STACK3);
    let short = manager.intern(&STACK3[..4]);

    assert!(!Arc::ptr_eq(&long, &short));
    assert_eq!(8, long.depth());
    assert_eq!(4, short.depth());
  }

  #[test]
  fn hashes_are_nonzero_and_unique() {
    let mut manager = CallStackManager::new();

    let hashes = [
      manager.intern(STACK0).hash(),
      manager.intern(STACK1).hash(),
      manager.intern(STACK2).hash(),
      manager.intern(STACK3).hash(),
    ];

    for (i, &a) in hashes.iter().enumerate() {
      assert_ne!(0, a);
      for &b in &hashes[i + 1..] {
        assert_ne!(a, b);
      }
    }
  }

  #[test]
  fn hash_covers_exactly_depth_frames() {
    let mut manager = CallStackManager::new();

    let full = manager.intern(STACK3);
    let reduced = manager.intern(&STACK3[..STACK3.len() - 1]);

    assert_ne!(full.hash(), reduced.hash());
  }

  #[test]
  fn interned_pointer_is_stable_across_other_interns() {
    let mut manager = CallStackManager::new();

    let first = manager.intern(STACK2);
    for _ in 0..100 {
      let _ = manager.intern(STACK3);
    }
    let again = manager.intern(STACK2);

    assert!(Arc::ptr_eq(&first, &again));
  }
}
