//! Per-thread stacks of recently freed small chunks.
//!
//! A cached chunk keeps its in-use header: no footer, no `F` bit, no coalescing.
//! Its arena still counts it as handed out, so reusing it means giving the same
//! payload back without touching any shared state. The stack link lives in the
//! first payload word.
//!
//! One cache per thread, serving one registry at a time. Switching registries
//! flushes it, and so does thread exit.

use core::cell::{Cell, UnsafeCell};
use core::ptr;

use crate::{
  arena,
  chunk::{Chunk, HEADER_SIZE},
  log::smalloc_log,
  registry::Registry,
  util::ALIGNMENT,
};

/// Number of size classes cached: usable sizes 16, 32, ..., 1024.
pub const TCACHE_MAX_BINS: usize = 64;

/// Maximum depth of a single bin.
pub const TCACHE_MAX_COUNT: usize = 32;

/// Cache bin for a chunk of `size` bytes (prefix included), or `None` when the
/// size is not cached.
#[inline]
pub fn bin_index(size: usize) -> Option<usize> {
  let usable = size.checked_sub(HEADER_SIZE)?;
  let bin = (usable / ALIGNMENT).checked_sub(1)?;
  (bin < TCACHE_MAX_BINS).then_some(bin)
}

pub struct ThreadCache {
  owner: *const Registry,
  heads: [Option<Chunk>; TCACHE_MAX_BINS],
  counts: [u8; TCACHE_MAX_BINS],
}

const _: () = assert!(TCACHE_MAX_COUNT <= u8::MAX as usize);

impl ThreadCache {
  pub const fn new() -> Self {
    Self {
      owner: ptr::null(),
      heads: [None; TCACHE_MAX_BINS],
      counts: [0; TCACHE_MAX_BINS],
    }
  }

  #[inline]
  pub fn len(&self, bin: usize) -> usize {
    self.counts[bin] as usize
  }

  pub fn total(&self) -> usize {
    self.counts.iter().map(|&c| c as usize).sum()
  }

  /// Pops a chunk of exactly `need` bytes.
  #[inline]
  pub fn pop(&mut self, need: usize) -> Option<Chunk> {
    let bin = bin_index(need)?;
    let chunk = self.heads[bin]?;
    debug_assert_eq!(chunk.size(), need);
    self.heads[bin] = chunk.cache_next();
    self.counts[bin] -= 1;
    smalloc_log!("tcache: hit bin {bin} -> {:p}", chunk.addr());
    Some(chunk)
  }

  /// Stashes `chunk`. Returns `false`, leaving the chunk untouched, when its size
  /// is not cached or its bin is full.
  #[inline]
  pub fn push(&mut self, chunk: Chunk) -> bool {
    let Some(bin) = bin_index(chunk.size()) else {
      return false;
    };
    if self.len(bin) >= TCACHE_MAX_COUNT {
      return false;
    }
    chunk.set_cache_next(self.heads[bin]);
    self.heads[bin] = Some(chunk);
    self.counts[bin] += 1;
    true
  }

  /// Releases every cached chunk to the arena that carved it.
  pub fn flush(&mut self) {
    let total = self.total();
    if total == 0 {
      return;
    }
    for bin in 0..TCACHE_MAX_BINS {
      while let Some(chunk) = self.heads[bin] {
        self.heads[bin] = chunk.cache_next();
        // SAFETY: cached chunks are in use and owned by nobody but this cache.
        unsafe { arena::release_to_owner(chunk) };
      }
      self.counts[bin] = 0;
    }
    smalloc_log!("tcache: flushed {total} chunks");
  }

  /// Points the cache at `registry`, flushing what another registry left behind.
  fn bind(&mut self, registry: &'static Registry) {
    let registry = registry as *const Registry;
    if self.owner != registry {
      self.flush();
      self.owner = registry;
    }
  }
}

impl Drop for ThreadCache {
  fn drop(&mut self) {
    self.flush();
  }
}

thread_local! {
  static CACHE: UnsafeCell<ThreadCache> = const { UnsafeCell::new(ThreadCache::new()) };
  static IN_CACHE: Cell<bool> = const { Cell::new(false) };
}

/// Runs `f` on the calling thread's cache, bound to `registry`.
///
/// `None` when the cache cannot be used: the call re-entered the allocator from
/// inside the cache (first access registers a TLS destructor, which may allocate),
/// or the thread is exiting and the cache is gone. Callers take the arena path.
pub fn with_cache<R>(registry: &'static Registry, f: impl FnOnce(&mut ThreadCache) -> R) -> Option<R> {
  let entered = IN_CACHE.try_with(|flag| !flag.replace(true)).ok()?;
  if !entered {
    return None;
  }

  let result = CACHE
    .try_with(|cell| {
      // SAFETY: IN_CACHE guarantees this is the only live reference.
      let cache = unsafe { &mut *cell.get() };
      cache.bind(registry);
      f(cache)
    })
    .ok();

  let _ = IN_CACHE.try_with(|flag| flag.set(false));
  result
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    arena::Arena,
    chunk::{MIN_CHUNK, request_size},
    registry::Options,
  };

  fn leak_arena() -> &'static Arena {
    Box::leak(Box::new(Arena::new(0, 64 * 1024)))
  }

  #[test]
  fn bins_follow_usable_size() {
    assert_eq!(bin_index(HEADER_SIZE), None);
    assert_eq!(bin_index(HEADER_SIZE + 16), Some(0));
    assert_eq!(bin_index(MIN_CHUNK), Some(1));
    assert_eq!(bin_index(request_size(1024).unwrap()), Some(TCACHE_MAX_BINS - 1));
    assert_eq!(bin_index(request_size(1025).unwrap()), None);
  }

  #[test]
  fn pop_is_lifo_within_a_bin() {
    let arena = leak_arena();
    let need = request_size(40).unwrap();
    let a = arena.allocate(need).unwrap();
    let b = arena.allocate(need).unwrap();
    let mut cache = ThreadCache::new();

    assert!(cache.push(a));
    assert!(cache.push(b));
    assert_eq!(cache.len(bin_index(need).unwrap()), 2);
    assert!(!b.is_free(), "cached chunks stay in use");

    assert_eq!(cache.pop(need), Some(b));
    assert_eq!(cache.pop(need), Some(a));
    assert_eq!(cache.pop(need), None);
    assert_eq!(cache.pop(need + 16), None);
  }

  #[test]
  fn full_bin_and_large_chunks_are_refused() {
    let arena = leak_arena();
    let need = request_size(64).unwrap();
    let mut cache = ThreadCache::new();
    for _ in 0..TCACHE_MAX_COUNT {
      assert!(cache.push(arena.allocate(need).unwrap()));
    }
    let spill = arena.allocate(need).unwrap();
    assert!(!cache.push(spill));
    assert_eq!(cache.total(), TCACHE_MAX_COUNT);

    let big = arena.allocate(request_size(4096).unwrap()).unwrap();
    assert!(!cache.push(big));
    unsafe {
      arena.release(big);
      arena.release(spill);
    }
  }

  #[test]
  fn flush_returns_chunks_to_their_arena() {
    let arena = leak_arena();
    let need = request_size(100).unwrap();
    let a = arena.allocate(need).unwrap();
    let _hold = arena.allocate(need).unwrap();
    let b = arena.allocate(need).unwrap();
    let mut cache = ThreadCache::new();
    cache.push(a);
    cache.push(b);

    cache.flush();
    assert_eq!(cache.total(), 0);
    // `b` was the top and retracted; `a` sits below `_hold` and is listed.
    assert_eq!(arena.free_chunks(), 1);
    assert!(a.is_free());
    assert_eq!(arena.allocate(need).unwrap(), a);
  }

  #[test]
  fn nested_access_bypasses_the_cache() {
    static REG: Registry = Registry::new(Options {
      max_arenas: 1,
      detect_concurrency: false,
      heap_bytes: 64 * 1024,
      thread_cache: true,
    });
    let outer = with_cache(&REG, |_| with_cache(&REG, |_| ()).is_none());
    assert_eq!(outer, Some(true));
    assert!(with_cache(&REG, |_| ()).is_some());
  }

  #[test]
  fn switching_registries_flushes() {
    static FIRST: Registry = Registry::new(Options {
      max_arenas: 1,
      detect_concurrency: false,
      heap_bytes: 64 * 1024,
      thread_cache: true,
    });
    static SECOND: Registry = Registry::new(Options {
      max_arenas: 1,
      detect_concurrency: false,
      heap_bytes: 64 * 1024,
      thread_cache: true,
    });
    let need = request_size(48).unwrap();
    let arena = FIRST.bind_current_thread();
    let c = arena.allocate(need).unwrap();
    let _guard = arena.allocate(need).unwrap();

    assert_eq!(with_cache(&FIRST, |cache| cache.push(c)), Some(true));
    assert_eq!(with_cache(&SECOND, |cache| cache.total()), Some(0));
    assert!(c.is_free());
    assert_eq!(with_cache(&SECOND, |cache| cache.pop(need)), Some(None));
  }
}
