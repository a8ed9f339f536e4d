//! The arena table and thread binding.
//!
//! A `Registry` is the whole allocator state: a fixed table of arenas created on
//! first use and never torn down. The process allocator is the static
//! [`GLOBAL`](crate::GLOBAL); other registries can be declared as statics with
//! different [`Options`] (tests and benches do).

use core::{
  cell::Cell,
  sync::atomic::{AtomicUsize, Ordering},
};
use std::sync::OnceLock;

use crate::{
  arena::{self, Arena},
  chunk::Chunk,
  config,
  heap::DEFAULT_HEAP_BYTES,
  log::smalloc_log,
  os,
};

/// Hard upper bound on arenas per registry.
pub const MAX_ARENAS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
  /// Arena count, or its upper bound when `detect_concurrency` is set.
  pub max_arenas: usize,
  /// Size the arena table by the number of online CPUs.
  pub detect_concurrency: bool,
  /// Size of each heap segment, descriptor included.
  pub heap_bytes: usize,
  /// Route small frees and allocations through the per-thread cache.
  pub thread_cache: bool,
}

impl Options {
  pub const DEFAULT: Options = Options {
    max_arenas: MAX_ARENAS,
    detect_concurrency: true,
    heap_bytes: DEFAULT_HEAP_BYTES,
    thread_cache: true,
  };

  /// Number of arenas a registry built with these options will create.
  pub fn arena_count(&self) -> usize {
    let limit = self.max_arenas.clamp(1, MAX_ARENAS);
    if self.detect_concurrency {
      os::cpu_count().clamp(1, limit)
    } else {
      limit
    }
  }
}

impl Default for Options {
  fn default() -> Self {
    Self::DEFAULT
  }
}

/// Point-in-time view of a registry's footprint.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
  pub arenas: usize,
  pub heaps: usize,
  pub mapped_bytes: usize,
  pub free_chunks: usize,
}

pub struct Registry {
  arenas: [Arena; MAX_ARENAS],
  count: OnceLock<usize>,
  options: Options,
}

impl Registry {
  pub const fn new(options: Options) -> Self {
    let mut arenas = [const { Arena::new(0, 0) }; MAX_ARENAS];
    let mut i = 0;
    while i < MAX_ARENAS {
      arenas[i] = Arena::new(i, options.heap_bytes);
      i += 1;
    }
    Self {
      arenas,
      count: OnceLock::new(),
      options,
    }
  }

  #[inline]
  pub fn options(&self) -> &Options {
    &self.options
  }

  /// One-time setup: size the table and give every arena its first heap.
  /// Concurrent first callers wait on the same gate.
  fn init(&'static self) -> usize {
    *self.count.get_or_init(|| {
      config::config();
      let count = self.options.arena_count();
      for arena in &self.arenas[..count] {
        if let Err(e) = arena.add_heap() {
          if arena.id() == 0 {
            os::fatal("cannot reserve the first heap");
          }
          smalloc_log!("arena {}: no initial heap ({e}), will grow on demand", arena.id());
        }
      }
      smalloc_log!("registry: {count} arenas, {} bytes per heap", self.options.heap_bytes);
      count
    })
  }

  pub fn arena_count(&'static self) -> usize {
    self.init()
  }

  /// The calling thread's arena. The first call in a process initializes the
  /// registry; the thread's index is fixed on its first call anywhere.
  #[inline]
  pub fn bind_current_thread(&'static self) -> &'static Arena {
    let count = self.init();
    &self.arenas[thread_index() % count]
  }

  /// Id of the calling thread's arena.
  pub fn bound_arena(&'static self) -> usize {
    self.bind_current_thread().id()
  }

  pub fn arena(&'static self, id: usize) -> Option<&'static Arena> {
    self.arenas[..self.init()].get(id)
  }

  pub fn stats(&'static self) -> Stats {
    let count = self.init();
    self.arenas[..count]
      .iter()
      .fold(Stats { arenas: count, ..Stats::default() }, |mut s, a| {
        s.heaps += a.heap_count();
        s.mapped_bytes += a.mapped_bytes();
        s.free_chunks += a.free_chunks();
        s
      })
  }
}

/// Id of the arena that carved the allocation at `ptr`.
///
/// # Safety
/// `ptr` must be a live allocation returned by any registry.
pub unsafe fn owner_arena(ptr: *mut u8) -> usize {
  unsafe { arena::owner_of(Chunk::from_payload(ptr)).id() }
}

// =============================================================================
// Thread index
// =============================================================================

const UNBOUND: usize = usize::MAX;

static NEXT_THREAD_INDEX: AtomicUsize = AtomicUsize::new(0);

thread_local! {
  // Const-initialized and without a destructor: reading it never allocates.
  static THREAD_INDEX: Cell<usize> = const { Cell::new(UNBOUND) };
}

/// Sequential per-thread index, assigned on first use.
pub fn thread_index() -> usize {
  THREAD_INDEX.with(|idx| {
    let cur = idx.get();
    if cur != UNBOUND {
      return cur;
    }
    let next = NEXT_THREAD_INDEX.fetch_add(1, Ordering::Relaxed);
    idx.set(next);
    next
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;

  static FOUR: Registry = Registry::new(Options {
    max_arenas: 4,
    detect_concurrency: false,
    heap_bytes: 64 * 1024,
    thread_cache: false,
  });

  #[test]
  fn arena_count_respects_bounds() {
    let opts = Options { max_arenas: 0, detect_concurrency: false, ..Options::DEFAULT };
    assert_eq!(opts.arena_count(), 1);
    let opts = Options { max_arenas: 1000, detect_concurrency: false, ..Options::DEFAULT };
    assert_eq!(opts.arena_count(), MAX_ARENAS);
    let detected = Options::DEFAULT.arena_count();
    assert!((1..=MAX_ARENAS).contains(&detected));
  }

  #[test]
  fn init_gives_each_arena_one_heap() {
    let stats = FOUR.stats();
    assert_eq!(stats.arenas, 4);
    assert!(stats.heaps >= 4);
    assert!(FOUR.arena(3).is_some());
    assert!(FOUR.arena(4).is_none());
  }

  #[test]
  fn binding_is_stable_and_follows_thread_index() {
    let first = FOUR.bound_arena();
    assert_eq!(FOUR.bound_arena(), first);
    assert_eq!(first, thread_index() % 4);

    let other = thread::spawn(|| (thread_index(), FOUR.bound_arena()))
      .join()
      .unwrap();
    assert_eq!(other.1, other.0 % 4);
    assert_ne!(other.0, thread_index());
  }

  #[test]
  fn concurrent_first_binds_initialize_once() {
    static LATE: Registry = Registry::new(Options {
      max_arenas: 3,
      detect_concurrency: false,
      heap_bytes: 64 * 1024,
      thread_cache: false,
    });
    let handles: Vec<_> = (0..8).map(|_| thread::spawn(|| LATE.bound_arena())).collect();
    for h in handles {
      assert!(h.join().unwrap() < 3);
    }
    assert_eq!(LATE.stats().heaps, 3);
  }
}
