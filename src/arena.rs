//! Arenas: independent allocation contexts, one lock each.
//!
//! An arena owns an append-only list of heaps (the youngest is the active one) and
//! a free list. Its lock guards the free list and the bump pointer of every one of
//! its heaps. Chunks remember their heap, and heaps remember their arena, so a
//! chunk freed on any thread is always released under the lock of the arena that
//! carved it.

use core::{
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
  chunk::Chunk,
  error::{AllocError, Result},
  free_list::FreeList,
  heap::Heap,
  log::smalloc_log,
  sync::SpinMutex,
};

struct ArenaState {
  /// Oldest heap; heaps are chained through `Heap::next`.
  heaps: *mut Heap,
  /// Youngest heap, the only one carved from.
  active: *mut Heap,
  free_list: FreeList,
}

// Heap pointers refer to mappings owned by this arena for the life of the process.
unsafe impl Send for ArenaState {}

pub struct Arena {
  id: usize,
  heap_bytes: usize,
  state: SpinMutex<ArenaState>,
  heap_count: AtomicUsize,
  mapped_bytes: AtomicUsize,
}

impl Arena {
  pub const fn new(id: usize, heap_bytes: usize) -> Self {
    Self {
      id,
      heap_bytes,
      state: SpinMutex::new(ArenaState {
        heaps: null_mut(),
        active: null_mut(),
        free_list: FreeList::new(),
      }),
      heap_count: AtomicUsize::new(0),
      mapped_bytes: AtomicUsize::new(0),
    }
  }

  #[inline]
  pub fn id(&self) -> usize {
    self.id
  }

  pub fn heap_count(&self) -> usize {
    self.heap_count.load(Ordering::Relaxed)
  }

  pub fn mapped_bytes(&self) -> usize {
    self.mapped_bytes.load(Ordering::Relaxed)
  }

  /// Largest chunk this arena can ever hand out.
  pub fn capacity(&self) -> usize {
    Heap::capacity(self.heap_bytes)
  }

  pub fn free_chunks(&self) -> usize {
    self.state.lock().free_list.len()
  }

  /// Reserves a new heap segment and makes it the active one.
  pub fn add_heap(&'static self) -> Result<()> {
    let mut state = self.state.lock();
    self.grow(&mut state).map(|_| ())
  }

  fn grow(&'static self, state: &mut ArenaState) -> Result<NonNull<Heap>> {
    let heap = Heap::reserve(self, self.heap_bytes)?;
    let mapped = unsafe { heap.as_ref().mapped() };

    if let Some(mut tail) = NonNull::new(state.active) {
      unsafe { tail.as_mut().set_next(heap.as_ptr()) };
    } else {
      state.heaps = heap.as_ptr();
    }
    state.active = heap.as_ptr();

    let count = self.heap_count.fetch_add(1, Ordering::Relaxed) + 1;
    self.mapped_bytes.fetch_add(mapped, Ordering::Relaxed);
    smalloc_log!("arena {}: heap #{count} at {:p}", self.id, heap.as_ptr());
    Ok(heap)
  }

  /// Carves from the active heap, growing the arena once if the heap is full.
  fn carve(&'static self, state: &mut ArenaState, need: usize) -> Result<Chunk> {
    let capacity = self.capacity();
    if need > capacity {
      return Err(AllocError::ExceedsSegment { need, capacity });
    }

    if let Some(mut active) = NonNull::new(state.active)
      && let Some(chunk) = unsafe { active.as_mut() }.carve(need)
    {
      return Ok(chunk);
    }

    let mut heap = self.grow(state)?;
    unsafe { heap.as_mut() }
      .carve(need)
      .ok_or(AllocError::ExceedsSegment { need, capacity })
  }

  /// Serves a `need`-byte chunk from the free list, else from the bump region.
  pub fn allocate(&'static self, need: usize) -> Result<Chunk> {
    let mut state = self.state.lock();

    if let Some(chunk) = state.free_list.take(need) {
      smalloc_log!(
        "arena {}: free-list hit {:p} size={} need={need}",
        self.id,
        chunk.addr(),
        chunk.size()
      );
      return Ok(chunk);
    }

    let chunk = self.carve(&mut state, need)?;
    smalloc_log!("arena {}: carved {:p} need={need}", self.id, chunk.addr());
    Ok(chunk)
  }

  /// Marks `chunk` free, merges it with free neighbours and either retracts the
  /// active heap's top or lists the result.
  ///
  /// Only the active heap is ever carved again, so a free top on an older heap is
  /// listed like any other chunk.
  ///
  /// # Safety
  /// `chunk` must be an in-use chunk carved by this arena and not cached anywhere.
  pub unsafe fn release(&self, chunk: Chunk) {
    let mut state = self.state.lock();
    let heap_ptr = chunk.heap();
    let heap = unsafe { &mut *heap_ptr };
    debug_assert!(core::ptr::eq(heap.arena(), self));

    let merged = state.free_list.coalesce(heap, chunk.mark_free());
    if heap_ptr == state.active && heap.is_top(merged.chunk()) {
      heap.retract(merged.chunk());
      smalloc_log!(
        "arena {}: top shrink, bump back to {:p}",
        self.id,
        merged.chunk().addr()
      );
      return;
    }

    state.free_list.push_front(merged);
    smalloc_log!(
      "arena {}: listed {:p} size={}",
      self.id,
      merged.chunk().addr(),
      merged.size()
    );
  }

  /// Walks every heap under the lock. Used by introspection only.
  pub fn for_each_heap(&self, mut f: impl FnMut(&Heap)) {
    let state = self.state.lock();
    let mut cur = state.heaps;
    while let Some(heap) = NonNull::new(cur) {
      let heap = unsafe { heap.as_ref() };
      f(heap);
      cur = heap.next();
    }
  }
}

/// The arena that carved `chunk`, found through the chunk's heap reference.
///
/// # Safety
/// `chunk` must have been carved by some arena.
#[inline]
pub unsafe fn owner_of(chunk: Chunk) -> &'static Arena {
  unsafe { &*(*chunk.heap()).arena() }
}

/// Releases `chunk` to the arena that carved it, whichever thread is calling.
///
/// # Safety
/// Same contract as [`Arena::release`].
#[inline]
pub unsafe fn release_to_owner(chunk: Chunk) {
  unsafe { owner_of(chunk).release(chunk) }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chunk::request_size;

  fn leak_arena(heap_bytes: usize) -> &'static Arena {
    Box::leak(Box::new(Arena::new(7, heap_bytes)))
  }

  fn need(n: usize) -> usize {
    request_size(n).unwrap()
  }

  #[test]
  fn first_allocation_grows_lazily() {
    let arena = leak_arena(64 * 1024);
    assert_eq!(arena.heap_count(), 0);
    let c = arena.allocate(need(100)).unwrap();
    assert_eq!(arena.heap_count(), 1);
    assert!(core::ptr::eq(unsafe { owner_of(c) }, arena));
    assert_eq!(unsafe { owner_of(c) }.id(), 7);
  }

  #[test]
  fn full_heap_triggers_growth_and_old_heap_still_releases() {
    let arena = leak_arena(64 * 1024);
    let big = arena.capacity() - 64;
    let first = arena.allocate(big).unwrap();
    let second = arena.allocate(need(200)).unwrap();
    assert_eq!(arena.heap_count(), 2);
    assert_ne!(first.heap(), second.heap());

    // `first` is the top of the older heap, which is never carved again: it is
    // listed instead of retracted.
    unsafe { arena.release(first) };
    assert_eq!(arena.free_chunks(), 1);
    let mut bumps = Vec::new();
    arena.for_each_heap(|h| bumps.push(h.bump() == first.end()));
    assert_eq!(bumps, vec![true, false]);

    let again = arena.allocate(big).unwrap();
    assert_eq!(again, first);
    assert_eq!(arena.free_chunks(), 0);
    assert_eq!(arena.heap_count(), 2);
  }

  #[test]
  fn active_top_retracts_older_top_is_listed() {
    let arena = leak_arena(64 * 1024);
    let half = need(40 * 1024);
    for _ in 0..50 {
      let p = arena.allocate(half).unwrap();
      let q = arena.allocate(half).unwrap();
      unsafe {
        arena.release(p);
        arena.release(q);
      }
    }
    assert_eq!(arena.heap_count(), 2);
    assert_eq!(arena.free_chunks(), 1);
  }

  #[test]
  fn oversized_request_fails_without_growing() {
    let arena = leak_arena(64 * 1024);
    let err = arena.allocate(arena.capacity() + 16).unwrap_err();
    assert!(matches!(err, AllocError::ExceedsSegment { .. }));
    assert_eq!(arena.heap_count(), 0);
  }

  #[test]
  fn released_middle_chunk_is_reused_from_free_list() {
    let arena = leak_arena(64 * 1024);
    let a = arena.allocate(need(64)).unwrap();
    let _b = arena.allocate(need(64)).unwrap();
    unsafe { release_to_owner(a) };
    assert_eq!(arena.free_chunks(), 1);
    let again = arena.allocate(need(64)).unwrap();
    assert_eq!(again, a);
    assert_eq!(arena.free_chunks(), 0);
  }

  #[test]
  fn explicit_add_heap_becomes_active() {
    let arena = leak_arena(64 * 1024);
    arena.add_heap().unwrap();
    arena.add_heap().unwrap();
    assert_eq!(arena.heap_count(), 2);
    assert!(arena.mapped_bytes() >= 2 * 64 * 1024);
    let c = arena.allocate(need(16)).unwrap();
    let mut last = null_mut();
    arena.for_each_heap(|h| last = h as *const Heap as *mut Heap);
    assert_eq!(c.heap(), last);
  }
}
