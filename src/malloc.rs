//! Allocation entry points: request routing through the thread cache, the bound
//! arena's free list and the heap bump pointer, and the reverse on release.

use core::{
  alloc::{GlobalAlloc, Layout},
  mem::size_of,
  ptr::{self, null_mut},
};

use crate::{
  arena,
  chunk::{Chunk, request_size},
  error::{AllocError, Result},
  log::smalloc_log,
  registry::{Options, Registry},
  tcache,
  util::{ALIGNMENT, align_up},
};

/// The process-wide allocator state behind [`allocate`], [`deallocate`],
/// [`Allocator`] and the C entry points.
pub static GLOBAL: Registry = Registry::new(Options::DEFAULT);

impl Registry {
  /// Returns a 16-aligned block of at least `size` bytes, or null when `size` is
  /// zero or memory is exhausted.
  pub fn allocate(&'static self, size: usize) -> *mut u8 {
    if size == 0 {
      return null_mut();
    }
    match self.try_allocate(size) {
      Ok(chunk) => chunk.payload().as_ptr(),
      Err(e) => {
        smalloc_log!("allocate({size}): {e}");
        null_mut()
      }
    }
  }

  fn try_allocate(&'static self, size: usize) -> Result<Chunk> {
    let need = request_size(size).ok_or(AllocError::SizeOverflow { size })?;
    if let Some(chunk) = self.cache_pop(need) {
      return Ok(chunk);
    }
    self.bind_current_thread().allocate(need)
  }

  #[inline]
  fn cache_pop(&'static self, need: usize) -> Option<Chunk> {
    if !self.options().thread_cache {
      return None;
    }
    tcache::with_cache(self, |cache| cache.pop(need)).flatten()
  }

  /// Releases a block. Null is a no-op. The block may have been allocated on any
  /// thread; it goes back to the arena that carved it.
  ///
  /// # Safety
  /// `ptr` must be null or a live block returned by this registry's allocation
  /// functions, and must not be used afterwards.
  pub unsafe fn deallocate(&'static self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }
    let chunk = unsafe { Chunk::from_payload(ptr) };
    debug_assert!(!chunk.is_free());

    if self.options().thread_cache
      && tcache::with_cache(self, |cache| cache.push(chunk)) == Some(true)
    {
      return;
    }
    unsafe { arena::release_to_owner(chunk) };
  }

  /// Resizes a block, in place when its chunk is already large enough.
  ///
  /// Null `ptr` behaves as [`allocate`](Self::allocate); a zero `size` releases
  /// the block and returns null. On failure the old block is left intact.
  ///
  /// # Safety
  /// Same contract as [`deallocate`](Self::deallocate) for `ptr`.
  pub unsafe fn reallocate(&'static self, ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
      return self.allocate(size);
    }
    if size == 0 {
      unsafe { self.deallocate(ptr) };
      return null_mut();
    }

    let chunk = unsafe { Chunk::from_payload(ptr) };
    let Some(need) = request_size(size) else {
      smalloc_log!("reallocate({size}): {}", AllocError::SizeOverflow { size });
      return null_mut();
    };
    if chunk.size() >= need {
      return ptr;
    }

    let moved = self.allocate(size);
    if !moved.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(ptr, moved, chunk.usable().min(size));
        self.deallocate(ptr);
      }
    }
    moved
  }

  /// Zero-filled block of `count * size` bytes; null on overflow or a zero total.
  pub fn allocate_zeroed(&'static self, count: usize, size: usize) -> *mut u8 {
    let Some(total) = count.checked_mul(size) else {
      smalloc_log!("allocate_zeroed({count}, {size}): size overflow");
      return null_mut();
    };
    let ptr = self.allocate(total);
    if !ptr.is_null() {
      // Reused chunks carry old payloads and cache links.
      unsafe { ptr::write_bytes(ptr, 0, total) };
    }
    ptr
  }
}

/// Bytes the caller may use at `ptr`, 0 for null. At least the requested size.
///
/// # Safety
/// `ptr` must be null or a live block returned by any registry.
pub unsafe fn usable_size(ptr: *mut u8) -> usize {
  if ptr.is_null() {
    return 0;
  }
  unsafe { Chunk::from_payload(ptr) }.usable()
}

#[inline]
pub fn allocate(size: usize) -> *mut u8 {
  GLOBAL.allocate(size)
}

/// # Safety
/// See [`Registry::deallocate`].
#[inline]
pub unsafe fn deallocate(ptr: *mut u8) {
  unsafe { GLOBAL.deallocate(ptr) }
}

/// # Safety
/// See [`Registry::reallocate`].
#[inline]
pub unsafe fn reallocate(ptr: *mut u8, size: usize) -> *mut u8 {
  unsafe { GLOBAL.reallocate(ptr, size) }
}

#[inline]
pub fn allocate_zeroed(count: usize, size: usize) -> *mut u8 {
  GLOBAL.allocate_zeroed(count, size)
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// `#[global_allocator]` adapter over [`GLOBAL`].
///
/// Chunks are 16-aligned. Larger alignments over-allocate and keep the address of
/// the underlying block in the word just below the aligned pointer; `dealloc`
/// receives the same layout and knows to look there.
pub struct Allocator;

const BACKREF: usize = size_of::<*mut u8>();

unsafe fn alloc_overaligned(layout: Layout) -> *mut u8 {
  let Some(total) = layout.size().checked_add(layout.align()) else {
    return null_mut();
  };
  let raw = GLOBAL.allocate(total);
  if raw.is_null() {
    return raw;
  }
  // `raw` is 16-aligned and `align` >= 32, so at least 16 bytes precede `aligned`.
  let offset = align_up(raw as usize + 1, layout.align()) - raw as usize;
  unsafe {
    let aligned = raw.add(offset);
    aligned.sub(BACKREF).cast::<*mut u8>().write(raw);
    aligned
  }
}

unsafe fn dealloc_overaligned(ptr: *mut u8) {
  unsafe {
    let raw = ptr.sub(BACKREF).cast::<*mut u8>().read();
    GLOBAL.deallocate(raw);
  }
}

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return unsafe { alloc_overaligned(layout) };
    }
    GLOBAL.allocate(layout.size().max(1))
  }

  unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
    if layout.align() > ALIGNMENT {
      unsafe { dealloc_overaligned(ptr) };
      return;
    }
    unsafe { GLOBAL.deallocate(ptr) }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() <= ALIGNMENT {
      return unsafe { GLOBAL.reallocate(ptr, new_size.max(1)) };
    }

    let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
    let moved = unsafe { alloc_overaligned(new_layout) };
    if !moved.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(ptr, moved, layout.size().min(new_size));
        dealloc_overaligned(ptr);
      }
    }
    moved
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() <= ALIGNMENT {
      return GLOBAL.allocate_zeroed(1, layout.size().max(1));
    }
    let ptr = unsafe { alloc_overaligned(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
    }
    ptr
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  GLOBAL.allocate(size)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  unsafe { GLOBAL.deallocate(ptr) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  GLOBAL.allocate_zeroed(nmemb, size)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  unsafe { GLOBAL.reallocate(ptr, size) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  unsafe { usable_size(ptr) }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chunk::HEADER_SIZE;

  static PLAIN: Registry = Registry::new(Options {
    max_arenas: 2,
    detect_concurrency: false,
    heap_bytes: 256 * 1024,
    thread_cache: false,
  });

  static CACHED: Registry = Registry::new(Options {
    max_arenas: 2,
    detect_concurrency: false,
    heap_bytes: 256 * 1024,
    thread_cache: true,
  });

  #[test]
  fn zero_and_null_edges() {
    assert!(PLAIN.allocate(0).is_null());
    unsafe { PLAIN.deallocate(null_mut()) };
    assert!(PLAIN.allocate_zeroed(usize::MAX, 2).is_null());
    assert!(PLAIN.allocate(usize::MAX - 8).is_null());
    assert!(PLAIN.allocate(1 << 20).is_null(), "larger than one segment");
    assert_eq!(unsafe { usable_size(null_mut()) }, 0);
  }

  #[test]
  fn payload_starts_after_the_prefix() {
    let p = PLAIN.allocate(10);
    let chunk = unsafe { Chunk::from_payload(p) };
    assert_eq!(chunk.addr() as usize + HEADER_SIZE, p as usize);
    assert!(unsafe { usable_size(p) } >= 10);
    unsafe { PLAIN.deallocate(p) };
  }

  #[test]
  fn cached_free_is_reused_by_same_size() {
    let p = CACHED.allocate(200);
    unsafe { CACHED.deallocate(p) };
    assert!(!unsafe { Chunk::from_payload(p) }.is_free());
    assert_eq!(CACHED.allocate(200), p);
    unsafe { CACHED.deallocate(p) };
  }

  #[test]
  fn reallocate_grows_in_place_when_possible() {
    unsafe {
      let p = PLAIN.allocate(24);
      let usable = usable_size(p);
      assert_eq!(PLAIN.reallocate(p, usable), p);

      p.write_bytes(0xAB, usable);
      let q = PLAIN.reallocate(p, 4 * usable);
      assert_ne!(q, p);
      assert!((0..usable).all(|i| *q.add(i) == 0xAB));

      assert!(PLAIN.reallocate(q, 0).is_null());
      let r = PLAIN.reallocate(null_mut(), 8);
      assert!(!r.is_null());
      PLAIN.deallocate(r);
    }
  }

  #[test]
  fn zeroed_memory_is_zero_even_when_reused() {
    unsafe {
      let p = PLAIN.allocate(256);
      let hold = PLAIN.allocate(16);
      p.write_bytes(0xFF, 256);
      PLAIN.deallocate(p);
      let z = PLAIN.allocate_zeroed(16, 16);
      assert!((0..256).all(|i| *z.add(i) == 0));
      PLAIN.deallocate(z);
      PLAIN.deallocate(hold);
    }
  }

  #[test]
  fn global_alloc_serves_large_alignments() {
    let a = Allocator;
    unsafe {
      for align in [32, 64, 4096] {
        let layout = Layout::from_size_align(100, align).unwrap();
        let p = a.alloc_zeroed(layout);
        assert!(!p.is_null());
        assert_eq!(p as usize % align, 0);
        assert!((0..100).all(|i| *p.add(i) == 0));
        p.write_bytes(0x5A, 100);

        let q = a.realloc(p, layout, 300);
        assert_eq!(q as usize % align, 0);
        assert!((0..100).all(|i| *q.add(i) == 0x5A));
        a.dealloc(q, Layout::from_size_align(300, align).unwrap());
      }

      let p = a.alloc(Layout::from_size_align(0, 8).unwrap());
      assert!(!p.is_null());
      a.dealloc(p, Layout::from_size_align(0, 8).unwrap());
    }
  }
}
