//! Heap segments: one OS mapping each, carved with a bump pointer.
//!
//! The segment descriptor sits at the start of its own mapping, so creating a heap
//! never asks any allocator for memory:
//!
//! ```text
//! [ Heap descriptor ][ chunk ][ chunk ] ... [ chunk ][ unexplored ........ ]
//! ^ mapping          ^ base                          ^ bump                ^ end
//! ```
//!
//! All fields except `arena` are mutated only under the owning arena's lock.

use core::{
  mem::size_of,
  ptr::{NonNull, null_mut},
};

use crate::{
  arena::Arena,
  chunk::{Chunk, HEADER_SIZE},
  error::{AllocError, Result},
  log::smalloc_log,
  os,
  util::{align16, checked_align_up},
};

/// Default segment size, descriptor included.
pub const DEFAULT_HEAP_BYTES: usize = 16 * 1024 * 1024;

/// Bytes reserved for the descriptor at the start of every mapping.
pub const DESCRIPTOR_SIZE: usize = align16(size_of::<Heap>());

#[repr(C, align(16))]
pub struct Heap {
  /// Owning arena. Written once at creation, read without the lock.
  arena: *const Arena,
  /// Next-younger heap of the same arena.
  next: *mut Heap,
  base: *mut u8,
  bump: *mut u8,
  end: *mut u8,
  mapped: usize,
}

impl Heap {
  /// Mapping length used for a `bytes`-sized segment.
  pub fn mapping_len(bytes: usize) -> Option<usize> {
    checked_align_up(bytes.max(DESCRIPTOR_SIZE + HEADER_SIZE), os::page_size())
  }

  /// Largest chunk a fresh `bytes`-sized segment can hold.
  pub fn capacity(bytes: usize) -> usize {
    Self::mapping_len(bytes).map_or(0, |len| len - DESCRIPTOR_SIZE)
  }

  /// Reserves a new segment and writes its descriptor. The heap is not linked into
  /// any arena yet.
  pub fn reserve(arena: *const Arena, bytes: usize) -> Result<NonNull<Heap>> {
    let len = Self::mapping_len(bytes).ok_or(AllocError::OutOfMemory { bytes })?;
    let raw = unsafe { os::os_mmap(len) };
    let Some(raw) = NonNull::new(raw) else {
      smalloc_log!("heap: mmap of {len} bytes failed");
      return Err(AllocError::OutOfMemory { bytes: len });
    };

    let heap = raw.cast::<Heap>();
    unsafe {
      let base = raw.as_ptr().add(DESCRIPTOR_SIZE);
      heap.as_ptr().write(Heap {
        arena,
        next: null_mut(),
        base,
        bump: base,
        end: raw.as_ptr().add(len),
        mapped: len,
      });
    }
    smalloc_log!(
      "heap: reserved {:p}..{:p} ({len} bytes)",
      raw.as_ptr(),
      unsafe { raw.as_ptr().add(len) }
    );
    Ok(heap)
  }

  /// Returns the mapping to the OS.
  ///
  /// # Safety
  /// No chunk of this heap may be referenced afterwards, and the heap must not be
  /// linked into an arena that is still in use.
  #[cfg(test)]
  pub unsafe fn unmap(heap: NonNull<Heap>) {
    unsafe {
      let len = heap.as_ref().mapped;
      os::os_munmap(heap.as_ptr().cast(), len);
    }
  }

  #[inline(always)]
  pub fn arena(&self) -> *const Arena {
    self.arena
  }

  #[inline(always)]
  pub fn next(&self) -> *mut Heap {
    self.next
  }

  #[inline(always)]
  pub fn set_next(&mut self, next: *mut Heap) {
    self.next = next;
  }

  #[inline(always)]
  pub fn base(&self) -> *mut u8 {
    self.base
  }

  #[inline(always)]
  pub fn bump(&self) -> *mut u8 {
    self.bump
  }

  #[inline(always)]
  pub fn end(&self) -> *mut u8 {
    self.end
  }

  #[inline(always)]
  pub fn mapped(&self) -> usize {
    self.mapped
  }

  /// Bytes between the bump pointer and the end of the segment.
  #[cfg(test)]
  pub fn remaining(&self) -> usize {
    self.end as usize - self.bump as usize
  }

  #[cfg(test)]
  pub fn contains(&self, p: *const u8) -> bool {
    let addr = p as usize;
    addr >= self.base as usize && addr < self.bump as usize
  }

  /// Bump-allocates a `need`-byte chunk with a 16-aligned payload, or `None` if the
  /// segment is exhausted. Growing is the arena's job.
  pub fn carve(&mut self, need: usize) -> Option<Chunk> {
    debug_assert!(need % 16 == 0 && need >= HEADER_SIZE);
    let start = self.bump as usize;
    let payload = align16(start + HEADER_SIZE);
    let hdr = payload - HEADER_SIZE;
    let end = self.end as usize;
    if hdr > end || end - hdr < need {
      return None;
    }

    let chunk = unsafe { Chunk::from_addr(hdr as *mut u8) };
    // Only the active heap is carved, and on it a free chunk touching the top is
    // always absorbed by `retract`. Whatever sits below the bump pointer is in use.
    chunk.init(need, false, true, self as *mut Heap);
    self.bump = chunk.end();
    Some(chunk)
  }

  /// The chunk following `chunk` in memory, if it lies below the bump pointer.
  #[inline]
  pub fn next_chunk(&self, chunk: Chunk) -> Option<Chunk> {
    let next = chunk.next_addr();
    if (next as usize) < self.bump as usize {
      Some(unsafe { Chunk::from_addr(next) })
    } else {
      None
    }
  }

  /// Updates `P` on the chunk after `chunk`, if there is one.
  #[inline]
  pub fn set_next_prev_in_use(&self, chunk: Chunk, on: bool) {
    if let Some(next) = self.next_chunk(chunk) {
      next.set_prev_in_use(on);
    }
  }

  /// Whether `chunk` ends exactly at the bump pointer.
  #[inline]
  pub fn is_top(&self, chunk: Chunk) -> bool {
    chunk.end() == self.bump
  }

  /// Moves the bump pointer back to the start of the topmost chunk.
  #[inline]
  pub fn retract(&mut self, chunk: Chunk) {
    debug_assert!(self.is_top(chunk));
    self.bump = chunk.addr();
  }
}
