//! Chunk protocol: the in-memory encoding of every allocation unit.
//!
//! ```text
//! in use:  [ heap ][ size | P | F ][ payload ................................. ]
//! free:    [ heap ][ size | P | F ][ fd ][ bk ] .............. [ size | F ]
//!          ^ chunk                  ^ payload (16-aligned)       ^ footer
//! ```
//!
//! `size` counts the whole chunk, prefix included, and is always a multiple of 16,
//! so the low four bits of the size word are free for flags:
//!
//! - `F` (bit 0): the chunk is free and registered in its arena's free list.
//! - `P` (bit 1): the chunk immediately *below* this one in memory is in use.
//!
//! `P` exists so that coalescing never reads the predecessor's footer while that
//! word is still somebody's payload. Footers do not track `P`.
//!
//! The size word is the one header word touched from two sides at once: a thread
//! freeing its block reads the size without any lock, while the owning arena,
//! under its lock, may flip that block's `P` bit. The word is therefore always
//! accessed as a relaxed atomic. The size bits of an in-use chunk never change,
//! so `Relaxed` is enough.
//!
//! Every other module goes through [`Chunk`] and [`FreeChunk`]; no raw header words
//! are read or written outside this file.

use core::{
  mem::size_of,
  ptr::NonNull,
  sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
  heap::Heap,
  util::{ALIGNMENT, align16, checked_align_up, is_aligned16},
};

const WORD: usize = size_of::<usize>();

/// Bytes between a chunk's start and its payload.
pub const HEADER_SIZE: usize = align16(2 * WORD);

/// Smallest chunk able to hold the free-chunk links plus a footer.
pub const MIN_FREE: usize = align16(HEADER_SIZE + 2 * WORD + WORD);

/// Smallest chunk ever handed out. Every chunk must be able to turn free in place.
pub const MIN_CHUNK: usize = MIN_FREE;

const FREE_BIT: usize = 0b0001;
const PREV_IN_USE_BIT: usize = 0b0010;
const FLAG_MASK: usize = ALIGNMENT - 1;
const SIZE_MASK: usize = !FLAG_MASK;

// Word offsets from the chunk start.
const HEAP_OFFSET: usize = HEADER_SIZE - 2 * WORD;
const SIZE_OFFSET: usize = HEADER_SIZE - WORD;
const FD_OFFSET: usize = HEADER_SIZE;
const BK_OFFSET: usize = HEADER_SIZE + WORD;

const _: () = assert!(HEADER_SIZE % ALIGNMENT == 0);
const _: () = assert!(MIN_FREE % ALIGNMENT == 0);
const _: () = assert!(MIN_FREE >= HEADER_SIZE + ALIGNMENT);
const _: () = assert!(FREE_BIT & SIZE_MASK == 0 && PREV_IN_USE_BIT & SIZE_MASK == 0);

// =============================================================================
// Header words
// =============================================================================

/// Packs a size and flags into one header word. `size` must be 16-aligned.
#[inline(always)]
pub const fn encode(size: usize, free: bool, prev_in_use: bool) -> usize {
  debug_assert!(size & FLAG_MASK == 0);
  (size & SIZE_MASK)
    | if free { FREE_BIT } else { 0 }
    | if prev_in_use { PREV_IN_USE_BIT } else { 0 }
}

#[inline(always)]
pub const fn word_size(word: usize) -> usize {
  word & SIZE_MASK
}

#[inline(always)]
pub const fn word_is_free(word: usize) -> bool {
  word & FREE_BIT != 0
}

#[inline(always)]
pub const fn word_prev_in_use(word: usize) -> bool {
  word & PREV_IN_USE_BIT != 0
}

/// Chunk size needed to serve a `size`-byte request: prefix plus the 16-rounded
/// payload, rounded again, never below `MIN_CHUNK`. `None` on arithmetic overflow.
#[inline]
pub const fn request_size(size: usize) -> Option<usize> {
  let Some(payload) = checked_align_up(size, ALIGNMENT) else {
    return None;
  };
  let Some(total) = payload.checked_add(HEADER_SIZE) else {
    return None;
  };
  match checked_align_up(total, ALIGNMENT) {
    Some(need) if need < MIN_CHUNK => Some(MIN_CHUNK),
    other => other,
  }
}

// =============================================================================
// Chunk views
// =============================================================================

/// A chunk header in heap memory, in whichever state its `F` bit says.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Chunk(NonNull<u8>);

/// A chunk whose `F` bit is set: it additionally carries links and a footer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FreeChunk(Chunk);

/// The two meanings the same bytes can have, selected by the `F` bit.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChunkState {
  InUse(Chunk),
  Free(FreeChunk),
}

impl Chunk {
  /// # Safety
  /// `addr` must be the start of a chunk prefix inside a live heap mapping, with at
  /// least `MIN_CHUNK` writable bytes. Every accessor relies on this.
  #[inline(always)]
  pub unsafe fn from_addr(addr: *mut u8) -> Self {
    debug_assert!(!addr.is_null());
    Self(unsafe { NonNull::new_unchecked(addr) })
  }

  /// # Safety
  /// `payload` must have been returned by [`Chunk::payload`].
  #[inline(always)]
  pub unsafe fn from_payload(payload: *mut u8) -> Self {
    debug_assert!(is_aligned16(payload));
    unsafe { Self::from_addr(payload.sub(HEADER_SIZE)) }
  }

  #[inline(always)]
  pub fn addr(self) -> *mut u8 {
    self.0.as_ptr()
  }

  #[inline(always)]
  pub fn payload(self) -> NonNull<u8> {
    unsafe { self.0.add(HEADER_SIZE) }
  }

  /// First byte past this chunk.
  #[inline(always)]
  pub fn end(self) -> *mut u8 {
    self.addr().wrapping_add(self.size())
  }

  #[inline(always)]
  fn word_at(self, offset: usize) -> *mut usize {
    unsafe { self.addr().add(offset) as *mut usize }
  }

  #[inline(always)]
  fn size_word(self) -> &'static AtomicUsize {
    // SAFETY: the word is aligned and lives in a mapping that is never unmapped
    // while chunks of it are reachable.
    unsafe { AtomicUsize::from_ptr(self.word_at(SIZE_OFFSET)) }
  }

  #[inline(always)]
  fn word(self) -> usize {
    self.size_word().load(Ordering::Relaxed)
  }

  #[inline(always)]
  fn set_word(self, word: usize) {
    self.size_word().store(word, Ordering::Relaxed)
  }

  #[inline(always)]
  pub fn size(self) -> usize {
    word_size(self.word())
  }

  /// Payload bytes available to the caller.
  #[inline(always)]
  pub fn usable(self) -> usize {
    self.size() - HEADER_SIZE
  }

  #[inline(always)]
  pub fn is_free(self) -> bool {
    word_is_free(self.word())
  }

  #[inline(always)]
  pub fn prev_in_use(self) -> bool {
    word_prev_in_use(self.word())
  }

  #[inline]
  pub fn state(self) -> ChunkState {
    if self.is_free() {
      ChunkState::Free(FreeChunk(self))
    } else {
      ChunkState::InUse(self)
    }
  }

  /// Writes a complete header, discarding whatever flags were there.
  #[inline]
  pub fn init(self, size: usize, free: bool, prev_in_use: bool, heap: *mut Heap) {
    self.set_word(encode(size, free, prev_in_use));
    self.set_heap(heap);
  }

  /// Replaces the size, keeping every flag bit.
  #[inline]
  pub fn set_size(self, size: usize) {
    debug_assert!(size & FLAG_MASK == 0);
    self.set_word((self.word() & FLAG_MASK) | size);
  }

  /// Replaces size and free state, keeping `P`.
  #[inline]
  pub fn set_header(self, size: usize, free: bool) {
    self.set_word(encode(size, free, self.prev_in_use()));
  }

  #[inline]
  pub fn set_prev_in_use(self, on: bool) {
    if on {
      self.size_word().fetch_or(PREV_IN_USE_BIT, Ordering::Relaxed);
    } else {
      self.size_word().fetch_and(!PREV_IN_USE_BIT, Ordering::Relaxed);
    }
  }

  #[inline(always)]
  pub fn heap(self) -> *mut Heap {
    unsafe { (self.word_at(HEAP_OFFSET) as *mut *mut Heap).read() }
  }

  #[inline(always)]
  pub fn set_heap(self, heap: *mut Heap) {
    unsafe { (self.word_at(HEAP_OFFSET) as *mut *mut Heap).write(heap) }
  }

  /// Address where the next chunk's prefix would start. The caller decides whether
  /// that address still belongs to the heap.
  #[inline(always)]
  pub fn next_addr(self) -> *mut u8 {
    self.end()
  }

  /// The chunk directly below this one, if `P` says it is free. Its footer is only
  /// read after the flag has vouched for it.
  #[inline]
  pub fn prev_free(self) -> Option<FreeChunk> {
    if self.prev_in_use() {
      return None;
    }
    let footer = unsafe { self.addr().sub(WORD) as *const usize };
    let prev_size = word_size(unsafe { footer.read() });
    debug_assert!(prev_size >= MIN_FREE);
    let prev = unsafe { Chunk::from_addr(self.addr().sub(prev_size)) };
    debug_assert!(prev.is_free() && prev.size() == prev_size);
    Some(FreeChunk(prev))
  }

  /// Marks this chunk free, writes its footer and clears its links.
  #[inline]
  pub fn mark_free(self) -> FreeChunk {
    debug_assert!(self.size() >= MIN_FREE);
    self.set_header(self.size(), true);
    let free = FreeChunk(self);
    free.write_footer();
    free.set_fd(None);
    free.set_bk(None);
    free
  }

  // Thread-cache stack link. Lives in the first payload word; the chunk stays in use.

  #[inline(always)]
  pub fn cache_next(self) -> Option<Chunk> {
    let raw = unsafe { self.word_at(FD_OFFSET).read() } as *mut u8;
    NonNull::new(raw).map(Chunk)
  }

  #[inline(always)]
  pub fn set_cache_next(self, next: Option<Chunk>) {
    let raw = next.map_or(0, |c| c.addr() as usize);
    unsafe { self.word_at(FD_OFFSET).write(raw) }
  }
}

impl FreeChunk {
  #[inline(always)]
  pub fn chunk(self) -> Chunk {
    self.0
  }

  #[inline(always)]
  pub fn size(self) -> usize {
    self.0.size()
  }

  #[inline]
  fn link(self, offset: usize) -> Option<FreeChunk> {
    let raw = unsafe { self.0.word_at(offset).read() } as *mut u8;
    NonNull::new(raw).map(|p| FreeChunk(Chunk(p)))
  }

  #[inline]
  fn set_link(self, offset: usize, to: Option<FreeChunk>) {
    let raw = to.map_or(0, |c| c.0.addr() as usize);
    unsafe { self.0.word_at(offset).write(raw) }
  }

  #[inline(always)]
  pub fn fd(self) -> Option<FreeChunk> {
    self.link(FD_OFFSET)
  }

  #[inline(always)]
  pub fn bk(self) -> Option<FreeChunk> {
    self.link(BK_OFFSET)
  }

  #[inline(always)]
  pub fn set_fd(self, to: Option<FreeChunk>) {
    self.set_link(FD_OFFSET, to)
  }

  #[inline(always)]
  pub fn set_bk(self, to: Option<FreeChunk>) {
    self.set_link(BK_OFFSET, to)
  }

  /// Rewrites header size (keeping `P`) and the matching footer.
  #[inline]
  pub fn resize(self, size: usize) {
    self.0.set_header(size, true);
    self.write_footer();
  }

  #[inline]
  pub fn write_footer(self) {
    let size = self.0.size();
    unsafe {
      (self.0.addr().add(size - WORD) as *mut usize).write(encode(size, true, false));
    }
  }

  #[inline]
  pub fn footer(self) -> usize {
    unsafe { (self.0.addr().add(self.0.size() - WORD) as *const usize).read() }
  }

  /// Clears `F`, keeping size and `P`. Links and footer become payload.
  #[inline]
  pub fn mark_in_use(self) -> Chunk {
    self.0.set_header(self.0.size(), false);
    self.0
  }
}
