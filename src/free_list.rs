//! Per-arena registry of reclaimed chunks.
//!
//! Intrusive and doubly linked through the `fd`/`bk` words of each free chunk,
//! LIFO, unordered. Search is first fit. Every operation here runs under the
//! owning arena's lock.

use crate::{
  chunk::{Chunk, ChunkState, FreeChunk, MIN_FREE},
  heap::Heap,
};

pub struct FreeList {
  head: Option<FreeChunk>,
  len: usize,
}

// Links point into heaps owned by the same arena; the list moves with its lock.
unsafe impl Send for FreeList {}

impl FreeList {
  pub const fn new() -> Self {
    Self { head: None, len: 0 }
  }

  #[cfg(test)]
  pub fn head(&self) -> Option<FreeChunk> {
    self.head
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  #[cfg(test)]
  pub fn is_empty(&self) -> bool {
    self.head.is_none()
  }

  pub fn iter(&self) -> Iter {
    Iter { cur: self.head }
  }

  pub fn push_front(&mut self, chunk: FreeChunk) {
    debug_assert!(chunk.chunk().is_free());
    chunk.set_bk(None);
    chunk.set_fd(self.head);
    if let Some(old) = self.head {
      old.set_bk(Some(chunk));
    }
    self.head = Some(chunk);
    self.len += 1;
  }

  pub fn remove(&mut self, chunk: FreeChunk) {
    let fd = chunk.fd();
    let bk = chunk.bk();
    if let Some(bk) = bk {
      bk.set_fd(fd);
    }
    if let Some(fd) = fd {
      fd.set_bk(bk);
    }
    if self.head == Some(chunk) {
      self.head = fd;
    }
    chunk.set_fd(None);
    chunk.set_bk(None);
    self.len -= 1;
  }

  /// First chunk of at least `need` bytes. Not necessarily the tightest fit.
  pub fn search(&self, need: usize) -> Option<FreeChunk> {
    self.iter().find(|c| {
      debug_assert!(c.chunk().is_free());
      c.size() >= need
    })
  }

  /// Unlinks `chunk` and hands out its first `need` bytes. The tail goes back on
  /// the list when it is large enough to stand as a free chunk; otherwise the
  /// whole chunk is returned.
  pub fn split(&mut self, heap: &Heap, chunk: FreeChunk, need: usize) -> Chunk {
    let size = chunk.size();
    debug_assert!(size >= need);
    self.remove(chunk);

    if size >= need + MIN_FREE {
      let head = chunk.mark_in_use();
      head.set_size(need);

      let rest = unsafe { Chunk::from_addr(head.end()) };
      rest.init(size - need, false, true, heap as *const Heap as *mut Heap);
      let rest = rest.mark_free();
      self.push_front(rest);
      return head;
    }

    let whole = chunk.mark_in_use();
    heap.set_next_prev_in_use(whole, true);
    whole
  }

  /// Merges a just-freed chunk (not yet listed) with free neighbours in memory.
  /// Absorbed neighbours leave the list; the merged chunk is returned unlisted,
  /// with header, footer and the successor's `P` bit up to date.
  pub fn coalesce(&mut self, heap: &Heap, chunk: FreeChunk) -> FreeChunk {
    let mut merged = chunk;

    if let Some(next) = heap.next_chunk(merged.chunk())
      && let ChunkState::Free(next) = next.state()
    {
      self.remove(next);
      merged.resize(merged.size() + next.size());
    }

    if let Some(prev) = merged.chunk().prev_free() {
      self.remove(prev);
      prev.resize(prev.size() + merged.size());
      merged = prev;
    }

    heap.set_next_prev_in_use(merged.chunk(), false);
    merged
  }

  /// First-fit search followed by a split. `None` when nothing fits.
  pub fn take(&mut self, need: usize) -> Option<Chunk> {
    let found = self.search(need)?;
    let heap = unsafe { &*found.chunk().heap() };
    Some(self.split(heap, found, need))
  }
}

pub struct Iter {
  cur: Option<FreeChunk>,
}

impl Iterator for Iter {
  type Item = FreeChunk;

  fn next(&mut self) -> Option<FreeChunk> {
    let cur = self.cur?;
    self.cur = cur.fd();
    Some(cur)
  }
}
