//! Allocation failure taxonomy.
//!
//! Zero-size requests are not errors; they are answered with null before any of
//! these can arise. Misuse (foreign pointers, double frees) is undefined behaviour
//! and is never reported here.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  /// The OS refused to reserve a new heap segment.
  #[error("out of memory: could not reserve a {bytes}-byte heap segment")]
  OutOfMemory { bytes: usize },

  /// The request cannot fit in a single heap segment.
  #[error("request of {need} bytes exceeds segment capacity of {capacity} bytes")]
  ExceedsSegment { need: usize, capacity: usize },

  /// Rounding the request up to a chunk size overflowed.
  #[error("request of {size} bytes overflows chunk size arithmetic")]
  SizeOverflow { size: usize },
}

pub type Result<T> = core::result::Result<T, AllocError>;
