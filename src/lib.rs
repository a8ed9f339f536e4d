//! `smalloc`: a general-purpose, thread-aware `malloc`.
//!
//! Requests are served from per-thread caches of recently freed chunks, then from
//! the free list of the arena the calling thread is bound to, then from the bump
//! pointer of that arena's active heap segment. Released chunks coalesce with free
//! neighbours in memory and go back to the arena that carved them, whichever
//! thread frees them.
//!
//! Use it from Rust as a global allocator:
//!
//! ```no_run
//! #[global_allocator]
//! static ALLOC: smalloc::Allocator = smalloc::Allocator;
//! ```
//!
//! or build with `--features c_api` and preload the `cdylib` to replace the C
//! allocator of any process. Set `SMALLOC_VERBOSE=1` for diagnostics on stderr.

#![allow(clippy::missing_safety_doc)]

mod config;
mod log;
mod os;
mod sync;
mod util;

pub mod arena;
pub mod chunk;
pub mod error;
pub mod free_list;
pub mod heap;
pub mod malloc;
pub mod registry;
pub mod tcache;

pub use chunk::{HEADER_SIZE, MIN_CHUNK, request_size};
pub use error::{AllocError, Result};
pub use malloc::{
  Allocator, GLOBAL, allocate, allocate_zeroed, deallocate, reallocate, usable_size,
};
pub use registry::{MAX_ARENAS, Options, Registry, Stats, owner_arena};
pub use tcache::{TCACHE_MAX_BINS, TCACHE_MAX_COUNT};
