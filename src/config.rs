//! Process-environment toggles.
//!
//! - `SMALLOC_VERBOSE`: enables diagnostic logging on stderr.
//! - `SMALLOC_INJECTED`: announces once that this allocator is serving the process.
//!
//! A variable counts as set unless its value is empty, `0`, `false`, `off` or `no`.

use core::ffi::CStr;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::os;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Config {
  pub verbose: bool,
  pub injected: bool,
}

// Atomic cache. RESOLVED_BIT marks a settled value; the low bits carry the flags.
// A non-blocking state machine instead of OnceLock: `getenv` may run before libc
// is fully usable under LD_PRELOAD, and a re-entrant call must not wait on itself.
static STATE: AtomicU8 = AtomicU8::new(STATE_UNRESOLVED);

const STATE_UNRESOLVED: u8 = 0;
const STATE_RESOLVING: u8 = 0xFF;
const RESOLVED_BIT: u8 = 0x80;
const VERBOSE_BIT: u8 = 0x01;
const INJECTED_BIT: u8 = 0x02;

const INJECTED_BANNER: &str = "WARNING! You are using smalloc.\n";
const VERBOSE_BANNER: &str = "Logs enabled.\n";

fn encode(cfg: Config) -> u8 {
  RESOLVED_BIT
    | if cfg.verbose { VERBOSE_BIT } else { 0 }
    | if cfg.injected { INJECTED_BIT } else { 0 }
}

fn decode(v: u8) -> Config {
  Config {
    verbose: v & VERBOSE_BIT != 0,
    injected: v & INJECTED_BIT != 0,
  }
}

fn is_enabled(raw: Option<&CStr>) -> bool {
  let Some(raw) = raw else {
    return false;
  };
  let bytes = raw.to_bytes();
  !(bytes.is_empty()
    || bytes == b"0"
    || bytes.eq_ignore_ascii_case(b"false")
    || bytes.eq_ignore_ascii_case(b"off")
    || bytes.eq_ignore_ascii_case(b"no"))
}

fn getenv(name: &CStr) -> Option<&'static CStr> {
  let ptr = unsafe { libc::getenv(name.as_ptr()) };
  if ptr.is_null() {
    None
  } else {
    // SAFETY: getenv returns a NUL-terminated string owned by the environment.
    Some(unsafe { CStr::from_ptr(ptr) })
  }
}

/// Returns the resolved configuration, reading the environment on first call.
///
/// Calls racing with the first resolution (including re-entrant ones) observe the
/// default configuration rather than blocking.
pub fn config() -> Config {
  let cached = STATE.load(Ordering::Acquire);
  if cached & RESOLVED_BIT != 0 && cached != STATE_RESOLVING {
    return decode(cached);
  }
  if cached == STATE_RESOLVING {
    return Config::default();
  }

  if STATE
    .compare_exchange(
      STATE_UNRESOLVED,
      STATE_RESOLVING,
      Ordering::AcqRel,
      Ordering::Relaxed,
    )
    .is_err()
  {
    let v = STATE.load(Ordering::Acquire);
    return if v & RESOLVED_BIT != 0 && v != STATE_RESOLVING {
      decode(v)
    } else {
      Config::default()
    };
  }

  let cfg = Config {
    verbose: is_enabled(getenv(c"SMALLOC_VERBOSE")),
    injected: is_enabled(getenv(c"SMALLOC_INJECTED")),
  };
  STATE.store(encode(cfg), Ordering::Release);

  if cfg.injected {
    os::write_stderr(INJECTED_BANNER.as_bytes());
  }
  if cfg.verbose {
    os::write_stderr(VERBOSE_BANNER.as_bytes());
  }
  cfg
}

#[inline]
pub fn verbose() -> bool {
  config().verbose
}
